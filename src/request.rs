//! Generation requests and the request queue. Every unit of work flowing
//! into the generator is a [`GenRequest`]; the queue is strictly FIFO with
//! front-prepend as the only reordering primitive, and rounds let an agent
//! drain exactly the work that belongs to the current generation step.

use std::collections::{BTreeSet, VecDeque};

use crate::bnt::BntNode;
use crate::constraint::ConstraintSet;
use crate::gen_mode::GenModeFlags;
use crate::generator::Instruction;
use crate::memory::{MemBank, PhysicalRegion};
use crate::restore::RestoreGroup;
use crate::state_element::StateElement;
use crate::vm::GenPageRequest;

/// Operand roles in an instruction request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandKind {
    /// A GPR written by the instruction.
    GprTarget,
    /// A GPR read by the instruction.
    GprSource,
    /// An FPR written by the instruction.
    FprTarget,
    /// An FPR read by the instruction.
    FprSource,
    /// An immediate field.
    Immediate,
}

/// One operand slot of an instruction request.
#[derive(Clone, Debug)]
pub struct OperandRequest {
    /// Operand name, e.g. `rd` or `simm12`.
    pub name: String,
    pub kind: OperandKind,
    /// Encoding position of the field.
    pub lsb: u32,
    /// Width of the field in bits.
    pub size: u32,
    /// Caller-imposed value constraint; the full field range when absent.
    pub value_constraint: Option<ConstraintSet>,
}

impl OperandRequest {
    pub fn new(name: &str, kind: OperandKind, lsb: u32, size: u32) -> Self {
        Self { name: name.to_string(), kind, lsb, size, value_constraint: None }
    }

    pub fn with_constraint(mut self, constraint: ConstraintSet) -> Self {
        self.value_constraint = Some(constraint);
        self
    }
}

/// Branch-specific attributes of an instruction request.
#[derive(Clone, Debug)]
pub struct BranchRequest {
    pub conditional: bool,
    /// Forced target; chosen from the offset operand range when absent.
    pub target: Option<u64>,
}

/// One instruction-generation request.
#[derive(Clone, Debug)]
pub struct GenInstructionRequest {
    /// Instruction name, e.g. `ADDI`.
    pub name: String,
    /// Fixed opcode bits of the encoding.
    pub opcode: u32,
    /// Instruction size in bytes.
    pub size: u32,
    pub operands: Vec<OperandRequest>,
    pub branch: Option<BranchRequest>,
}

impl GenInstructionRequest {
    pub fn new(name: &str, opcode: u32, size: u32) -> Self {
        Self { name: name.to_string(), opcode, size, operands: Vec::new(), branch: None }
    }

    pub fn with_operand(mut self, operand: OperandRequest) -> Self {
        self.operands.push(operand);
        self
    }

    pub fn with_branch(mut self, branch: BranchRequest) -> Self {
        self.branch = Some(branch);
        self
    }
}

/// Requests the sequence agent services.
#[derive(Debug)]
pub enum GenSequenceRequest {
    /// Finalise a fully generated instruction.
    CommitInstruction(Instruction),
    /// Process the BNT nodes accumulated this round.
    BranchNotTaken,
    /// Generate the not-taken path of one node.
    ProcessBntNode(BntNode),
    /// Enter speculative generation for one node.
    ProcessSpeculativeBntNode(BntNode),
    /// Unwind the innermost speculative path, restoring recorded state.
    ExitSpeculativeBnt,
    /// Re-execute previously generated code.
    ReExecution { address: u64, max_instructions: u32 },
    /// Jump generation to the target address.
    BranchToTarget { target: u64, no_bnt: bool },
    /// Restore-sequence step: set a register on model and simulator.
    SetRegister { name: String, value: u64, mask: u64 },
    /// Restore-sequence step: write memory on model and simulator.
    WriteMemoryBlock { bank: MemBank, pa: u64, va: u64, bytes: Vec<u8> },
    /// Update one register field and propagate system effects.
    UpdateRegisterField { register: String, field: String, value: u64 },
    /// Apply a PE state update parked in the data station.
    UpdatePeState { record_id: u64 },
    /// Begin a restore loop at the current PC.
    BeginRestoreLoop {
        loop_register_index: u32,
        simulation_count: u32,
        restore_count: u32,
        exclusions: BTreeSet<RestoreGroup>,
    },
    /// Emit the restore sequence for the current loop iteration.
    RestoreLoopState,
    /// End the innermost restore loop.
    EndRestoreLoop { loop_id: u32 },
    /// Wrap up generation for this thread.
    EndOfTest,
}

/// State actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenStateAction {
    Push,
    Pop,
    Enable,
    Disable,
    Set,
}

/// State a state request manipulates.
#[derive(Clone, Debug)]
pub enum GenStateSpec {
    GenMode(GenModeFlags),
    Pc(u64),
    PrivilegeLevel(u32),
    BootPc(u64),
}

/// One generator-state request.
#[derive(Clone, Debug)]
pub struct GenStateRequest {
    pub action: GenStateAction,
    pub state: GenStateSpec,
}

/// Requests the exception agent services.
#[derive(Clone, Debug)]
pub enum GenExceptionRequest {
    /// An exception event reported by the simulator.
    HandleException { id: u32, description: String },
    /// An exception-return retired on the simulator.
    ExceptionReturn,
    /// Update the modelled handler table address.
    UpdateHandlerAddress { address: u64 },
}

/// Requests the virtual-memory agent services.
#[derive(Clone, Debug)]
pub enum GenVirtualMemoryRequest {
    /// Generate a virtual address with alignment and room.
    GenVa { size: u64, align: u64, is_instr: bool, range: Option<ConstraintSet> },
    /// Generate a physical address with alignment and room.
    GenPa { size: u64, align: u64, bank: MemBank },
    /// Find (or create) the VA mapping a given PA.
    GenVaForPa { pa: u64, bank: MemBank, size: u64, is_instr: bool },
    /// Map a virtual address range.
    GenPage { va: u64, size: u64, is_instr: bool, request: GenPageRequest },
    /// Register and map a physical region.
    PhysicalRegion { region: PhysicalRegion },
    /// Re-derive the translation state from the live registers.
    UpdateVm,
}

/// Callback requests crossing back toward the front-end; handlers are the
/// native strategies registered at setup.
#[derive(Debug)]
pub enum GenCallbackRequest {
    /// Service an accurate BNT node through the current BNT hook.
    Bnt(BntNode),
    /// Notify the front-end of an exception return.
    Eret,
}

/// Read-only queries answered through the query-result store.
#[derive(Clone, Debug)]
pub enum GenQueryRequest {
    /// A named generator state value (PC, privilege, mode bits).
    GenState { name: String },
    /// Information about the page covering an address.
    PageInfo { address: u64, is_instr: bool },
    /// The register index backing a named register.
    RegisterIndex { name: String },
    /// Number of committed instructions.
    InstructionCount,
}

/// Answers produced by the query and virtual-memory agents.
#[derive(Clone, Debug, PartialEq)]
pub enum GenQueryResult {
    Value(u64),
    ValuePair(u64, u64),
    Text(String),
    Missing,
}

/// A batch of state elements to establish, in priority order.
#[derive(Debug)]
pub struct GenStateTransitionRequest {
    pub elements: Vec<StateElement>,
}

/// The request sum type; each variant family names the agent servicing it.
#[derive(Debug)]
pub enum GenRequest {
    Instruction(GenInstructionRequest),
    Sequence(GenSequenceRequest),
    State(GenStateRequest),
    Exception(GenExceptionRequest),
    VirtualMemory(GenVirtualMemoryRequest),
    Callback(GenCallbackRequest),
    Query(GenQueryRequest),
    StateTransition(GenStateTransitionRequest),
}

/// Marks the end of one generation round: the queue depth that must remain
/// untouched while the round drains.
#[derive(Clone, Copy, Debug)]
pub struct RoundMark(usize);

/// The per-thread request queue.
#[derive(Default)]
pub struct GenRequestQueue {
    queue: VecDeque<GenRequest>,
}

impl GenRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Appends a request at the back of the queue.
    pub fn enqueue(&mut self, request: GenRequest) {
        self.queue.push_back(request);
    }

    /// Inserts a request at the front, ahead of all queued work.
    pub fn prepend_request(&mut self, request: GenRequest) {
        self.queue.push_front(request);
    }

    /// Prepends a batch preserving its order: the first element of the batch
    /// is the next request popped.
    pub fn prepend_requests(&mut self, requests: Vec<GenRequest>) {
        for request in requests.into_iter().rev() {
            self.queue.push_front(request);
        }
    }

    /// Starts a generation round: everything currently queued is outside the
    /// round; work prepended from now on belongs to it.
    pub fn start_round(&mut self) -> RoundMark {
        RoundMark(self.queue.len())
    }

    /// Whether the round's work has drained. Requests at or below the round
    /// mark are never touched while the round runs.
    pub fn round_finished(&self, mark: RoundMark) -> bool {
        self.queue.len() <= mark.0
    }

    /// Pops the front request.
    pub fn pop_front(&mut self) -> Option<GenRequest> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_instruction(name: &str) -> GenRequest {
        GenRequest::Instruction(GenInstructionRequest::new(name, 0x13, 4))
    }

    fn request_name(request: &GenRequest) -> String {
        match request {
            GenRequest::Instruction(instruction) => instruction.name.clone(),
            _ => panic!("expected instruction request"),
        }
    }

    #[test]
    fn round_drains_prepended_work_before_older_requests() {
        // Enqueue ADDI, start a round, prepend SUB then MUL;
        // the round pops MUL, SUB, then finishes; ADDI comes after.
        let mut queue = GenRequestQueue::new();
        queue.prepend_request(named_instruction("ADDI"));
        let mark = queue.start_round();
        queue.prepend_request(named_instruction("SUB"));
        queue.prepend_request(named_instruction("MUL"));

        let mut seen = Vec::new();
        while !queue.round_finished(mark) {
            seen.push(request_name(&queue.pop_front().unwrap()));
        }
        assert_eq!(seen, vec!["MUL", "SUB"]);
        assert_eq!(request_name(&queue.pop_front().unwrap()), "ADDI");
    }

    #[test]
    fn round_never_observes_requests_behind_the_mark() {
        let mut queue = GenRequestQueue::new();
        queue.prepend_request(named_instruction("BEHIND"));
        let mark = queue.start_round();
        assert!(queue.round_finished(mark));
        // Prepending inside the round is observed before the round ends.
        queue.prepend_request(named_instruction("INSIDE"));
        assert!(!queue.round_finished(mark));
        assert_eq!(request_name(&queue.pop_front().unwrap()), "INSIDE");
        assert!(queue.round_finished(mark));
    }

    #[test]
    fn prepend_requests_preserves_batch_order() {
        let mut queue = GenRequestQueue::new();
        queue.enqueue(named_instruction("LAST"));
        queue.prepend_requests(vec![
            named_instruction("A"),
            named_instruction("B"),
            named_instruction("C"),
        ]);
        let names: Vec<String> = std::iter::from_fn(|| queue.pop_front())
            .map(|r| request_name(&r))
            .collect();
        assert_eq!(names, vec!["A", "B", "C", "LAST"]);
    }
}
