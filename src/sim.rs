//! The instruction-set simulator seam. The generator talks to whatever
//! reference executor the embedder provides through [`SimApi`];
//! [`ScriptedSimApi`] is the scripted double used by the crate's own tests
//! and by embedders who want to dry-run generation without an ISS.

use std::collections::{HashMap, VecDeque};

use crate::error::Error;

/// One register update reported by a simulator step.
#[derive(Clone, Debug)]
pub struct RegUpdate {
    /// Physical register name, e.g. `x5` or `satp`.
    pub name: String,
    pub value: u64,
    pub mask: u64,
    /// `"read"` or `"write"` as reported by the simulator.
    pub access: String,
}

/// One memory update reported by a simulator step.
#[derive(Clone, Debug)]
pub struct MemUpdate {
    pub bank: u32,
    pub va: u64,
    pub pa: u64,
    pub bytes: Vec<u8>,
}

/// Kind of an exception event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionUpdateKind {
    /// An exception was taken.
    Exception,
    /// An exception-return instruction retired.
    ExceptionReturn,
}

/// One exception event reported by a simulator step.
#[derive(Clone, Debug)]
pub struct ExceptionUpdate {
    pub kind: ExceptionUpdateKind,
    /// Architectural cause id.
    pub id: u32,
    pub comments: String,
}

/// Everything one simulator step reported.
#[derive(Clone, Debug, Default)]
pub struct StepResult {
    pub reg_updates: Vec<RegUpdate>,
    pub mem_updates: Vec<MemUpdate>,
    pub exception_updates: Vec<ExceptionUpdate>,
}

/// The simulator interface.
pub trait SimApi {
    /// Single-steps the thread and returns its updates.
    fn step(&mut self, thread_id: u32) -> Result<StepResult, Error>;

    /// Writes a register on the simulator side.
    fn write_register(&mut self, thread_id: u32, name: &str, value: u64, mask: u64);

    /// Reads a register from the simulator, when it exposes one.
    fn read_register(&mut self, thread_id: u32, name: &str) -> Option<u64>;

    /// Writes physical memory on the simulator side.
    fn write_physical_memory(&mut self, bank: u32, pa: u64, bytes: &[u8]);

    /// Enters speculative execution mode.
    fn enter_speculative_mode(&mut self, thread_id: u32);

    /// Leaves speculative execution mode.
    fn leave_speculative_mode(&mut self, thread_id: u32);
}

/// A scripted simulator: steps are served from a queue, writes are recorded.
#[derive(Default)]
pub struct ScriptedSimApi {
    steps: VecDeque<StepResult>,
    registers: HashMap<String, u64>,
    /// Every `(thread, name, value, mask)` register write received.
    pub register_writes: Vec<(u32, String, u64, u64)>,
    /// Every `(bank, pa, bytes)` memory write received.
    pub memory_writes: Vec<(u32, u64, Vec<u8>)>,
    /// Current speculative nesting depth.
    pub speculative_depth: u32,
}

impl ScriptedSimApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the result of the next step.
    pub fn push_step(&mut self, step: StepResult) {
        self.steps.push_back(step);
    }

    /// Queues a step that only advances the PC.
    pub fn push_pc_step(&mut self, next_pc: u64) {
        self.push_step(StepResult {
            reg_updates: vec![RegUpdate {
                name: "PC".to_string(),
                value: next_pc,
                mask: u64::MAX,
                access: "write".to_string(),
            }],
            ..StepResult::default()
        });
    }

    /// Presets a readable register value.
    pub fn set_register(&mut self, name: &str, value: u64) {
        self.registers.insert(name.to_string(), value);
    }
}

impl SimApi for ScriptedSimApi {
    fn step(&mut self, _thread_id: u32) -> Result<StepResult, Error> {
        self.steps
            .pop_front()
            .ok_or_else(|| Error::SimStepFailed("scripted simulator ran out of steps".to_string()))
    }

    fn write_register(&mut self, thread_id: u32, name: &str, value: u64, mask: u64) {
        let slot = self.registers.entry(name.to_string()).or_insert(0);
        *slot = (*slot & !mask) | (value & mask);
        self.register_writes.push((thread_id, name.to_string(), value, mask));
    }

    fn read_register(&mut self, _thread_id: u32, name: &str) -> Option<u64> {
        self.registers.get(name).copied()
    }

    fn write_physical_memory(&mut self, bank: u32, pa: u64, bytes: &[u8]) {
        self.memory_writes.push((bank, pa, bytes.to_vec()));
    }

    fn enter_speculative_mode(&mut self, _thread_id: u32) {
        self.speculative_depth += 1;
    }

    fn leave_speculative_mode(&mut self, _thread_id: u32) {
        assert!(self.speculative_depth > 0, "leave-speculative-underflow");
        self.speculative_depth -= 1;
    }
}
