//! Branch-not-taken bookkeeping: the nodes recorded when a conditional
//! branch commits, the speculative variant that tracks every state delta
//! along the speculated path, the per-round node manager and the BNT hook
//! stack that names the sequences servicing the nodes.

use log::{debug, info};

use crate::memory::MemBank;
use crate::pe_state::{
    RecoveryContext, ResourcePeState, ResourcePeStateStack, ResourcePeStateType, SimplePeState,
};

/// A recorded branch decision point.
#[derive(Debug)]
pub struct BntNode {
    branch_target: u64,
    next_pc: u64,
    taken: bool,
    conditional: bool,
    /// Whether the simulator reported the exact direction and target.
    accurate: bool,
    id: u64,
    sequence_name: String,
    bnt_function: String,
    pe_state: SimplePeState,
}

impl BntNode {
    pub fn new(branch_target: u64, next_pc: u64, taken: bool, conditional: bool) -> Self {
        Self {
            branch_target,
            next_pc,
            taken,
            conditional,
            accurate: false,
            id: 0,
            sequence_name: String::new(),
            bnt_function: String::new(),
            pe_state: SimplePeState::default(),
        }
    }

    pub fn branch_target(&self) -> u64 {
        self.branch_target
    }

    pub fn next_pc(&self) -> u64 {
        self.next_pc
    }

    pub fn set_next_pc(&mut self, next_pc: u64) {
        self.next_pc = next_pc;
    }

    pub fn branch_taken(&self) -> bool {
        self.taken
    }

    pub fn set_taken(&mut self, taken: bool) {
        self.taken = taken;
    }

    pub fn is_conditional(&self) -> bool {
        self.conditional
    }

    pub fn is_accurate(&self) -> bool {
        self.accurate
    }

    pub fn set_accurate(&mut self, accurate: bool) {
        self.accurate = accurate;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn sequence_name(&self) -> &str {
        &self.sequence_name
    }

    pub fn set_sequence_name(&mut self, name: &str) {
        self.sequence_name = name.to_string();
    }

    pub fn bnt_function(&self) -> &str {
        &self.bnt_function
    }

    pub fn set_bnt_function(&mut self, name: &str) {
        self.bnt_function = name.to_string();
    }

    /// Address execution continued at.
    pub fn taken_path(&self) -> u64 {
        if self.taken {
            self.branch_target
        } else {
            self.next_pc
        }
    }

    /// Address of the path not executed, the one the generator may still lay
    /// code on.
    pub fn not_taken_path(&self) -> u64 {
        if self.taken {
            self.next_pc
        } else {
            self.branch_target
        }
    }

    /// Whether both directions land on the same address, making a not-taken
    /// path pointless.
    pub fn paths_same(&self) -> bool {
        self.branch_target == self.next_pc
    }

    pub fn pe_state(&self) -> &SimplePeState {
        &self.pe_state
    }

    pub fn set_pe_state(&mut self, pe_state: SimplePeState) {
        self.pe_state = pe_state;
    }

    pub fn describe(&self) -> String {
        format!(
            "BntNode id={} target=0x{:x} next=0x{:x} taken={} cond={} accurate={}",
            self.id, self.branch_target, self.next_pc, self.taken, self.conditional, self.accurate
        )
    }
}

/// A BNT node recorded while speculating: additionally owns the state stacks
/// that undo the speculated path.
pub struct SpeculativeBntNode {
    pub node: BntNode,
    stacks: Vec<ResourcePeStateStack>,
    /// The executed path as reported, possibly unaligned.
    real_path: u64,
    /// Instructions generated along the speculative path.
    instruction_count: u64,
    instruction_limit: u64,
    /// The taken-path bytes currently reserved in memory.
    reserved_taken_path: Option<(MemBank, u64, u64)>,
}

impl SpeculativeBntNode {
    pub fn new(node: BntNode, instruction_limit: u64) -> Self {
        let real_path = node.taken_path();
        Self {
            node,
            stacks: vec![
                ResourcePeStateStack::new(ResourcePeStateType::Register),
                ResourcePeStateStack::new(ResourcePeStateType::Pc),
                ResourcePeStateStack::new(ResourcePeStateType::Memory),
                ResourcePeStateStack::new(ResourcePeStateType::Dependence),
            ],
            real_path,
            instruction_count: 0,
            instruction_limit,
            reserved_taken_path: None,
        }
    }

    pub fn real_path(&self) -> u64 {
        self.real_path
    }

    pub fn set_real_path(&mut self, target: u64) {
        self.real_path = target;
    }

    /// Records one state delta into the matching stack.
    pub fn push_resource_pe_state(&mut self, state: ResourcePeState) {
        let state_type = state.state_type();
        let stack = self
            .stacks
            .iter_mut()
            .find(|s| s.state_type() == state_type)
            .expect("missing state stack");
        stack.push_resource_pe_state(state);
    }

    /// Replays every stack in reverse, writing prior values back to the
    /// model and the simulator. Returns whether a context switch may have
    /// happened.
    pub fn recover_resource_pe_states(&mut self, ctx: &mut RecoveryContext) -> bool {
        let mut context_switch = false;
        for stack in self.stacks.iter_mut().rev() {
            context_switch |= stack.recover_resource_pe_states(ctx);
        }
        context_switch
    }

    /// Records one generated instruction along the path.
    pub fn record_execution(&mut self) {
        self.instruction_count += 1;
    }

    /// Whether the path has used up its instruction budget.
    pub fn execution_is_overflow(&self) -> bool {
        self.instruction_count >= self.instruction_limit
    }

    pub fn set_reserved_taken_path(&mut self, range: Option<(MemBank, u64, u64)>) {
        self.reserved_taken_path = range;
    }

    pub fn reserved_taken_path(&self) -> Option<(MemBank, u64, u64)> {
        self.reserved_taken_path
    }
}

/// Collects BNT nodes during a generation round; the sequence agent swaps
/// them out at the end of the round.
#[derive(Default)]
pub struct BntNodeManager {
    nodes: Vec<BntNode>,
}

impl BntNodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_bnt_node(&mut self, node: BntNode) {
        debug!("saving {}", node.describe());
        self.nodes.push(node);
    }

    /// Hands every accumulated node to the caller, leaving the manager
    /// empty for the next round.
    pub fn swap_bnt_nodes(&mut self) -> Vec<BntNode> {
        std::mem::take(&mut self.nodes)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One named BNT servicing hook: the front-end sequence and function that
/// take over when a node from this scope is processed.
#[derive(Clone, Debug)]
pub struct BntHook {
    id: u64,
    sequence_name: String,
    function_name: String,
}

impl BntHook {
    pub fn new(id: u64, sequence_name: &str, function_name: &str) -> Self {
        Self {
            id,
            sequence_name: sequence_name.to_string(),
            function_name: function_name.to_string(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sequence_name(&self) -> &str {
        &self.sequence_name
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }
}

/// The stack of BNT hooks. Pushing with empty names inherits the current
/// hook's names; reverting with id zero reverts the most recent frame,
/// otherwise every frame with id at or above the passed id is popped.
pub struct BntHookManager {
    next_id: u64,
    current: Option<BntHook>,
    stack: Vec<BntHook>,
}

impl BntHookManager {
    pub fn new() -> Self {
        Self { next_id: 0, current: None, stack: Vec::new() }
    }

    /// Installs the default hook.
    pub fn setup(&mut self) {
        let id = self.allocate_id();
        self.current = Some(BntHook::new(id, "default", "defaultFunction"));
    }

    pub fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn bnt_hook(&self) -> Option<&BntHook> {
        self.current.as_ref()
    }

    pub fn push_bnt_hook(&mut self, hook: BntHook) {
        let current = self.current.take().expect("push-with-no-current-hook");
        let sequence = if hook.sequence_name.is_empty() {
            current.sequence_name.clone()
        } else {
            hook.sequence_name.clone()
        };
        let function = if hook.function_name.is_empty() {
            current.function_name.clone()
        } else {
            hook.function_name.clone()
        };
        self.stack.push(current);
        self.current = Some(BntHook::new(hook.id, &sequence, &function));
    }

    /// Reverts hooks. An id of zero means "revert the most recent frame";
    /// a nonzero id pops every frame whose id is at or above it, inclusive.
    pub fn revert_bnt_hook(&mut self, bnt_id: u64) {
        let current = self.current.as_ref().expect("no-Bnt-Hook: nothing to revert");
        assert!(bnt_id <= current.id, "invalid-Bnt-id: 0x{:x}", bnt_id);
        let bnt_id = if bnt_id == 0 { current.id } else { bnt_id };

        while self.current.as_ref().map_or(false, |hook| bnt_id <= hook.id) {
            info!("reverting BNT hook {:?}", self.current.as_ref().map(BntHook::id));
            self.current = self.stack.pop();
        }
    }

    pub fn describe(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::from("BntHookManager");
        for hook in &self.stack {
            let _ = write!(out, " [{} {}:{}]", hook.id, hook.sequence_name, hook.function_name);
        }
        if let Some(hook) = &self.current {
            let _ = write!(out, " [{} {}:{}]", hook.id, hook.sequence_name, hook.function_name);
        }
        out
    }
}

impl Default for BntHookManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_reflect_taken_direction() {
        let mut node = BntNode::new(0x2000, 0x1004, true, true);
        assert_eq!(node.taken_path(), 0x2000);
        assert_eq!(node.not_taken_path(), 0x1004);
        node.set_taken(false);
        assert_eq!(node.taken_path(), 0x1004);
        assert_eq!(node.not_taken_path(), 0x2000);
        assert!(!node.paths_same());
        let same = BntNode::new(0x1004, 0x1004, true, true);
        assert!(same.paths_same());
    }

    #[test]
    fn node_manager_swaps_rounds() {
        let mut manager = BntNodeManager::new();
        manager.save_bnt_node(BntNode::new(0x2000, 0x1004, true, true));
        manager.save_bnt_node(BntNode::new(0x3000, 0x1008, false, true));
        let nodes = manager.swap_bnt_nodes();
        assert_eq!(nodes.len(), 2);
        assert!(manager.is_empty());
    }

    #[test]
    fn hook_push_inherits_empty_names() {
        let mut manager = BntHookManager::new();
        manager.setup();
        let id1 = manager.allocate_id();
        manager.push_bnt_hook(BntHook::new(id1, "seq1", "func1"));
        let id2 = manager.allocate_id();
        manager.push_bnt_hook(BntHook::new(id2, "", "func2"));
        let current = manager.bnt_hook().unwrap();
        assert_eq!(current.sequence_name(), "seq1");
        assert_eq!(current.function_name(), "func2");
    }

    #[test]
    fn revert_zero_pops_exactly_one_frame() {
        let mut manager = BntHookManager::new();
        manager.setup();
        let id1 = manager.allocate_id();
        manager.push_bnt_hook(BntHook::new(id1, "seq1", "func1"));
        let id2 = manager.allocate_id();
        manager.push_bnt_hook(BntHook::new(id2, "", "func2"));

        manager.revert_bnt_hook(0);
        assert_eq!(manager.bnt_hook().unwrap().id(), id1);

        manager.revert_bnt_hook(id1);
        assert_eq!(manager.bnt_hook().unwrap().id(), 1);
    }

    #[test]
    fn revert_of_default_leaves_empty_manager() {
        let mut manager = BntHookManager::new();
        manager.setup();
        manager.revert_bnt_hook(1);
        assert!(manager.bnt_hook().is_none());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            manager.revert_bnt_hook(u64::MAX);
        }));
        assert!(result.is_err());
    }
}
