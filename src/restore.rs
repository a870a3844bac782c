//! Restore loops. A restore loop is a counted loop whose body the generator
//! records state deltas for; once the body has been generated the configured
//! number of times, the manager emits inline restore sequences that undo
//! every tracked delta in reverse, so each iteration observes the same
//! starting state. Nested, previously generated loops suspend recording;
//! their state belongs to their own restore machinery.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};

use crate::error::Error;
use crate::pe_state::{IncrementalResourcePeStateStack, ResourcePeState, ResourcePeStateType};
use crate::request::{GenRequest, GenSequenceRequest};

/// State groups a restore loop tracks; exclusions are expressed in the same
/// terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestoreGroup {
    Gpr,
    VecReg,
    PredReg,
    System,
    Memory,
}

/// Lifecycle of one restore loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoopState {
    Recording,
    Restoring,
    Finalised,
}

/// One active restore loop.
pub struct RestoreLoop {
    loop_id: u32,
    loop_reg_index: u32,
    branch_reg_index: u32,
    loop_back_address: u64,
    simulation_count: u32,
    end_restore_count: u32,
    current_restore_count: u32,
    restore_start_address: Option<u64>,
    state: LoopState,
    exclusions: BTreeSet<RestoreGroup>,
    groups: BTreeMap<RestoreGroup, IncrementalResourcePeStateStack>,
}

impl RestoreLoop {
    fn new(
        loop_id: u32,
        loop_reg_index: u32,
        branch_reg_index: u32,
        loop_back_address: u64,
        simulation_count: u32,
        restore_count: u32,
        exclusions: BTreeSet<RestoreGroup>,
    ) -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            RestoreGroup::Gpr,
            IncrementalResourcePeStateStack::new(ResourcePeStateType::Register),
        );
        groups.insert(
            RestoreGroup::VecReg,
            IncrementalResourcePeStateStack::new(ResourcePeStateType::Register),
        );
        groups.insert(
            RestoreGroup::PredReg,
            IncrementalResourcePeStateStack::new(ResourcePeStateType::Register),
        );
        groups.insert(
            RestoreGroup::System,
            IncrementalResourcePeStateStack::new(ResourcePeStateType::Register),
        );
        groups.insert(
            RestoreGroup::Memory,
            IncrementalResourcePeStateStack::new(ResourcePeStateType::Memory),
        );
        Self {
            loop_id,
            loop_reg_index,
            branch_reg_index,
            loop_back_address,
            simulation_count,
            end_restore_count: restore_count,
            current_restore_count: 0,
            restore_start_address: None,
            state: LoopState::Recording,
            exclusions,
            groups,
        }
    }

    pub fn loop_id(&self) -> u32 {
        self.loop_id
    }

    pub fn loop_register_index(&self) -> u32 {
        self.loop_reg_index
    }

    pub fn branch_register_index(&self) -> u32 {
        self.branch_reg_index
    }

    pub fn loop_back_address(&self) -> u64 {
        self.loop_back_address
    }

    pub fn simulation_count(&self) -> u32 {
        self.simulation_count
    }

    pub fn restore_start_address(&self) -> Option<u64> {
        self.restore_start_address
    }

    /// Sets the address where the restore instructions begin; reaching it
    /// moves the loop from recording to restoring.
    pub fn set_restore_start_address(&mut self, address: u64) {
        self.restore_start_address = Some(address);
    }

    pub fn on_first_restore_iteration(&self) -> bool {
        self.current_restore_count == 1
    }

    pub fn on_last_restore_iteration(&self) -> bool {
        self.current_restore_count == self.end_restore_count
    }

    pub fn has_finished_restore_iterations(&self) -> bool {
        self.current_restore_count >= self.end_restore_count
    }

    fn restore_group_for(&self, state: &ResourcePeState) -> RestoreGroup {
        match state {
            ResourcePeState::Register { name, .. } => {
                // Classify by the register name prefix the arch layer uses.
                if name.starts_with('x') {
                    RestoreGroup::Gpr
                } else if name.starts_with('v') {
                    RestoreGroup::VecReg
                } else if name.starts_with('p') {
                    RestoreGroup::PredReg
                } else {
                    RestoreGroup::System
                }
            }
            ResourcePeState::Pc { .. } => RestoreGroup::System,
            ResourcePeState::ByteMemory { .. } | ResourcePeState::BlockMemory { .. } => {
                RestoreGroup::Memory
            }
            ResourcePeState::Dependence { .. } => RestoreGroup::System,
        }
    }

    /// Records one state delta unless its group is excluded.
    pub fn push_resource_pe_state(&mut self, state: ResourcePeState) {
        let group = self.restore_group_for(&state);
        if self.exclusions.contains(&group) {
            return;
        }
        self.groups.get_mut(&group).unwrap().push_resource_pe_state(state);
    }

    /// Emits the restore sequence for every delta recorded since the last
    /// restore, newest first, and advances the restore count.
    pub fn generate_restore_instructions(&mut self) -> Vec<GenRequest> {
        self.current_restore_count += 1;
        self.state = LoopState::Restoring;
        let mut requests = Vec::new();
        for stack in self.groups.values_mut() {
            stack.recover_resource_pe_states(|state| {
                if let Some(request) = restore_request_for(state) {
                    requests.push(request);
                }
            });
        }
        info!(
            "restore loop {} emitting {} restore steps (iteration {}/{})",
            self.loop_id, requests.len(), self.current_restore_count, self.end_restore_count
        );
        requests
    }

    fn finalise(&mut self) {
        self.state = LoopState::Finalised;
    }

    fn is_restoring(&self) -> bool {
        self.state == LoopState::Restoring
    }
}

/// The restore sequence step that undoes one recorded delta.
fn restore_request_for(state: &ResourcePeState) -> Option<GenRequest> {
    match state {
        ResourcePeState::Register { name, mask, value, .. } => {
            Some(GenRequest::Sequence(GenSequenceRequest::SetRegister {
                name: name.clone(),
                value: *value,
                mask: *mask,
            }))
        }
        ResourcePeState::Pc { pc } => {
            Some(GenRequest::Sequence(GenSequenceRequest::BranchToTarget {
                target: *pc,
                no_bnt: true,
            }))
        }
        ResourcePeState::ByteMemory { bank, pa, va, data } => {
            Some(GenRequest::Sequence(GenSequenceRequest::WriteMemoryBlock {
                bank: *bank,
                pa: *pa,
                va: *va,
                bytes: vec![*data],
            }))
        }
        ResourcePeState::BlockMemory { bank, pa, va, data, size } => {
            Some(GenRequest::Sequence(GenSequenceRequest::WriteMemoryBlock {
                bank: *bank,
                pa: *pa,
                va: *va,
                bytes: crate::pe_state::block_to_bytes(*data, *size),
            }))
        }
        ResourcePeState::Dependence { .. } => None,
    }
}

/// Manager of the restore-loop stack of one generator.
pub struct RestoreLoopManager {
    loops: Vec<RestoreLoop>,
    /// Start/end addresses of loops previously generated inside each loop,
    /// keyed by the enclosing loop id; crossing them suspends recording.
    nested_loop_starts: BTreeMap<u32, BTreeSet<u64>>,
    nested_loop_ends: BTreeMap<u32, BTreeSet<u64>>,
    /// Depth of nested-loop execution currently suspending recording.
    suspension_depth: u32,
    next_loop_id: u32,
    branch_reg_index: u32,
}

impl RestoreLoopManager {
    pub fn new() -> Self {
        Self {
            loops: Vec::new(),
            nested_loop_starts: BTreeMap::new(),
            nested_loop_ends: BTreeMap::new(),
            suspension_depth: 0,
            next_loop_id: 1,
            branch_reg_index: 0,
        }
    }

    pub fn branch_register_index(&self) -> u32 {
        self.branch_reg_index
    }

    pub fn set_branch_register_index(&mut self, index: u32) {
        self.branch_reg_index = index;
    }

    /// Starts a restore loop at the current PC. Fast-exception mode cannot
    /// preserve the loop invariants and is rejected.
    pub fn begin_loop(
        &mut self,
        loop_reg_index: u32,
        simulation_count: u32,
        restore_count: u32,
        exclusions: BTreeSet<RestoreGroup>,
        loop_back_address: u64,
        fast_exception_mode: bool,
    ) -> Result<u32, Error> {
        if fast_exception_mode {
            return Err(Error::RestoreLoopUnsupported(
                "fast exception handlers cannot be active around a restore loop".to_string(),
            ));
        }
        assert!(restore_count > 0, "restore-count-must-be-positive");
        let loop_id = self.next_loop_id;
        self.next_loop_id += 1;
        info!(
            "begin restore loop {} at 0x{:x}, sim count {}, restore count {}",
            loop_id, loop_back_address, simulation_count, restore_count
        );
        self.loops.push(RestoreLoop::new(
            loop_id,
            loop_reg_index,
            self.branch_reg_index,
            loop_back_address,
            simulation_count,
            restore_count,
            exclusions,
        ));
        Ok(loop_id)
    }

    /// Ends the loop, which must be the innermost one. The loop's address
    /// range becomes a nested region of its parent, so the parent suspends
    /// recording while execution passes through it again.
    pub fn end_loop(&mut self, loop_id: u32, loop_end_address: u64) {
        let mut finished = self.loops.pop().expect("end-loop-with-no-active-loop");
        assert_eq!(finished.loop_id(), loop_id, "end-loop-id-mismatch");
        finished.finalise();
        if let Some(parent) = self.loops.last() {
            let parent_id = parent.loop_id();
            self.nested_loop_starts
                .entry(parent_id)
                .or_insert_with(BTreeSet::new)
                .insert(finished.loop_back_address());
            self.nested_loop_ends
                .entry(parent_id)
                .or_insert_with(BTreeSet::new)
                .insert(loop_end_address);
        }
        debug!("end restore loop {} at 0x{:x}", loop_id, loop_end_address);
    }

    /// Emits the restore sequence of the loop.
    pub fn generate_restore_instructions(&mut self, loop_id: u32) -> Vec<GenRequest> {
        let current = self.current_loop_mut();
        assert_eq!(current.loop_id(), loop_id, "restore-for-non-current-loop");
        current.generate_restore_instructions()
    }

    /// Records a state delta into the innermost loop, unless recording is
    /// suspended inside a nested region or no loop is active.
    pub fn push_resource_pe_state(&mut self, state: ResourcePeState) {
        if self.suspension_depth > 0 {
            return;
        }
        if let Some(current) = self.loops.last_mut() {
            current.push_resource_pe_state(state);
        }
    }

    pub fn has_active_loop(&self) -> bool {
        !self.loops.is_empty()
    }

    pub fn current_loop_id(&self) -> u32 {
        self.loops.last().map(RestoreLoop::loop_id).expect("no-active-restore-loop")
    }

    pub fn current_loop_back_address(&self) -> u64 {
        self.loops.last().map(RestoreLoop::loop_back_address).expect("no-active-restore-loop")
    }

    pub fn current_loop(&self) -> Option<&RestoreLoop> {
        self.loops.last()
    }

    pub fn current_loop_mut(&mut self) -> &mut RestoreLoop {
        self.loops.last_mut().expect("no-active-restore-loop")
    }

    /// Drives the loop state machine from a PC update: nested-region entry
    /// and exit toggle recording suspension, and reaching the restore start
    /// address begins the next restore iteration.
    pub fn handle_pc_update(&mut self, pc: u64) {
        let (loop_id, restore_start) = match self.loops.last() {
            Some(current) => (current.loop_id(), current.restore_start_address()),
            None => return,
        };
        if self
            .nested_loop_starts
            .get(&loop_id)
            .map_or(false, |starts| starts.contains(&pc))
        {
            self.suspension_depth += 1;
            debug!("recording suspended at nested loop start 0x{:x}", pc);
        }
        if self
            .nested_loop_ends
            .get(&loop_id)
            .map_or(false, |ends| ends.contains(&pc))
        {
            assert!(self.suspension_depth > 0, "nested-loop-end-without-start");
            self.suspension_depth -= 1;
            debug!("recording resumed at nested loop end 0x{:x}", pc);
        }
        if restore_start == Some(pc) {
            let current = self.loops.last_mut().unwrap();
            if !current.is_restoring() {
                debug!("loop {} reached restore start 0x{:x}", loop_id, pc);
            }
        }
    }
}

impl Default for RestoreLoopManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemBank;

    fn register_state(name: &str, value: u64) -> ResourcePeState {
        ResourcePeState::Register { phys: 0, name: name.to_string(), mask: u64::MAX, value }
    }

    #[test]
    fn fast_exception_mode_is_rejected() {
        let mut manager = RestoreLoopManager::new();
        let result =
            manager.begin_loop(10, 4, 2, BTreeSet::new(), 0x1000, true);
        assert!(matches!(result, Err(Error::RestoreLoopUnsupported(_))));
    }

    #[test]
    fn restores_come_out_in_reverse_order() {
        let mut manager = RestoreLoopManager::new();
        let loop_id = manager.begin_loop(10, 4, 2, BTreeSet::new(), 0x1000, false).unwrap();
        manager.push_resource_pe_state(register_state("x1", 0x11));
        manager.push_resource_pe_state(register_state("x2", 0x22));
        let requests = manager.generate_restore_instructions(loop_id);
        assert_eq!(requests.len(), 2);
        match &requests[0] {
            GenRequest::Sequence(GenSequenceRequest::SetRegister { name, value, .. }) => {
                assert_eq!(name, "x2");
                assert_eq!(*value, 0x22);
            }
            _ => panic!("expected register restore first"),
        }
    }

    #[test]
    fn excluded_groups_are_not_recorded() {
        let mut manager = RestoreLoopManager::new();
        let mut exclusions = BTreeSet::new();
        exclusions.insert(RestoreGroup::Gpr);
        let loop_id = manager.begin_loop(10, 4, 1, exclusions, 0x1000, false).unwrap();
        manager.push_resource_pe_state(register_state("x1", 0x11));
        manager.push_resource_pe_state(ResourcePeState::ByteMemory {
            bank: MemBank::Default,
            pa: 0x2000,
            va: 0x2000,
            data: 9,
        });
        let requests = manager.generate_restore_instructions(loop_id);
        assert_eq!(requests.len(), 1);
        assert!(matches!(
            requests[0],
            GenRequest::Sequence(GenSequenceRequest::WriteMemoryBlock { .. })
        ));
    }

    #[test]
    fn nested_regions_suspend_recording() {
        let mut manager = RestoreLoopManager::new();
        let outer = manager.begin_loop(10, 4, 1, BTreeSet::new(), 0x1000, false).unwrap();
        let inner = manager.begin_loop(11, 2, 1, BTreeSet::new(), 0x2000, false).unwrap();
        manager.end_loop(inner, 0x2100);

        // Execution re-enters the previously generated inner loop.
        manager.handle_pc_update(0x2000);
        manager.push_resource_pe_state(register_state("x3", 0x33));
        manager.handle_pc_update(0x2100);
        manager.push_resource_pe_state(register_state("x4", 0x44));

        let requests = manager.generate_restore_instructions(outer);
        // Only the delta recorded outside the nested region survives.
        assert_eq!(requests.len(), 1);
        match &requests[0] {
            GenRequest::Sequence(GenSequenceRequest::SetRegister { name, .. }) => {
                assert_eq!(name, "x4")
            }
            _ => panic!("expected x4 restore"),
        }
    }

    #[test]
    fn restore_iteration_counters_progress() {
        let mut manager = RestoreLoopManager::new();
        let loop_id = manager.begin_loop(10, 4, 2, BTreeSet::new(), 0x1000, false).unwrap();
        manager.current_loop_mut().set_restore_start_address(0x1800);
        manager.push_resource_pe_state(register_state("x1", 0x11));
        let _ = manager.generate_restore_instructions(loop_id);
        {
            let current = manager.current_loop().unwrap();
            assert!(current.on_first_restore_iteration());
            assert!(!current.has_finished_restore_iterations());
        }
        let _ = manager.generate_restore_instructions(loop_id);
        {
            let current = manager.current_loop().unwrap();
            assert!(current.on_last_restore_iteration());
            assert!(current.has_finished_restore_iterations());
        }
        manager.end_loop(loop_id, 0x1900);
        assert!(!manager.has_active_loop());
    }
}
