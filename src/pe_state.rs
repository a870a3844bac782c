//! Recorded processing-element state deltas and the stacks that replay them.
//! Every write during a speculative path or a restore loop is recorded as a
//! [`ResourcePeState`]; recovery replays the records in reverse, writing the
//! prior values back to both the generator's model and the simulator.

use log::{info, trace};

use crate::gen_pc::GenPC;
use crate::memory::{MemBank, MemoryManager};
use crate::register::dependence::ResourceDependence;
use crate::register::{PhysRegId, RegisterFile, RegisterType};
use crate::sim::SimApi;

/// Grouping of recorded states, one stack per type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourcePeStateType {
    Register,
    Pc,
    Memory,
    Dependence,
}

/// Everything state recovery needs to write prior values back.
pub struct RecoveryContext<'a> {
    pub thread_id: u32,
    pub registers: &'a mut RegisterFile,
    pub memory: &'a mut MemoryManager,
    pub gen_pc: &'a mut GenPC,
    pub dependence: &'a mut ResourceDependence,
    pub sim: Option<&'a mut (dyn SimApi + 'static)>,
}

/// One recorded state delta.
pub enum ResourcePeState {
    /// Prior value of (part of) a physical register.
    Register { phys: PhysRegId, name: String, mask: u64, value: u64 },
    /// Prior PC.
    Pc { pc: u64 },
    /// Prior value of one byte of memory.
    ByteMemory { bank: MemBank, pa: u64, va: u64, data: u8 },
    /// Prior value of a block of up to eight bytes.
    BlockMemory { bank: MemBank, pa: u64, va: u64, data: u64, size: u32 },
    /// Snapshot of the dependence tracker.
    Dependence { snapshot: ResourceDependence },
}

/// Maximum bytes one block-memory record carries.
pub const MAX_MEMORY_BLOCK_SIZE: u32 = 8;

impl ResourcePeState {
    pub fn state_type(&self) -> ResourcePeStateType {
        match self {
            ResourcePeState::Register { .. } => ResourcePeStateType::Register,
            ResourcePeState::Pc { .. } => ResourcePeStateType::Pc,
            ResourcePeState::ByteMemory { .. } | ResourcePeState::BlockMemory { .. } => {
                ResourcePeStateType::Memory
            }
            ResourcePeState::Dependence { .. } => ResourcePeStateType::Dependence,
        }
    }

    /// Whether the two records describe the same underlying resource; the
    /// first recorded state wins, so the restored value is the one from
    /// before the tracked region began.
    pub fn is_identical_state(&self, other: &ResourcePeState) -> bool {
        match (self, other) {
            (
                ResourcePeState::Register { phys: a, .. },
                ResourcePeState::Register { phys: b, .. },
            ) => a == b,
            (ResourcePeState::Pc { pc: a }, ResourcePeState::Pc { pc: b }) => a == b,
            (
                ResourcePeState::ByteMemory { bank: ab, pa: apa, .. },
                ResourcePeState::ByteMemory { bank: bb, pa: bpa, .. },
            ) => ab == bb && apa == bpa,
            (
                ResourcePeState::BlockMemory { bank: ab, va: ava, .. },
                ResourcePeState::BlockMemory { bank: bb, va: bva, .. },
            ) => ab == bb && ava == bva,
            _ => false,
        }
    }

    /// Writes the prior value back to the generator model and the simulator.
    /// Returns whether the write may have switched the translation context.
    pub fn do_state_recovery(&self, ctx: &mut RecoveryContext) -> bool {
        trace!("state recovery: {}", self.describe());
        match self {
            ResourcePeState::Register { phys, name, mask, value } => {
                if let Some(sim) = ctx.sim.as_mut() {
                    sim.write_register(ctx.thread_id, name, *value, *mask);
                }
                let reg_mask = *mask & ctx.registers.physical(*phys).mask();
                ctx.registers.write_physical_bits(*phys, *value, reg_mask);
                ctx.registers.physical(*phys).register_type() == RegisterType::SysReg
            }
            ResourcePeState::Pc { pc } => {
                if let Some(sim) = ctx.sim.as_mut() {
                    sim.write_register(ctx.thread_id, "PC", *pc, u64::MAX);
                }
                ctx.gen_pc.set_aligned(*pc);
                false
            }
            ResourcePeState::ByteMemory { bank, pa, data, .. } => {
                if let Some(sim) = ctx.sim.as_mut() {
                    sim.write_physical_memory(bank.number(), *pa, &[*data]);
                }
                ctx.memory.bank_mut(*bank).write_memory(*pa, &[*data]);
                false
            }
            ResourcePeState::BlockMemory { bank, pa, data, size, .. } => {
                let bytes = block_to_bytes(*data, *size);
                if let Some(sim) = ctx.sim.as_mut() {
                    sim.write_physical_memory(bank.number(), *pa, &bytes);
                }
                ctx.memory.bank_mut(*bank).write_memory(*pa, &bytes);
                false
            }
            ResourcePeState::Dependence { snapshot } => {
                *ctx.dependence = snapshot.clone();
                false
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ResourcePeState::Register { name, mask, value, .. } => {
                format!("Register {} mask 0x{:x} value 0x{:x}", name, mask, value)
            }
            ResourcePeState::Pc { pc } => format!("PC 0x{:x}", pc),
            ResourcePeState::ByteMemory { bank, pa, data, .. } => {
                format!("ByteMemory [{:?}]0x{:x} = 0x{:02x}", bank, pa, data)
            }
            ResourcePeState::BlockMemory { bank, pa, data, size, .. } => {
                format!("BlockMemory [{:?}]0x{:x} = 0x{:x} ({} bytes)", bank, pa, data, size)
            }
            ResourcePeState::Dependence { .. } => "Dependence snapshot".to_string(),
        }
    }
}

/// Big-endian split of a block value, matching how block records are built.
pub fn block_to_bytes(data: u64, size: u32) -> Vec<u8> {
    assert!(size >= 1 && size <= MAX_MEMORY_BLOCK_SIZE, "block-size-out-of-range");
    (0..size).rev().map(|i| (data >> (i * 8)) as u8).collect()
}

/// Packs bytes into a block value, the inverse of [`block_to_bytes`].
pub fn bytes_to_block(bytes: &[u8]) -> u64 {
    assert!(bytes.len() as u32 <= MAX_MEMORY_BLOCK_SIZE);
    bytes.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

/// A last-in-first-out record of state deltas with duplicate suppression.
pub struct ResourcePeStateStack {
    states: Vec<ResourcePeState>,
    state_type: ResourcePeStateType,
}

impl ResourcePeStateStack {
    pub fn new(state_type: ResourcePeStateType) -> Self {
        Self { states: Vec::new(), state_type }
    }

    pub fn state_type(&self) -> ResourcePeStateType {
        self.state_type
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Pushes a record unless the same resource is already recorded.
    pub fn push_resource_pe_state(&mut self, state: ResourcePeState) {
        if self.states.iter().any(|s| s.is_identical_state(&state)) {
            info!("ignoring duplicated resource state: {}", state.describe());
            return;
        }
        self.states.push(state);
    }

    /// Replays every record in reverse and drains the stack. Returns whether
    /// any recovery may have switched the translation context.
    pub fn recover_resource_pe_states(&mut self, ctx: &mut RecoveryContext) -> bool {
        let mut context_switch = false;
        while let Some(state) = self.states.pop() {
            context_switch |= state.do_state_recovery(ctx);
        }
        context_switch
    }
}

/// A state stack restored in per-iteration slices: each recovery hands the
/// records since the previous recovery, newest first, to the restore
/// function instead of writing them back directly.
pub struct IncrementalResourcePeStateStack {
    states: Vec<ResourcePeState>,
    state_type: ResourcePeStateType,
    next_end_index: usize,
}

impl IncrementalResourcePeStateStack {
    pub fn new(state_type: ResourcePeStateType) -> Self {
        Self { states: Vec::new(), state_type, next_end_index: 0 }
    }

    pub fn state_type(&self) -> ResourcePeStateType {
        self.state_type
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Pushes a record unless the same resource is already recorded; across
    /// restore iterations the first record keeps the pre-loop value.
    pub fn push_resource_pe_state(&mut self, state: ResourcePeState) {
        if self.states.iter().any(|s| s.is_identical_state(&state)) {
            return;
        }
        self.states.push(state);
    }

    /// Hands the unprocessed records, newest first, to `restore` and marks
    /// them processed.
    pub fn recover_resource_pe_states<F>(&mut self, mut restore: F)
    where
        F: FnMut(&ResourcePeState),
    {
        for index in (self.next_end_index..self.states.len()).rev() {
            restore(&self.states[index]);
        }
        self.next_end_index = self.states.len();
    }
}

/// A lightweight snapshot of chosen context registers, saved when a BNT node
/// is created and replayed before its not-taken path is generated.
#[derive(Debug, Default)]
pub struct SimplePeState {
    saved: Vec<(String, u64)>,
}

impl SimplePeState {
    /// Captures the named registers' current values. Uninitialised registers
    /// are skipped; there is nothing meaningful to restore for them.
    pub fn save_state(registers: &RegisterFile, names: &[&str]) -> Self {
        let mut saved = Vec::new();
        for name in names {
            if let Ok((true, _)) = registers.is_initialized(name) {
                if let Ok(value) = registers.register_value(name) {
                    saved.push((name.to_string(), value));
                }
            }
        }
        Self { saved }
    }

    /// Writes the captured values back. Returns whether any register changed,
    /// signalling a possible translation-context switch.
    pub fn restore_state(&self, registers: &mut RegisterFile) -> bool {
        let mut changed = false;
        for (name, value) in &self.saved {
            let current = registers.register_value(name).ok();
            if current != Some(*value) {
                registers.write_register(name, *value).expect("saved register vanished");
                changed = true;
            }
        }
        changed
    }

    pub fn saved(&self) -> &[(String, u64)] {
        &self.saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_bytes_round_trip() {
        let bytes = block_to_bytes(0x1122_3344, 4);
        assert_eq!(bytes, vec![0x11, 0x22, 0x33, 0x44]);
        assert_eq!(bytes_to_block(&bytes), 0x1122_3344);
    }

    #[test]
    fn duplicate_states_are_suppressed() {
        let mut stack = ResourcePeStateStack::new(ResourcePeStateType::Register);
        stack.push_resource_pe_state(ResourcePeState::Register {
            phys: 3,
            name: "x3".to_string(),
            mask: u64::MAX,
            value: 0x1111,
        });
        stack.push_resource_pe_state(ResourcePeState::Register {
            phys: 3,
            name: "x3".to_string(),
            mask: u64::MAX,
            value: 0x2222,
        });
        // Only the first record survives, so recovery lands on 0x1111.
        assert_eq!(stack.states.len(), 1);
        match &stack.states[0] {
            ResourcePeState::Register { value, .. } => assert_eq!(*value, 0x1111),
            _ => panic!("wrong state kind"),
        }
    }

    #[test]
    fn incremental_stack_slices_per_recovery() {
        let mut stack = IncrementalResourcePeStateStack::new(ResourcePeStateType::Memory);
        stack.push_resource_pe_state(ResourcePeState::ByteMemory {
            bank: MemBank::Default,
            pa: 0x100,
            va: 0x100,
            data: 1,
        });
        stack.push_resource_pe_state(ResourcePeState::ByteMemory {
            bank: MemBank::Default,
            pa: 0x101,
            va: 0x101,
            data: 2,
        });
        let mut seen = Vec::new();
        stack.recover_resource_pe_states(|state| seen.push(state.describe()));
        assert_eq!(seen.len(), 2);
        // Newest first.
        assert!(seen[0].contains("0x101"));
        // A second recovery with no new records hands out nothing.
        seen.clear();
        stack.recover_resource_pe_states(|state| seen.push(state.describe()));
        assert!(seen.is_empty());
    }
}
