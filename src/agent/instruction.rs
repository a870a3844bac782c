//! The instruction agent: resolves operands under constraints and
//! dependence bias, lays the instruction down at the current PC, and steps
//! the simulator, reconciling every reported update back into the model.

use log::{debug, info, warn};
use num_traits::FromPrimitive as _;

use crate::arch::riscv64;
use crate::bnt::BntNode;
use crate::error::Error;
use crate::gen_mode::GenModeFlags;
use crate::generator::{Generator, Instruction, OperandRecord};
use crate::memory::MemBank;
use crate::pe_state::{bytes_to_block, ResourcePeState, MAX_MEMORY_BLOCK_SIZE};
use crate::register::dependence::ResourceType;
use crate::register::reserver::AccessType;
use crate::register::RegisterType;
use crate::request::{
    GenExceptionRequest, GenInstructionRequest, GenRequest, OperandKind, OperandRequest,
};
use crate::sim::{ExceptionUpdateKind, MemUpdate, StepResult};
use crate::vm::GenPageRequest;

/// Handles one instruction-generation request.
pub fn handle(generator: &mut Generator, request: GenInstructionRequest) -> Result<(), Error> {
    let va = generator.pc();
    generator.gen_pc.set_instruction_space(request.size);

    // Make sure the instruction bytes have a place to live.
    if generator.vm.current_regime().paging_enabled() {
        let page_request = GenPageRequest::default();
        generator.with_memory(|generator, memory| {
            generator.vm.map_address_range(
                va,
                u64::from(request.size),
                true,
                &page_request,
                memory,
                &mut generator.rng,
            )
        })?;
        generator.gen_pc.invalidate();
    }
    let physical = generator.gen_pc.physical(&generator.vm)?;

    // Resolve the operands.
    let mut opcode = request.opcode;
    let mut operands = Vec::with_capacity(request.operands.len());
    for operand in &request.operands {
        let value = resolve_operand(generator, operand)?;
        let field_mask = if operand.size >= 32 { u32::MAX } else { (1u32 << operand.size) - 1 };
        opcode |= ((value as u32) & field_mask) << operand.lsb;
        operands.push(OperandRecord { name: operand.name.clone(), kind: operand.kind, value });
    }

    let (is_branch, is_conditional, branch_target) = match &request.branch {
        Some(branch) => {
            let target = match branch.target {
                Some(target) => target,
                None => choose_branch_target(generator, va)?,
            };
            (true, branch.conditional, Some(target))
        }
        None => (false, false, None),
    };

    let instruction = Instruction {
        name: request.name.clone(),
        opcode,
        size: request.size,
        va,
        pa: physical.pa,
        bank: physical.bank,
        is_branch,
        is_conditional,
        branch_target,
        operands,
        speculative: generator.mode.is_speculative(),
    };
    generator.commit_instruction_final(instruction)
}

/// Chooses one operand value: reservations first, then the dependence bias,
/// then uniform choice over what remains.
fn resolve_operand(generator: &mut Generator, operand: &OperandRequest) -> Result<u64, Error> {
    let (reg_type, res_type, access) = match operand.kind {
        OperandKind::GprTarget => {
            (Some(RegisterType::Gpr), Some(ResourceType::GprRes), AccessType::Write)
        }
        OperandKind::GprSource => {
            (Some(RegisterType::Gpr), Some(ResourceType::GprRes), AccessType::Read)
        }
        OperandKind::FprTarget => {
            (Some(RegisterType::Fpr), Some(ResourceType::FprRes), AccessType::Write)
        }
        OperandKind::FprSource => {
            (Some(RegisterType::Fpr), Some(ResourceType::FprRes), AccessType::Read)
        }
        OperandKind::Immediate => (None, None, AccessType::Read),
    };

    let value = match reg_type {
        Some(reg_type) => {
            let mut usable = generator.reserver.usable_index_constraint(reg_type, access);
            if reg_type == RegisterType::Gpr && access == AccessType::Write {
                for exclude in riscv64::gpr_excludes() {
                    usable.sub_value(u64::from(*exclude));
                }
            }
            if let Some(constraint) = &operand.value_constraint {
                usable.apply_constraint_set(constraint);
            }
            if usable.is_empty() {
                return Err(Error::ConstraintExhausted(format!(
                    "operand {} has no usable index",
                    operand.name
                )));
            }
            // Bias toward recently used resources when the chooser elects a
            // dependence; fall back to the unbiased set when the biased one
            // is disjoint from what is legal here.
            let res_type = res_type.expect("register operand without resource type");
            let biased = generator
                .dependence
                .get_dependence_constraint(&mut generator.rng, access, res_type)
                .map(|dependence| {
                    let mut narrowed = usable.clone();
                    narrowed.apply_constraint_set(&dependence);
                    narrowed
                })
                .filter(|narrowed| !narrowed.is_empty());
            let pool = biased.unwrap_or(usable);
            let index = pool.choose_value(&mut generator.rng)?;
            generator.dependence.record_access(res_type, index, access);
            index
        }
        None => {
            let field_max = if operand.size >= 64 { u64::MAX } else { (1u64 << operand.size) - 1 };
            match &operand.value_constraint {
                Some(constraint) => {
                    let mut pool = constraint.clone();
                    pool.apply_constraint(crate::constraint::Constraint::from_bounds(0, field_max));
                    pool.choose_value(&mut generator.rng)?
                }
                None => generator.rng.below(field_max.saturating_add(1).max(1)),
            }
        }
    };
    Ok(value)
}

/// Picks a branch target inside the usable instruction space near the PC.
fn choose_branch_target(generator: &mut Generator, va: u64) -> Result<u64, Error> {
    let usable = generator.virtual_usable_constraint(true);
    if usable.is_empty() {
        // Nothing mapped yet; keep the branch local.
        return Ok(va.wrapping_add(8) & riscv64::PC_ALIGN_MASK);
    }
    // Stay within a +/-4 KiB window when possible, like a conditional
    // branch's immediate reach.
    let window_lo = va.saturating_sub(0x800);
    let window_hi = va.saturating_add(0x7fe);
    let windowed = usable.clone_in_range(window_lo, window_hi);
    let pool = if windowed.is_empty() { usable } else { windowed };
    let target = pool.choose_value(&mut generator.rng)?;
    Ok(target & riscv64::PC_ALIGN_MASK)
}

/// Steps the simulator for a committed instruction and reconciles updates.
pub fn step_instruction(generator: &mut Generator, instruction: &Instruction) -> Result<(), Error> {
    let mut sim = generator.take_sim().ok_or(Error::NoSimulator)?;
    let step = match sim.step(generator.thread_id) {
        Ok(step) => step,
        Err(error) => {
            generator.put_sim(sim);
            return Err(error);
        }
    };

    record_prior_state(generator, &step);

    // Register updates: apply, watching for the PC redirect.
    let mut target_pc = None;
    for update in &step.reg_updates {
        if update.access == "read" {
            continue;
        }
        if update.name == "PC" {
            target_pc = Some(update.value);
            continue;
        }
        if generator
            .registers
            .write_physical_by_name(&update.name, update.value, update.mask)
            .is_err()
        {
            warn!("simulator updated unknown register {:?}", update.name);
        }
    }

    apply_memory_updates(generator, &step.mem_updates);

    // The first unconsumed exception event drives the exception agent; an
    // exception return pops handler state instead.
    let mut exception_dispatched = false;
    for event in &step.exception_updates {
        match event.kind {
            ExceptionUpdateKind::Exception if !exception_dispatched => {
                exception_dispatched = true;
                info!("exception {} reported by simulator: {}", event.id, event.comments);
                generator.prepend_request(GenRequest::Exception(
                    GenExceptionRequest::HandleException {
                        id: event.id,
                        description: event.comments.clone(),
                    },
                ));
            }
            ExceptionUpdateKind::ExceptionReturn => {
                generator
                    .prepend_request(GenRequest::Exception(GenExceptionRequest::ExceptionReturn));
            }
            _ => {}
        }
    }

    // The PC update becomes the next generation address.
    if let Some(pc) = target_pc {
        generator.gen_pc.set_aligned(pc);
    } else {
        generator.gen_pc.advance(instruction.size);
    }

    update_accurate_bnt(generator, instruction, target_pc);

    generator.instructions_simulated += 1;
    generator.apply_register_updates_to_vm()?;
    generator.restore_loops.handle_pc_update(generator.gen_pc.value());
    generator.put_sim(sim);
    Ok(())
}

/// Advances generator state for a committed instruction when no simulator
/// runs: the PC moves architecturally and conditional branches are recorded
/// as inaccurate BNT nodes.
pub fn step_instruction_no_simulation(generator: &mut Generator, instruction: &Instruction) {
    let next_pc = instruction.va + u64::from(instruction.size);
    match (instruction.is_branch, instruction.is_conditional, instruction.branch_target) {
        (true, false, Some(target)) => generator.gen_pc.set_aligned(target),
        (true, true, Some(target)) => {
            // Direction unknown without a simulator; assume not taken and
            // record the node as inaccurate.
            let mut node = BntNode::new(target, next_pc, false, true);
            node.set_accurate(false);
            finish_bnt_node(generator, &mut node);
            let node_id = node.id();
            generator.bnt_manager.save_bnt_node(node);
            debug!("recorded inaccurate BNT node {}", node_id);
            generator.gen_pc.advance(instruction.size);
        }
        _ => generator.gen_pc.advance(instruction.size),
    }
    generator.restore_loops.handle_pc_update(generator.gen_pc.value());
}

/// Records the prior values of everything the step is about to overwrite,
/// into the active speculative node and the active restore loop.
fn record_prior_state(generator: &mut Generator, step: &StepResult) {
    let speculating = generator.in_speculative_mode();
    let recording = generator.mode.recording_state();
    if !speculating && !recording {
        return;
    }

    let mut states: Vec<ResourcePeState> = Vec::new();
    states.push(ResourcePeState::Pc { pc: generator.gen_pc.value() });
    for update in &step.reg_updates {
        if update.access == "read" || update.name == "PC" {
            continue;
        }
        if let Some(phys_id) = generator.registers.physical_id(&update.name) {
            let phys = generator.registers.physical(phys_id);
            let known_mask = update.mask & phys.init_mask() & phys.mask();
            if known_mask == 0 {
                continue;
            }
            states.push(ResourcePeState::Register {
                phys: phys_id,
                name: update.name.clone(),
                mask: known_mask,
                value: phys.raw_value() & known_mask,
            });
        }
    }
    for update in &step.mem_updates {
        states.extend(prior_memory_state(generator, update));
    }

    for state in states {
        if speculating {
            let node = generator.speculative_nodes.last_mut().expect("speculative stack empty");
            node.push_resource_pe_state(state);
        } else {
            generator.restore_loops.push_resource_pe_state(state);
        }
    }
}

/// Reads the bytes a memory update will overwrite. Fully initialised blocks
/// become one block record; partially initialised ranges fall back to byte
/// records for the initialised bytes only.
fn prior_memory_state(generator: &Generator, update: &MemUpdate) -> Vec<ResourcePeState> {
    let bank = MemBank::from_u32(update.bank).unwrap_or(MemBank::Default);
    let mut states = Vec::new();
    let mut offset = 0u64;
    let total = update.bytes.len() as u64;
    while offset < total {
        let chunk = (total - offset).min(u64::from(MAX_MEMORY_BLOCK_SIZE)) as usize;
        let mut buffer = vec![0u8; chunk];
        let mask = generator.read_memory_partially_initialized(
            bank,
            update.pa + offset,
            &mut buffer,
        );
        if mask == (1u64 << chunk) - 1 {
            states.push(ResourcePeState::BlockMemory {
                bank,
                pa: update.pa + offset,
                va: update.va + offset,
                data: bytes_to_block(&buffer),
                size: chunk as u32,
            });
        } else {
            for byte in 0..chunk {
                if mask & (1 << byte) != 0 {
                    states.push(ResourcePeState::ByteMemory {
                        bank,
                        pa: update.pa + offset + byte as u64,
                        va: update.va + offset + byte as u64,
                        data: buffer[byte],
                    });
                }
            }
        }
        offset += chunk as u64;
    }
    states
}

fn apply_memory_updates(generator: &mut Generator, updates: &[MemUpdate]) {
    for update in updates {
        let bank = MemBank::from_u32(update.bank).unwrap_or(MemBank::Default);
        let memory = generator.memory.clone();
        memory.borrow_mut().bank_mut(bank).write_memory(update.pa, &update.bytes);
    }
}

/// Builds the BNT node for a conditional branch whose direction the
/// simulator reported exactly.
fn update_accurate_bnt(
    generator: &mut Generator,
    instruction: &Instruction,
    target_pc: Option<u64>,
) {
    if !instruction.is_branch || !instruction.is_conditional {
        return;
    }
    let next_pc = instruction.va + u64::from(instruction.size);
    let branch_target = instruction.branch_target.unwrap_or(next_pc);
    let (taken, accurate) = match target_pc {
        Some(pc) => (pc == branch_target && pc != next_pc, true),
        None => (false, false),
    };
    let mut node = BntNode::new(branch_target, next_pc, taken, true);
    node.set_accurate(accurate);
    finish_bnt_node(generator, &mut node);
    generator.bnt_manager.save_bnt_node(node);
}

/// Stamps identity, hook names and the PE-state snapshot onto a new node.
fn finish_bnt_node(generator: &mut Generator, node: &mut BntNode) {
    node.set_id(generator.bnt_hooks.allocate_id());
    if let Some(hook) = generator.bnt_hooks.bnt_hook() {
        node.set_sequence_name(hook.sequence_name());
        node.set_bnt_function(hook.function_name());
    }
    node.set_pe_state(crate::pe_state::SimplePeState::save_state(
        &generator.registers,
        &["satp", "mstatus", "PRIV"],
    ));
}

/// Re-executes already generated code on the simulator, bounded by the
/// configured instruction budget.
pub fn re_execute(generator: &mut Generator, address: u64, max_instructions: u32) -> Result<(), Error> {
    info!("re-executing from 0x{:x}, budget {}", address, max_instructions);
    generator.push_gen_mode(GenModeFlags::RE_EXE);
    generator.gen_pc.set_aligned(address);
    if let Some(mut sim) = generator.take_sim() {
        sim.write_register(generator.thread_id, "PC", generator.gen_pc.value(), u64::MAX);
        generator.put_sim(sim);
    }
    for _ in 0..max_instructions {
        let pa = match generator.gen_pc.physical(&generator.vm) {
            Ok(physical) => physical,
            Err(_) => break,
        };
        let existing = generator.results.lookup(pa.bank, pa.pa).cloned();
        let instruction = match existing {
            Some(instruction) => instruction,
            None => break,
        };
        step_instruction(generator, &instruction)?;
    }
    generator.pop_gen_mode(GenModeFlags::RE_EXE);
    Ok(())
}

/// Lazily adopts simulator values for read-only registers the model has not
/// initialised yet; called when a divergence is first noticed.
pub fn initialize_read_only_registers_with_iss(
    generator: &mut Generator,
    names: &[&str],
) -> Result<(), Error> {
    let mut sim = generator.take_sim().ok_or(Error::NoSimulator)?;
    for name in names {
        if let Some(value) = sim.read_register(generator.thread_id, name) {
            if generator.registers.write_physical_by_name(name, value, u64::MAX).is_err() {
                warn!("read-only catch-up for unknown register {:?}", name);
            }
        }
    }
    generator.put_sim(sim);
    Ok(())
}
