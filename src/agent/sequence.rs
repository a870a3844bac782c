//! The sequence agent: instruction commit, branch-not-taken rounds,
//! speculative path entry and recovery, restore-loop control and the other
//! multi-step sequences that decompose into further requests.

use log::{debug, info, warn};

use crate::arch::riscv64;
use crate::bnt::{BntNode, SpeculativeBntNode};
use crate::error::Error;
use crate::gen_mode::GenModeFlags;
use crate::generator::Generator;
use crate::pe_state::RecoveryContext;
use crate::register::reserver::{AccessType, RegReserveType};
use crate::request::{
    GenCallbackRequest, GenRequest, GenSequenceRequest, GenStateAction, GenStateRequest,
    GenStateSpec,
};

/// Handles one sequence request.
pub fn handle(generator: &mut Generator, request: GenSequenceRequest) -> Result<(), Error> {
    match request {
        GenSequenceRequest::CommitInstruction(instruction) => {
            generator.commit_instruction_final(instruction)
        }
        GenSequenceRequest::BranchNotTaken => branch_not_taken(generator),
        GenSequenceRequest::ProcessBntNode(node) => process_bnt_node(generator, node),
        GenSequenceRequest::ProcessSpeculativeBntNode(node) => {
            enter_speculative_bnt(generator, node)
        }
        GenSequenceRequest::ExitSpeculativeBnt => recover_speculative_bnt(generator),
        GenSequenceRequest::ReExecution { address, max_instructions } => {
            if generator.mode().simulation_enabled() {
                crate::agent::instruction::re_execute(generator, address, max_instructions)
            } else {
                Ok(())
            }
        }
        GenSequenceRequest::BranchToTarget { target, no_bnt } => {
            debug!("branching generation to 0x{:x} (no_bnt={})", target, no_bnt);
            generator.gen_pc.set_aligned(target);
            generator.restore_loops.handle_pc_update(target);
            Ok(())
        }
        GenSequenceRequest::SetRegister { name, value, mask } => {
            generator.set_register(&name, value, mask)
        }
        GenSequenceRequest::WriteMemoryBlock { bank, pa, va: _, bytes } => {
            generator.initialize_memory(bank, pa, bytes, crate::memory::MemoryAttributes::DATA);
            Ok(())
        }
        GenSequenceRequest::UpdateRegisterField { register, field, value } => {
            generator.registers.write_register_field(&register, &field, value)?;
            generator.apply_register_updates_to_vm()
        }
        GenSequenceRequest::UpdatePeState { record_id } => update_pe_state(generator, record_id),
        GenSequenceRequest::BeginRestoreLoop {
            loop_register_index,
            simulation_count,
            restore_count,
            exclusions,
        } => begin_restore_loop(
            generator,
            loop_register_index,
            simulation_count,
            restore_count,
            exclusions,
        ),
        GenSequenceRequest::RestoreLoopState => {
            let loop_id = generator.restore_loops.current_loop_id();
            let requests = generator.restore_loops.generate_restore_instructions(loop_id);
            generator.prepend_requests(requests);
            Ok(())
        }
        GenSequenceRequest::EndRestoreLoop { loop_id } => end_restore_loop(generator, loop_id),
        GenSequenceRequest::EndOfTest => {
            info!("end of test: {}", generator.gen_summary());
            generator.end_of_test = true;
            Ok(())
        }
    }
}

/// Swaps out this round's BNT nodes and schedules their processing with
/// simulation off, exactly once per node, followed by another BNT round for
/// nodes the processing itself creates.
fn branch_not_taken(generator: &mut Generator) -> Result<(), Error> {
    let nodes = generator.bnt_manager.swap_bnt_nodes();
    if nodes.is_empty() {
        // The processing chain ran dry; the next chain starts at level one.
        generator.bnt_level = 0;
        return Ok(());
    }

    generator.bnt_level += 1;
    if generator.bnt_level > generator.config.limits.branch_not_taken_limit {
        info!(
            "BNT level {} exceeds limit {}, dropping {} nodes",
            generator.bnt_level,
            generator.config.limits.branch_not_taken_limit,
            nodes.len()
        );
        generator.bnt_level = 0;
        return Ok(());
    }

    let mode_change = GenModeFlags::SIM_OFF;
    let mut requests = vec![GenRequest::State(GenStateRequest {
        action: GenStateAction::Push,
        state: GenStateSpec::GenMode(mode_change),
    })];
    let mut any = false;
    for node in nodes {
        if node.paths_same() {
            debug!("skipping BNT node {}: target equals next PC", node.id());
            continue;
        }
        any = true;
        if node.is_accurate() {
            requests.push(GenRequest::Callback(GenCallbackRequest::Bnt(node)));
        } else {
            requests.push(GenRequest::Sequence(GenSequenceRequest::ProcessBntNode(node)));
        }
    }
    requests.push(GenRequest::State(GenStateRequest {
        action: GenStateAction::Pop,
        state: GenStateSpec::GenMode(mode_change),
    }));
    if any {
        requests.push(GenRequest::Sequence(GenSequenceRequest::BranchNotTaken));
    } else {
        generator.bnt_level = 0;
    }
    generator.prepend_requests(requests);
    Ok(())
}

/// Generates the not-taken path of one node: restore the PE state captured
/// at the branch, verify free space at the not-taken physical address, and
/// point generation there with a closing branch back to the taken path.
pub fn process_bnt_node(generator: &mut Generator, node: BntNode) -> Result<(), Error> {
    // Restore the PE state snapshot taken when the branch committed.
    if node.pe_state().restore_state(&mut generator.registers) {
        generator.update_vm()?;
    }

    let not_taken = node.not_taken_path();
    let (pa, bank) = match generator.translate_va_to_pa(not_taken) {
        Ok(translated) => translated,
        Err(_) => panic!("failed-to-translate-not-taken-path: 0x{:x}", not_taken),
    };

    let lead = generator
        .memory
        .borrow()
        .bank(bank)
        .free()
        .leading_intersecting_range(pa, u64::MAX);
    let min_space = u64::from(riscv64::BNT_MIN_SPACE);
    match lead {
        Some((start, size)) if start == pa && size >= min_space => {
            info!(
                "generating not-taken path at 0x{:x} => [{:?}]0x{:x}, {} free bytes",
                not_taken, bank, pa, size
            );
            generator.gen_pc.set(not_taken);
            generator.prepend_request(GenRequest::Sequence(GenSequenceRequest::BranchToTarget {
                target: node.taken_path(),
                no_bnt: true,
            }));
        }
        _ => {
            info!(
                "skipping not-taken path at 0x{:x}: insufficient free space at [{:?}]0x{:x}",
                not_taken, bank, pa
            );
        }
    }
    Ok(())
}

/// Enters speculative generation for a node: level-guarded, with the
/// dependence snapshot pushed first so rollback can restore it last.
fn enter_speculative_bnt(generator: &mut Generator, node: BntNode) -> Result<(), Error> {
    if node.paths_same() {
        debug!("speculative node {} has identical paths, dropping", node.id());
        return Ok(());
    }
    let limit = generator.config.limits.speculative_bnt_level_limit;
    if generator.speculative_bnt_level() >= limit {
        info!("speculative BNT level limit {} reached, node silently dropped", limit);
        return Ok(());
    }

    generator.push_gen_mode(GenModeFlags::SPECULATIVE | GenModeFlags::NO_ESCAPE);
    if let Some(mut sim) = generator.take_sim() {
        sim.enter_speculative_mode(generator.thread_id);
        generator.put_sim(sim);
    }

    let limit = u64::from(generator.config.limits.speculative_bnt_instruction_limit);
    let mut speculative = SpeculativeBntNode::new(node, limit);
    speculative.push_resource_pe_state(crate::pe_state::ResourcePeState::Dependence {
        snapshot: generator.dependence.snapshot(),
    });
    speculative.push_resource_pe_state(crate::pe_state::ResourcePeState::Pc {
        pc: generator.pc(),
    });

    // Keep the taken path clear so the speculated code cannot land on it.
    if let Ok((pa, bank)) = generator.translate_va_to_pa(speculative.node.taken_path()) {
        let reserve_end = pa + u64::from(riscv64::BNT_RESERVE_SPACE) - 1;
        generator
            .memory
            .borrow_mut()
            .bank_mut(bank)
            .reserve_memory(&crate::constraint::ConstraintSet::from_range(pa, reserve_end));
        speculative.set_reserved_taken_path(Some((bank, pa, reserve_end)));
    }

    let not_taken = speculative.node.not_taken_path();
    generator.speculative_nodes.push(speculative);
    generator.gen_pc.set_aligned(not_taken);
    info!(
        "entered speculative BNT level {}, generating at 0x{:x}",
        generator.speculative_bnt_level(),
        not_taken
    );
    Ok(())
}

/// Unwinds the innermost speculative path: every recorded state is written
/// back to model and simulator, the dependence snapshot is restored, and the
/// speculative mode is popped.
pub fn recover_speculative_bnt(generator: &mut Generator) -> Result<(), Error> {
    let mut speculative =
        generator.speculative_nodes.pop().expect("pop-empty-speculative-stack");
    if let Some((bank, lo, hi)) = speculative.reserved_taken_path() {
        generator
            .memory
            .borrow_mut()
            .bank_mut(bank)
            .unreserve_memory(&crate::constraint::ConstraintSet::from_range(lo, hi));
        speculative.set_reserved_taken_path(None);
    }
    let mut sim = generator.take_sim();
    let context_switch = {
        let memory = generator.memory.clone();
        let mut memory = memory.borrow_mut();
        let mut ctx = RecoveryContext {
            thread_id: generator.thread_id,
            registers: &mut generator.registers,
            memory: &mut memory,
            gen_pc: &mut generator.gen_pc,
            dependence: &mut generator.dependence,
            sim: sim.as_deref_mut(),
        };
        speculative.recover_resource_pe_states(&mut ctx)
    };
    if let Some(sim) = sim.as_mut() {
        sim.leave_speculative_mode(generator.thread_id);
    }
    if let Some(sim) = sim {
        generator.put_sim(sim);
    }
    generator.pop_gen_mode(GenModeFlags::SPECULATIVE | GenModeFlags::NO_ESCAPE);
    if context_switch {
        generator.update_vm()?;
    }
    info!("speculative BNT recovered, level now {}", generator.speculative_bnt_level());
    Ok(())
}

/// Applies a PE-state update parked in the data station by the front-end.
fn update_pe_state(generator: &mut Generator, record_id: u64) -> Result<(), Error> {
    let record = generator
        .data_station
        .remove(record_id)
        .unwrap_or_else(|| panic!("invalid-record-id-update-pestate: {}", record_id));
    match record.downcast::<Vec<GenRequest>>() {
        Ok(requests) => {
            generator.prepend_requests(*requests);
            Ok(())
        }
        Err(_) => panic!("not-available-update-pestate: record {} has wrong type", record_id),
    }
}

/// Starts a restore loop at the current PC: a branch register is chosen and
/// reserved, the loop is registered, and the loop modes are pushed.
fn begin_restore_loop(
    generator: &mut Generator,
    loop_register_index: u32,
    simulation_count: u32,
    restore_count: u32,
    exclusions: std::collections::BTreeSet<crate::restore::RestoreGroup>,
) -> Result<(), Error> {
    let branch_index = generator.choose_free_gpr(AccessType::ReadWrite)? as u32;
    let branch_name = riscv64::gpr_name(branch_index);
    generator.reserve_register(&branch_name, AccessType::ReadWrite, RegReserveType::User)?;
    generator.restore_loops.set_branch_register_index(branch_index);

    let loop_back = generator.pc();
    let loop_id = generator.restore_loops.begin_loop(
        loop_register_index,
        simulation_count,
        restore_count,
        exclusions,
        loop_back,
        false,
    )?;
    generator
        .push_gen_mode(GenModeFlags::IN_LOOP | GenModeFlags::RECORDING_STATE);
    debug!("restore loop {} armed at 0x{:x}", loop_id, loop_back);
    Ok(())
}

/// Ends the innermost restore loop and releases its branch register.
fn end_restore_loop(generator: &mut Generator, loop_id: u32) -> Result<(), Error> {
    let end_address = generator.pc();
    generator.restore_loops.end_loop(loop_id, end_address);
    generator.pop_gen_mode(GenModeFlags::IN_LOOP | GenModeFlags::RECORDING_STATE);

    let branch_index = generator.restore_loops.branch_register_index();
    let branch_name = riscv64::gpr_name(branch_index);
    if generator
        .is_register_reserved(&branch_name, AccessType::ReadWrite)
        .unwrap_or(false)
    {
        generator.unreserve_register(&branch_name, AccessType::ReadWrite, RegReserveType::User)?;
    } else {
        warn!("restore loop branch register {} was not reserved", branch_name);
    }
    Ok(())
}
