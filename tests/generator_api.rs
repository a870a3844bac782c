//! Functional tests of the generator's public API, driven with the scripted
//! simulator double.

use std::collections::BTreeSet;

use rvgen::bnt::BntNode;
use rvgen::config::Config;
use rvgen::gen_mode::GenModeFlags;
use rvgen::generator::Generator;
use rvgen::memory::MemBank;
use rvgen::request::{
    BranchRequest, GenExceptionRequest, GenInstructionRequest, GenRequest, GenSequenceRequest,
    OperandKind, OperandRequest,
};
use rvgen::sim::{ExceptionUpdate, ExceptionUpdateKind, MemUpdate, RegUpdate, ScriptedSimApi, StepResult};

fn addi_request() -> GenInstructionRequest {
    GenInstructionRequest::new("ADDI", 0x13, 4)
        .with_operand(OperandRequest::new("rd", OperandKind::GprTarget, 7, 5))
        .with_operand(OperandRequest::new("rs1", OperandKind::GprSource, 15, 5))
        .with_operand(OperandRequest::new("simm12", OperandKind::Immediate, 20, 12))
}

fn write_update(name: &str, value: u64) -> RegUpdate {
    RegUpdate { name: name.to_string(), value, mask: u64::MAX, access: "write".to_string() }
}

#[test]
fn commit_without_simulator_advances_pc_and_writes_memory() {
    let mut generator = Generator::new_riscv(0, Config::default());
    let start = generator.pc();

    let instruction = generator.gen_instruction(addi_request()).unwrap();
    assert_eq!(instruction.va, start);
    assert_eq!(instruction.pa, start);
    assert_eq!(instruction.opcode & 0x7f, 0x13);
    assert_eq!(generator.pc(), start + 4);
    assert_eq!(generator.results().count(), 1);

    let mut buffer = [0u8; 4];
    let mask = generator.read_memory_partially_initialized(MemBank::Default, start, &mut buffer);
    assert_eq!(mask, 0xf);
    assert_eq!(u32::from_le_bytes(buffer), instruction.opcode);
}

#[test]
fn simulator_step_reconciles_registers_and_memory() {
    let mut generator = Generator::new_riscv(0, Config::default());
    let start = generator.pc();
    let mut sim = ScriptedSimApi::new();
    sim.push_step(StepResult {
        reg_updates: vec![write_update("x5", 0x1234), write_update("PC", start + 4)],
        mem_updates: vec![MemUpdate {
            bank: 0,
            va: 0x8000_2000,
            pa: 0x8000_2000,
            bytes: vec![0xaa, 0xbb],
        }],
        exception_updates: vec![],
    });
    generator.attach_simulator(Box::new(sim));

    generator.gen_instruction(addi_request()).unwrap();
    assert_eq!(generator.pc(), start + 4);
    assert_eq!(generator.registers().register_value("x5").unwrap(), 0x1234);
    assert_eq!(generator.instructions_simulated(), 1);

    let mut buffer = [0u8; 2];
    let mask =
        generator.read_memory_partially_initialized(MemBank::Default, 0x8000_2000, &mut buffer);
    assert_eq!(mask, 0b11);
    assert_eq!(buffer, [0xaa, 0xbb]);
}

#[test]
fn accurate_branch_spawns_not_taken_path_generation() {
    let mut generator = Generator::new_riscv(0, Config::default());
    let start = generator.pc();
    let target = start + 0x100;
    let mut sim = ScriptedSimApi::new();
    sim.push_pc_step(target);
    generator.attach_simulator(Box::new(sim));

    let branch = GenInstructionRequest::new("BEQ", 0x63, 4)
        .with_branch(BranchRequest { conditional: true, target: Some(target) });
    generator.gen_instruction(branch).unwrap();
    assert_eq!(generator.pc(), target);

    let mode_before = generator.mode().current_mode();
    generator
        .execute_request(GenRequest::Sequence(GenSequenceRequest::BranchNotTaken))
        .unwrap();
    // The not-taken path was opened at start+4 and closed with a branch back
    // to the taken path; the mode stack is balanced again.
    assert_eq!(generator.pc(), target);
    assert_eq!(generator.mode().current_mode(), mode_before);
}

#[test]
fn speculative_path_restores_all_touched_state() {
    let mut generator = Generator::new_riscv(0, Config::default());
    let start = generator.pc();
    let mut sim = ScriptedSimApi::new();
    sim.push_step(StepResult {
        reg_updates: vec![write_update("x5", 0xbbbb), write_update("PC", start + 0x14)],
        ..StepResult::default()
    });
    generator.attach_simulator(Box::new(sim));
    generator.set_register("x5", 0xaaaa, u64::MAX).unwrap();

    let node = BntNode::new(start + 0x200, start + 0x10, true, true);
    generator
        .execute_request(GenRequest::Sequence(GenSequenceRequest::ProcessSpeculativeBntNode(node)))
        .unwrap();
    assert!(generator.mode().is_speculative());
    assert!(!generator.mode().check_escape());
    assert_eq!(generator.pc(), start + 0x10);
    assert_eq!(generator.speculative_bnt_level(), 1);

    generator.gen_instruction(addi_request()).unwrap();
    assert_eq!(generator.registers().register_value("x5").unwrap(), 0xbbbb);

    generator
        .execute_request(GenRequest::Sequence(GenSequenceRequest::ExitSpeculativeBnt))
        .unwrap();
    // Registers, PC and mode are back at their pre-speculative values.
    assert_eq!(generator.registers().register_value("x5").unwrap(), 0xaaaa);
    assert_eq!(generator.pc(), start);
    assert!(!generator.mode().is_speculative());
    assert_eq!(generator.speculative_bnt_level(), 0);
}

#[test]
fn speculative_level_limit_drops_nodes_silently() {
    let mut config = Config::default();
    config.limits.speculative_bnt_level_limit = 0;
    let mut generator = Generator::new_riscv(0, config);
    let start = generator.pc();
    let node = BntNode::new(start + 0x200, start + 0x10, true, true);
    generator
        .execute_request(GenRequest::Sequence(GenSequenceRequest::ProcessSpeculativeBntNode(node)))
        .unwrap();
    assert!(!generator.mode().is_speculative());
    assert_eq!(generator.speculative_bnt_level(), 0);
}

#[test]
fn restore_loop_round_trip_restores_register_state() {
    let mut generator = Generator::new_riscv(0, Config::default());
    let start = generator.pc();
    let mut sim = ScriptedSimApi::new();
    sim.push_step(StepResult {
        reg_updates: vec![write_update("x6", 0x2222), write_update("PC", start + 4)],
        ..StepResult::default()
    });
    generator.attach_simulator(Box::new(sim));
    generator.set_register("x6", 0x1111, u64::MAX).unwrap();

    generator
        .execute_request(GenRequest::Sequence(GenSequenceRequest::BeginRestoreLoop {
            loop_register_index: 10,
            simulation_count: 4,
            restore_count: 1,
            exclusions: BTreeSet::new(),
        }))
        .unwrap();
    assert!(generator.mode().recording_state());
    assert!(generator.mode().in_loop());

    generator.gen_instruction(addi_request()).unwrap();
    assert_eq!(generator.registers().register_value("x6").unwrap(), 0x2222);

    generator
        .execute_request(GenRequest::Sequence(GenSequenceRequest::RestoreLoopState))
        .unwrap();
    // Every tracked delta was undone: the register and the PC.
    assert_eq!(generator.registers().register_value("x6").unwrap(), 0x1111);
    assert_eq!(generator.pc(), start);

    generator
        .execute_request(GenRequest::Sequence(GenSequenceRequest::EndRestoreLoop { loop_id: 1 }))
        .unwrap();
    assert!(!generator.mode().recording_state());
    assert!(!generator.mode().in_loop());
}

#[test]
fn exception_event_enters_and_leaves_handler() {
    let config = Config::default();
    let handler_base = config.exception_handler_base;
    let mut generator = Generator::new_riscv(0, config);
    let start = generator.pc();
    let mut sim = ScriptedSimApi::new();
    sim.push_step(StepResult {
        reg_updates: vec![write_update("PC", start + 4)],
        exception_updates: vec![ExceptionUpdate {
            kind: ExceptionUpdateKind::Exception,
            id: 2,
            comments: "illegal instruction".to_string(),
        }],
        ..StepResult::default()
    });
    generator.attach_simulator(Box::new(sim));

    generator.gen_instruction(addi_request()).unwrap();
    assert_eq!(generator.exception_stack().len(), 1);
    assert!(generator.mode().in_exception());
    assert_eq!(generator.pc(), handler_base + 2 * 0x40);

    generator
        .execute_request(GenRequest::Exception(GenExceptionRequest::ExceptionReturn))
        .unwrap();
    assert!(generator.exception_stack().is_empty());
    assert!(!generator.mode().in_exception());
    assert_eq!(generator.pc(), start + 4);
}

#[test]
fn nested_exception_is_rejected_when_disallowed() {
    let mut generator = Generator::new_riscv(0, Config::default());
    generator
        .execute_request(GenRequest::Exception(GenExceptionRequest::HandleException {
            id: 2,
            description: "first".to_string(),
        }))
        .unwrap();
    let result = generator.execute_request(GenRequest::Exception(
        GenExceptionRequest::HandleException { id: 5, description: "nested".to_string() },
    ));
    assert!(matches!(result, Err(rvgen::Error::ExceptionInException(5))));
}

#[test]
fn gen_va_respects_alignment_and_maps() {
    let mut generator = Generator::new_riscv(0, Config::default());
    let va = generator.gen_va(0x100, 0x100, false).unwrap();
    assert_eq!(va % 0x100, 0);
    // The address translates in the current (direct) regime.
    let (pa, _bank) = generator.translate_va_to_pa(va).unwrap();
    assert_eq!(pa, va);
}

#[test]
fn state_transition_memory_lands_little_endian_at_masked_offsets() {
    use rvgen::request::GenStateTransitionRequest;
    use rvgen::state_element::StateElement;

    let mut generator = Generator::new_riscv(0, Config::default());
    // Bytes 0-1 and 4-5 carry values; bytes 2-3 stay uninitialised.
    let element = StateElement::memory(
        0x8000_4000,
        MemBank::Default,
        0x0000_bbaa_0000_2211,
        0x0000_ffff_0000_ffff,
        1,
    );
    generator
        .execute_request(GenRequest::StateTransition(GenStateTransitionRequest {
            elements: vec![element],
        }))
        .unwrap();

    let mut buffer = [0u8; 8];
    let mask =
        generator.read_memory_partially_initialized(MemBank::Default, 0x8000_4000, &mut buffer);
    assert_eq!(mask, 0b0011_0011);
    assert_eq!(&buffer[0..2], &[0x11, 0x22]);
    assert_eq!(&buffer[4..6], &[0xaa, 0xbb]);
}

#[test]
fn mode_push_pop_through_requests_balances() {
    use rvgen::request::{GenStateAction, GenStateRequest, GenStateSpec};
    let mut generator = Generator::new_riscv(0, Config::default());
    let flags = GenModeFlags::SPECULATIVE | GenModeFlags::NO_ESCAPE;
    let before = generator.mode().current_mode();
    generator
        .execute_request(GenRequest::State(GenStateRequest {
            action: GenStateAction::Push,
            state: GenStateSpec::GenMode(flags),
        }))
        .unwrap();
    assert!(generator.mode().is_speculative());
    generator
        .execute_request(GenRequest::State(GenStateRequest {
            action: GenStateAction::Pop,
            state: GenStateSpec::GenMode(flags),
        }))
        .unwrap();
    assert_eq!(generator.mode().current_mode(), before);
}
