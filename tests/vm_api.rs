//! Virtual memory behaviour through the generator's public API.

use rvgen::arch::riscv64::PrivilegeLevel;
use rvgen::config::Config;
use rvgen::generator::Generator;
use rvgen::vm::{DumpFormat, GenPageRequest};

fn supervisor_generator() -> Generator {
    let mut generator = Generator::new_riscv(0, Config::default());
    // Sv39 with an arbitrary root PPN; paging turns on once the privilege
    // level drops out of machine mode.
    generator.set_register("satp", (8u64 << 60) | 0x80000, u64::MAX).unwrap();
    generator.set_privilege_level(PrivilegeLevel::Supervisor).unwrap();
    generator
}

#[test]
fn paging_round_trip_with_on_demand_mapping() {
    let mut generator = supervisor_generator();
    assert!(generator.vm().current_regime().paging_enabled());

    generator
        .map_address_range(0xffff_0000, 0x1000, true, &GenPageRequest::default())
        .unwrap();
    let (pa, bank) = generator.translate_va_to_pa(0xffff_0123).unwrap();
    assert_eq!(generator.translate_pa_to_va(pa, bank).unwrap(), 0xffff_0123);
}

#[test]
fn machine_mode_translates_identity() {
    let mut generator = Generator::new_riscv(0, Config::default());
    generator.set_privilege_level(PrivilegeLevel::Machine).unwrap();
    let (pa, _) = generator.translate_va_to_pa(0x8000_4444).unwrap();
    assert_eq!(pa, 0x8000_4444);
}

#[test]
fn privilege_transition_switches_regimes() {
    let mut generator = supervisor_generator();
    assert!(generator.vm().current_regime().paging_enabled());
    generator.set_privilege_level(PrivilegeLevel::Machine).unwrap();
    assert!(!generator.vm().current_regime().paging_enabled());
    // And back: the supervisor address space is still there.
    generator.set_privilege_level(PrivilegeLevel::Supervisor).unwrap();
    assert!(generator.vm().current_regime().paging_enabled());
}

#[test]
fn page_dump_lists_mapped_pages() {
    let mut generator = supervisor_generator();
    generator
        .map_address_range(0x4000_0000, 0x1000, false, &GenPageRequest::default())
        .unwrap();
    let text = generator.vm().dump_pages(DumpFormat::Text);
    assert!(text.contains("va=[0x40000000"));
    let json = generator.vm().dump_pages(DumpFormat::Json);
    assert!(json.contains("\"va_lo\":\"0x40000000\""));
}

#[test]
fn mapping_failure_reports_rejected_constraints() {
    let mut generator = supervisor_generator();
    // Force a new address over a range that is already mapped.
    generator
        .map_address_range(0x5000_0000, 0x1000, false, &GenPageRequest::default())
        .unwrap();
    let mut forced = GenPageRequest::default();
    forced.force_new_addr = true;
    let result = generator.map_address_range(0x5000_0000, 0x1000, false, &forced);
    match result {
        Err(rvgen::Error::MappingFailed { va, .. }) => assert_eq!(va, 0x5000_0000),
        other => panic!("expected MappingFailed, got {:?}", other.err()),
    }
}
