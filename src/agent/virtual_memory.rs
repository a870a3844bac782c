//! The virtual-memory agent: address generation, reverse lookups, explicit
//! page requests and physical-region registration. Results land in the
//! generator's query-result store for the caller to collect.

use log::{debug, info};

use crate::constraint::ConstraintSet;
use crate::error::Error;
use crate::generator::Generator;
use crate::memory::MemoryAttributes;
use crate::request::{GenQueryResult, GenVirtualMemoryRequest};
use crate::vm::GenPageRequest;

/// Handles one virtual-memory request.
pub fn handle(generator: &mut Generator, request: GenVirtualMemoryRequest) -> Result<(), Error> {
    match request {
        GenVirtualMemoryRequest::GenVa { size, align, is_instr, range } => {
            let va = gen_va(generator, size, align, is_instr, range)?;
            generator.query_results.push(GenQueryResult::Value(va));
            Ok(())
        }
        GenVirtualMemoryRequest::GenPa { size, align, bank } => {
            let mut candidates = generator.memory.borrow().bank(bank).usable().clone();
            candidates.align_with_size(!(align - 1), size);
            let value = candidates.choose_value(&mut generator.rng)?;
            let element = candidates.element_containing(value).expect("chosen PA left the pool");
            let last_base = (element.upper_bound() - (size - 1)) & !(align - 1);
            let pa = (value & !(align - 1)).min(last_base);
            generator.query_results.push(GenQueryResult::Value(pa));
            Ok(())
        }
        GenVirtualMemoryRequest::GenVaForPa { pa, bank, size, is_instr } => {
            let page_request = GenPageRequest::default();
            let va = generator.with_memory(|generator, memory| {
                generator.vm.map_address_range_for_pa(
                    pa,
                    bank,
                    size,
                    is_instr,
                    &page_request,
                    memory,
                    &mut generator.rng,
                )
            })?;
            generator.query_results.push(GenQueryResult::Value(va));
            Ok(())
        }
        GenVirtualMemoryRequest::GenPage { va, size, is_instr, request } => {
            generator.with_memory(|generator, memory| {
                generator.vm.map_address_range(
                    va,
                    size,
                    is_instr,
                    &request,
                    memory,
                    &mut generator.rng,
                )
            })?;
            generator.gen_pc.invalidate();
            Ok(())
        }
        GenVirtualMemoryRequest::PhysicalRegion { region } => {
            info!(
                "registering physical region {:?} [0x{:x}-0x{:x}]",
                region.name, region.start, region.end
            );
            let span = ConstraintSet::from_range(region.start, region.end);
            {
                let mut memory = generator.memory.borrow_mut();
                memory.bank_mut(region.bank).reserve_memory(&span);
                memory.add_physical_region(region.clone());
            }
            // The region must stay reachable: identity-map it when paging.
            if generator.vm.current_regime().paging_enabled() {
                let mut page_request = GenPageRequest::default();
                page_request.flat_map = true;
                page_request.can_alias = true;
                generator.with_memory(|generator, memory| {
                    generator.vm.map_address_range(
                        region.start,
                        region.end - region.start + 1,
                        false,
                        &page_request,
                        memory,
                        &mut generator.rng,
                    )
                })?;
            }
            Ok(())
        }
        GenVirtualMemoryRequest::UpdateVm => generator.update_vm(),
    }
}

/// Generates a virtual address with `size` usable bytes at `align`ment,
/// drawn from the usable space (optionally intersected with a caller
/// range), and guarantees the chosen range is mapped.
fn gen_va(
    generator: &mut Generator,
    size: u64,
    align: u64,
    is_instr: bool,
    range: Option<ConstraintSet>,
) -> Result<u64, Error> {
    assert!(align.is_power_of_two(), "va-alignment-not-power-of-two");
    let mut candidates = generator.virtual_usable_constraint(is_instr);
    if candidates.is_empty() {
        // Nothing mapped for this intent yet; draw from the whole
        // translatable space and let the mapping below allocate on demand.
        let regime = generator.vm.current_regime();
        let max_va = if regime.paging_enabled() {
            regime.paging_mapper().mode().max_virtual_address()
        } else {
            u64::MAX
        };
        candidates = ConstraintSet::from_range(0x1000, max_va);
    }
    if let Some(range) = &range {
        candidates.apply_constraint_set(range);
    }
    candidates.align_with_size(!(align - 1), size);
    if candidates.is_empty() {
        return Err(Error::ConstraintExhausted(format!(
            "no VA with 0x{:x} bytes at alignment 0x{:x}",
            size, align
        )));
    }
    let value = candidates.choose_value(&mut generator.rng)?;
    let element = candidates.element_containing(value).expect("chosen VA left the pool");
    let last_base = (element.upper_bound() - (size - 1)) & !(align - 1);
    let va = (value & !(align - 1)).min(last_base);

    let page_request = GenPageRequest::default();
    generator.with_memory(|generator, memory| {
        generator.vm.map_address_range(va, size, is_instr, &page_request, memory, &mut generator.rng)
    })?;
    debug!("generated VA 0x{:x} (size 0x{:x}, align 0x{:x})", va, size, align);
    Ok(va)
}

/// Initialises a data block at a generated VA; helper used by templates.
pub fn initialize_data_block(
    generator: &mut Generator,
    va: u64,
    data: Vec<u8>,
) -> Result<(), Error> {
    let (pa, bank) = generator.translate_va_to_pa(va)?;
    generator.initialize_memory(bank, pa, data, MemoryAttributes::DATA);
    Ok(())
}
