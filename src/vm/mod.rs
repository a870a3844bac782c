//! The virtual memory system: translation regimes, their mappers and
//! address spaces, page tables and address tagging. The manager tracks which
//! regime is live, reacts to translation control register updates and
//! answers every VA/PA question the rest of the generator asks.

pub mod address_space;
pub mod context;
pub mod mapper;
pub mod page;
pub mod page_table;

use std::fmt::Write as _;

use log::{debug, info};
use num_traits::FromPrimitive as _;

use crate::arch::riscv64::{self, PrivilegeLevel, SatpMode};
use crate::error::Error;
use crate::memory::{MemBank, MemoryManager};
use crate::rng::Rng;
use crate::vm::context::VmContext;
use crate::vm::mapper::{VmDirectMapper, VmPagingMapper};
use crate::vm::page::{PageAttributes, TranslationRange};

/// Attributes steering one mapping request.
#[derive(Clone, Debug)]
pub struct GenPageRequest {
    /// Target bank; the regime default when absent.
    pub bank: Option<MemBank>,
    /// Map VA to this exact PA (page-aligned internally).
    pub force_alias: Option<(u64, MemBank)>,
    /// Identity-map the page.
    pub flat_map: bool,
    /// Allow the PA to overlap already-allocated memory.
    pub can_alias: bool,
    /// Fail rather than reuse an existing mapping.
    pub force_new_addr: bool,
    /// Fixed page size in address bits, e.g. 12 for 4 KiB.
    pub page_size_bits: Option<u32>,
    /// Additional architectural page attributes.
    pub extra_attributes: PageAttributes,
}

impl Default for GenPageRequest {
    fn default() -> Self {
        Self {
            bank: None,
            force_alias: None,
            flat_map: false,
            can_alias: false,
            force_new_addr: false,
            page_size_bits: None,
            extra_attributes: PageAttributes::empty(),
        }
    }
}

/// Architectural address tagging: tag bits are stripped before translation
/// and re-applied to returned addresses.
#[derive(Clone, Copy, Debug)]
pub struct AddressTagging {
    enabled: bool,
    tag_lsb: u32,
}

impl AddressTagging {
    pub fn new(enabled: bool, tag_lsb: u32) -> Self {
        Self { enabled, tag_lsb }
    }

    fn address_mask(&self) -> u64 {
        (1u64 << self.tag_lsb) - 1
    }

    /// Removes the tag bits from an address.
    pub fn untag(&self, va: u64) -> u64 {
        if self.enabled {
            va & self.address_mask()
        } else {
            va
        }
    }

    /// Re-applies the tag of `original` onto an untagged address.
    pub fn retag(&self, va: u64, original: u64) -> u64 {
        if self.enabled {
            (original & !self.address_mask()) | (va & self.address_mask())
        } else {
            va
        }
    }
}

/// Translation regimes of the modelled platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmRegimeType {
    /// Machine mode; translation is always off.
    Machine,
    /// Supervisor/user mode under satp control.
    Supervisor,
}

/// Page dump formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpFormat {
    Text,
    Json,
}

/// One translation regime: a direct mapper for translation-off operation and
/// a paging mapper for translation-on, with one of them current.
pub struct VmRegime {
    regime_type: VmRegimeType,
    default_bank: MemBank,
    direct: VmDirectMapper,
    paging: VmPagingMapper,
    paging_on: bool,
    tagging: AddressTagging,
}

impl VmRegime {
    pub fn new(regime_type: VmRegimeType, mode: SatpMode, default_bank: MemBank) -> Self {
        Self {
            regime_type,
            default_bank,
            direct: VmDirectMapper::new(default_bank),
            paging: VmPagingMapper::new(mode, default_bank, riscv64::page_size_choices(mode)),
            paging_on: false,
            tagging: AddressTagging::new(false, 56),
        }
    }

    pub fn regime_type(&self) -> VmRegimeType {
        self.regime_type
    }

    pub fn default_memory_bank(&self) -> MemBank {
        self.default_bank
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging_on
    }

    pub fn address_tagging(&self) -> &AddressTagging {
        &self.tagging
    }

    pub fn paging_mapper(&self) -> &VmPagingMapper {
        &self.paging
    }

    pub fn paging_mapper_mut(&mut self) -> &mut VmPagingMapper {
        &mut self.paging
    }

    /// Context register names whose writes must reach the regime.
    pub fn register_context(&self) -> &'static [&'static str] {
        match self.regime_type {
            VmRegimeType::Machine => &["PRIV"],
            VmRegimeType::Supervisor => &["satp", "mstatus", "PRIV"],
        }
    }

    /// Applies a translation-context update; switches the current mapper and
    /// address space as needed.
    pub fn update_context(
        &mut self,
        context: &VmContext,
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<(), Error> {
        let mode = context
            .field("satp.MODE")
            .and_then(SatpMode::from_u64)
            .unwrap_or(SatpMode::Bare);
        if self.regime_type == VmRegimeType::Machine || mode == SatpMode::Bare {
            if self.paging_on {
                debug!("{:?} regime dropping to direct mapping", self.regime_type);
            }
            self.paging_on = false;
            return Ok(());
        }
        self.paging.set_mode(mode);
        self.paging_on = true;
        let context_id = self.paging.switch_to_context(context, memory, rng)?;
        info!("{:?} regime active on context {}", self.regime_type, context_id);
        Ok(())
    }

    pub fn translate_va_to_pa(&self, va: u64) -> Result<(u64, MemBank), Error> {
        let untagged = self.tagging.untag(va);
        if self.paging_on {
            self.paging.translate_va_to_pa(untagged)
        } else {
            self.direct.translate_va_to_pa(untagged)
        }
    }

    pub fn translate_pa_to_va(&self, pa: u64, bank: MemBank) -> Result<u64, Error> {
        if self.paging_on {
            self.paging.translate_pa_to_va(pa, bank)
        } else {
            self.direct.translate_pa_to_va(pa, bank)
        }
    }

    /// The translation window covering `va`.
    pub fn translation_range(&self, va: u64) -> Result<TranslationRange, Error> {
        let untagged = self.tagging.untag(va);
        if self.paging_on {
            self.paging.translation_range(untagged)
        } else {
            Ok(self.direct.translation_range(untagged))
        }
    }

    pub fn map_address_range(
        &mut self,
        va: u64,
        size: u64,
        is_instr: bool,
        request: &GenPageRequest,
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<(), Error> {
        let untagged = self.tagging.untag(va);
        if self.paging_on {
            self.paging.map_address_range(untagged, size, is_instr, request, memory, rng)
        } else {
            // Direct mapping never needs pages; the range is usable as-is.
            Ok(())
        }
    }

    pub fn map_address_range_for_pa(
        &mut self,
        pa: u64,
        bank: MemBank,
        size: u64,
        is_instr: bool,
        request: &GenPageRequest,
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<u64, Error> {
        if self.paging_on {
            self.paging.map_address_range_for_pa(pa, bank, size, is_instr, request, memory, rng)
        } else {
            self.direct.translate_pa_to_va(pa, bank)
        }
    }

    /// Renders the regime's pages in the requested dump format.
    pub fn dump_pages(&self, format: DumpFormat, out: &mut String) {
        for space in self.paging.address_spaces() {
            for page in space.pages() {
                match format {
                    DumpFormat::Text => {
                        let _ = writeln!(
                            out,
                            "{:?} ctx={} va=[0x{:x}-0x{:x}] pa=[{:?}]0x{:x} level={} attrs={:?}",
                            self.regime_type,
                            space.context_id(),
                            page.va_lo,
                            page.va_hi,
                            page.bank,
                            page.pa_lo,
                            page.level,
                            page.attributes
                        );
                    }
                    DumpFormat::Json => {
                        let _ = writeln!(
                            out,
                            "{{\"regime\":\"{:?}\",\"context\":{},\"va_lo\":\"0x{:x}\",\"va_hi\":\"0x{:x}\",\"bank\":\"{:?}\",\"pa_lo\":\"0x{:x}\",\"level\":{}}}",
                            self.regime_type,
                            space.context_id(),
                            page.va_lo,
                            page.va_hi,
                            page.bank,
                            page.pa_lo,
                            page.level
                        );
                    }
                }
            }
        }
    }
}

/// The per-hart virtual memory manager: all regimes plus the current one.
pub struct VmManager {
    regimes: Vec<VmRegime>,
    current: usize,
}

impl VmManager {
    /// Builds the RISC-V regimes: machine (always direct) and supervisor
    /// (satp-controlled, defaulting to Sv48 once paging turns on).
    pub fn new_riscv(default_bank: MemBank) -> Self {
        Self {
            regimes: vec![
                VmRegime::new(VmRegimeType::Machine, SatpMode::Bare, default_bank),
                VmRegime::new(VmRegimeType::Supervisor, SatpMode::Sv48, default_bank),
            ],
            current: 0,
        }
    }

    pub fn current_regime(&self) -> &VmRegime {
        &self.regimes[self.current]
    }

    pub fn current_regime_mut(&mut self) -> &mut VmRegime {
        &mut self.regimes[self.current]
    }

    pub fn regime(&self, regime_type: VmRegimeType) -> &VmRegime {
        self.regimes.iter().find(|r| r.regime_type() == regime_type).expect("unknown-regime")
    }

    pub fn regime_mut(&mut self, regime_type: VmRegimeType) -> &mut VmRegime {
        self.regimes
            .iter_mut()
            .find(|r| r.regime_type() == regime_type)
            .expect("unknown-regime")
    }

    /// Reacts to a translation control update: picks the regime for the
    /// privilege level and hands the context to it. Returns whether the
    /// current mapper changed.
    pub fn update_translation_state(
        &mut self,
        privilege: PrivilegeLevel,
        satp_value: u64,
        sum_mxr: (u64, u64),
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<bool, Error> {
        let target = match privilege {
            PrivilegeLevel::Machine => VmRegimeType::Machine,
            _ => VmRegimeType::Supervisor,
        };
        let previous = self.current;
        self.current = self
            .regimes
            .iter()
            .position(|r| r.regime_type() == target)
            .expect("unknown-regime");

        let context = VmContext::new()
            .with_field("privilege", privilege as u64)
            .with_field("satp.MODE", satp_value >> 60)
            .with_field("satp.ASID", (satp_value >> 44) & 0xffff)
            .with_field("satp.PPN", satp_value & ((1u64 << 44) - 1))
            .with_field("mstatus.SUM", sum_mxr.0)
            .with_field("mstatus.MXR", sum_mxr.1);
        self.regimes[self.current].update_context(&context, memory, rng)?;
        Ok(previous != self.current)
    }

    pub fn translate_va_to_pa(&self, va: u64) -> Result<(u64, MemBank), Error> {
        self.current_regime().translate_va_to_pa(va)
    }

    pub fn translate_pa_to_va(&self, pa: u64, bank: MemBank) -> Result<u64, Error> {
        self.current_regime().translate_pa_to_va(pa, bank)
    }

    pub fn map_address_range(
        &mut self,
        va: u64,
        size: u64,
        is_instr: bool,
        request: &GenPageRequest,
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<(), Error> {
        self.current_regime_mut().map_address_range(va, size, is_instr, request, memory, rng)
    }

    pub fn map_address_range_for_pa(
        &mut self,
        pa: u64,
        bank: MemBank,
        size: u64,
        is_instr: bool,
        request: &GenPageRequest,
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<u64, Error> {
        self.current_regime_mut()
            .map_address_range_for_pa(pa, bank, size, is_instr, request, memory, rng)
    }

    /// Dumps every regime's pages.
    pub fn dump_pages(&self, format: DumpFormat) -> String {
        let mut out = String::new();
        for regime in &self.regimes {
            regime.dump_pages(format, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (VmManager, MemoryManager, Rng) {
        let mut memory = MemoryManager::new();
        memory.add_memory_range(MemBank::Default, 0x8000_0000, 0x9fff_ffff);
        (VmManager::new_riscv(MemBank::Default), memory, Rng::new(0x5eed))
    }

    fn supervisor_satp() -> u64 {
        (8u64 << 60) | 0x80000 // Sv39, PPN arbitrary
    }

    #[test]
    fn machine_mode_is_direct_mapped() {
        let (mut vm, mut memory, mut rng) = setup();
        vm.update_translation_state(
            PrivilegeLevel::Machine,
            supervisor_satp(),
            (0, 0),
            &mut memory,
            &mut rng,
        )
        .unwrap();
        assert!(!vm.current_regime().paging_enabled());
        let (pa, bank) = vm.translate_va_to_pa(0x8000_1234).unwrap();
        assert_eq!((pa, bank), (0x8000_1234, MemBank::Default));
    }

    #[test]
    fn map_and_round_trip_through_pages() {
        let (mut vm, mut memory, mut rng) = setup();
        vm.update_translation_state(
            PrivilegeLevel::Supervisor,
            supervisor_satp(),
            (0, 0),
            &mut memory,
            &mut rng,
        )
        .unwrap();
        assert!(vm.current_regime().paging_enabled());

        let request = GenPageRequest::default();
        vm.map_address_range(0xffff_0000, 0x1000, true, &request, &mut memory, &mut rng).unwrap();
        let (pa, bank) = vm.translate_va_to_pa(0xffff_0123).unwrap();
        let va = vm.translate_pa_to_va(pa, bank).unwrap();
        assert_eq!(va, 0xffff_0123);
        // The reverse mapping request resolves to the same VA.
        let mapped = vm
            .map_address_range_for_pa(
                pa,
                bank,
                0x1000,
                true,
                &request,
                &mut memory,
                &mut rng,
            )
            .unwrap();
        assert_eq!(mapped, 0xffff_0123 & !0u64);
    }

    #[test]
    fn equal_contexts_reuse_the_address_space() {
        let (mut vm, mut memory, mut rng) = setup();
        vm.update_translation_state(
            PrivilegeLevel::Supervisor,
            supervisor_satp(),
            (0, 0),
            &mut memory,
            &mut rng,
        )
        .unwrap();
        let first = vm.current_regime().paging_mapper().current_address_space().unwrap().context_id();
        // Same satp again: same address space instance.
        vm.update_translation_state(
            PrivilegeLevel::Supervisor,
            supervisor_satp(),
            (0, 0),
            &mut memory,
            &mut rng,
        )
        .unwrap();
        let second =
            vm.current_regime().paging_mapper().current_address_space().unwrap().context_id();
        assert_eq!(first, second);

        // A different ASID is a different space sharing the same root.
        let other_satp = supervisor_satp() | (1u64 << 44);
        vm.update_translation_state(
            PrivilegeLevel::Supervisor,
            other_satp,
            (0, 0),
            &mut memory,
            &mut rng,
        )
        .unwrap();
        let third = vm.current_regime().paging_mapper().current_address_space().unwrap().context_id();
        assert_ne!(first, third);
        let spaces = vm.current_regime().paging_mapper().address_spaces();
        let roots: Vec<_> = spaces.iter().map(|s| s.root().borrow().table().table_base()).collect();
        assert_eq!(roots[0], roots[1]);
    }

    #[test]
    fn address_tagging_strips_and_restores() {
        let tagging = AddressTagging::new(true, 56);
        let tagged = 0xab00_1234_5678_9abc;
        let untagged = tagging.untag(tagged);
        assert_eq!(untagged, 0x0000_1234_5678_9abc);
        assert_eq!(tagging.retag(untagged, tagged), tagged);
    }
}
