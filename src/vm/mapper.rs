//! Mappers: the direct one-to-one mapping used while paging is off, and the
//! paging mapper owning the address spaces of one translation regime.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info};

use crate::arch::riscv64::SatpMode;
use crate::config::Choice;
use crate::constraint::ConstraintSet;
use crate::error::Error;
use crate::memory::{MemBank, MemoryManager};
use crate::rng::Rng;
use crate::vm::address_space::VmAddressSpace;
use crate::vm::context::VmContext;
use crate::vm::page::TranslationRange;
use crate::vm::page_table::RootPageTable;
use crate::vm::GenPageRequest;

/// Identity mapping within one bank, used when translation is off.
pub struct VmDirectMapper {
    bank: MemBank,
    max_address: u64,
}

impl VmDirectMapper {
    pub fn new(bank: MemBank) -> Self {
        Self { bank, max_address: u64::MAX }
    }

    pub fn translate_va_to_pa(&self, va: u64) -> Result<(u64, MemBank), Error> {
        if va > self.max_address {
            return Err(Error::NotTranslated(va));
        }
        Ok((va, self.bank))
    }

    pub fn translate_pa_to_va(&self, pa: u64, bank: MemBank) -> Result<u64, Error> {
        if bank != self.bank {
            return Err(Error::NoVaForPa(pa));
        }
        Ok(pa)
    }

    pub fn translation_range(&self, va: u64) -> TranslationRange {
        // One flat window; callers re-fetch when crossing page boundaries,
        // which the flat window makes a no-op.
        let _ = va;
        TranslationRange { va_lo: 0, va_hi: self.max_address, pa_base: 0, bank: self.bank }
    }

    pub fn default_memory_bank(&self) -> MemBank {
        self.bank
    }
}

/// The paging mapper of one regime: finds, creates and switches address
/// spaces by translation context.
pub struct VmPagingMapper {
    mode: SatpMode,
    default_bank: MemBank,
    address_spaces: Vec<VmAddressSpace>,
    current: Option<usize>,
    page_choices: Vec<Choice>,
    next_context_id: u32,
}

impl VmPagingMapper {
    pub fn new(mode: SatpMode, default_bank: MemBank, page_choices: Vec<Choice>) -> Self {
        Self {
            mode,
            default_bank,
            address_spaces: Vec::new(),
            current: None,
            page_choices,
            next_context_id: 1,
        }
    }

    pub fn mode(&self) -> SatpMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SatpMode) {
        if self.mode != mode {
            assert!(
                self.address_spaces.is_empty(),
                "translation-mode-change-with-live-address-spaces"
            );
            self.mode = mode;
        }
    }

    pub fn page_choices(&self) -> &[Choice] {
        &self.page_choices
    }

    /// The index of the address space matching the context, when one exists.
    /// Two equal contexts always resolve to the same address space.
    pub fn find_address_space(&self, context: &VmContext) -> Option<usize> {
        self.address_spaces.iter().position(|space| space.context() == context)
    }

    /// Finds or creates the address space for a context and returns its
    /// index. A fresh space shares the root table of any existing space with
    /// a compatible root placement.
    pub fn find_or_create_address_space(
        &mut self,
        context: &VmContext,
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<usize, Error> {
        if let Some(index) = self.find_address_space(context) {
            return Ok(index);
        }

        let root = match self
            .address_spaces
            .iter()
            .find(|space| space.context().compatible_root(context))
        {
            Some(space) => {
                debug!("address space shares root with context {}", space.context_id());
                space.root().clone()
            }
            None => {
                let step = self.mode.table_step();
                let table_bytes = 1u64 << (step + super::page_table::PTE_SHIFT);
                let base = memory.bank_mut(self.default_bank).allocate_free_block(
                    !(table_bytes - 1),
                    table_bytes,
                    None,
                    rng,
                )?;
                Rc::new(RefCell::new(RootPageTable::new(
                    self.mode.levels(),
                    self.mode.highest_va_bit(),
                    step,
                    base,
                    self.default_bank,
                )))
            }
        };

        let context_id = self.next_context_id;
        self.next_context_id += 1;
        info!("creating address space {} for context {:?}", context_id, context);
        let space =
            VmAddressSpace::new(context.clone(), context_id, self.mode, self.default_bank, root);
        self.address_spaces.push(space);
        Ok(self.address_spaces.len() - 1)
    }

    /// Switches the mapper onto the address space of the context.
    pub fn switch_to_context(
        &mut self,
        context: &VmContext,
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<u32, Error> {
        let index = self.find_or_create_address_space(context, memory, rng)?;
        self.current = Some(index);
        Ok(self.address_spaces[index].context_id())
    }

    pub fn current_address_space(&self) -> Option<&VmAddressSpace> {
        self.current.map(|index| &self.address_spaces[index])
    }

    pub fn current_address_space_mut(&mut self) -> Option<&mut VmAddressSpace> {
        let index = self.current?;
        Some(&mut self.address_spaces[index])
    }

    pub fn address_spaces(&self) -> &[VmAddressSpace] {
        &self.address_spaces
    }

    fn require_current(&self) -> Result<&VmAddressSpace, Error> {
        self.current_address_space().ok_or_else(|| Error::MappingFailed {
            va: 0,
            size: 0,
            rejected: "no active address space".to_string(),
        })
    }

    pub fn translate_va_to_pa(&self, va: u64) -> Result<(u64, MemBank), Error> {
        self.require_current()?.translate_va_to_pa(va)
    }

    pub fn translate_pa_to_va(&self, pa: u64, bank: MemBank) -> Result<u64, Error> {
        self.require_current()?.translate_pa_to_va(pa, bank)
    }

    /// The translation window of the page covering `va`.
    pub fn translation_range(&self, va: u64) -> Result<TranslationRange, Error> {
        let space = self.require_current()?;
        let page = space.page_containing_va(va).ok_or(Error::NotTranslated(va))?;
        Ok(TranslationRange::from_page(page))
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
        let choices = self.page_choices.clone();
        let space = self.current_address_space_mut().ok_or(Error::NotTranslated(va))?;
        space.map_address_range(va, size, is_instr, request, &choices, memory, rng)
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
        let choices = self.page_choices.clone();
        let space = self.current_address_space_mut().ok_or(Error::NoVaForPa(pa))?;
        space.map_address_range_for_pa(pa, bank, size, is_instr, request, &choices, memory, rng)
    }

    /// The usable VA spans of the current address space for an intent.
    pub fn virtual_usable_constraint(&self, is_instr: bool) -> ConstraintSet {
        self.current_address_space().map(|s| s.usable(is_instr).clone()).unwrap_or_default()
    }
}
