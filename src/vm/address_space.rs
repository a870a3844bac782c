//! One virtual address space: the pages it owns, the (possibly shared)
//! translation tree behind them, and on-demand page allocation honouring the
//! page request attributes.

use std::cell::RefCell;
use std::rc::Rc;

use log::info;

use crate::arch::riscv64::SatpMode;
use crate::config::Choice;
use crate::constraint::ConstraintSet;
use crate::error::Error;
use crate::memory::{MemBank, MemoryManager};
use crate::rng::Rng;
use crate::vm::context::VmContext;
use crate::vm::page::{Page, PageAttributes};
use crate::vm::page_table::RootPageTable;
use crate::vm::GenPageRequest;

/// A virtual address space bound to one translation context.
pub struct VmAddressSpace {
    context: VmContext,
    context_id: u32,
    mode: SatpMode,
    default_bank: MemBank,
    root: Rc<RefCell<RootPageTable>>,
    /// Owned pages, sorted by `va_lo`. The root table holds the same pages
    /// by reference; a shared root keeps them alive as long as any holder.
    pages: Vec<Rc<Page>>,
    instr_usable: ConstraintSet,
    data_usable: ConstraintSet,
    /// Identity-map new pages unless the request says otherwise.
    flat_map: bool,
}

impl VmAddressSpace {
    pub fn new(
        context: VmContext,
        context_id: u32,
        mode: SatpMode,
        default_bank: MemBank,
        root: Rc<RefCell<RootPageTable>>,
    ) -> Self {
        root.borrow_mut().sign_up(context_id);
        Self {
            context,
            context_id,
            mode,
            default_bank,
            root,
            pages: Vec::new(),
            instr_usable: ConstraintSet::new(),
            data_usable: ConstraintSet::new(),
            flat_map: false,
        }
    }

    pub fn context(&self) -> &VmContext {
        &self.context
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn mode(&self) -> SatpMode {
        self.mode
    }

    pub fn root(&self) -> &Rc<RefCell<RootPageTable>> {
        &self.root
    }

    pub fn default_bank(&self) -> MemBank {
        self.default_bank
    }

    pub fn set_flat_map(&mut self, flat: bool) {
        self.flat_map = flat;
    }

    pub fn pages(&self) -> &[Rc<Page>] {
        &self.pages
    }

    /// The VA spans mapped for the given intent.
    pub fn usable(&self, is_instr: bool) -> &ConstraintSet {
        if is_instr {
            &self.instr_usable
        } else {
            &self.data_usable
        }
    }

    /// The page covering `va`, when one exists.
    pub fn page_containing_va(&self, va: u64) -> Option<&Rc<Page>> {
        let index = self.pages.partition_point(|p| p.va_hi < va);
        self.pages.get(index).filter(|p| p.contains_va(va))
    }

    /// The page covering `(pa, bank)`, when one exists.
    pub fn page_containing_pa(&self, pa: u64, bank: MemBank) -> Option<&Rc<Page>> {
        self.pages.iter().find(|p| p.contains_pa(pa, bank))
    }

    /// Translates a virtual address.
    pub fn translate_va_to_pa(&self, va: u64) -> Result<(u64, MemBank), Error> {
        let page = self.page_containing_va(va).ok_or(Error::NotTranslated(va))?;
        Ok((page.translate_va_to_pa(va), page.bank))
    }

    /// Reverse-translates a physical address.
    pub fn translate_pa_to_va(&self, pa: u64, bank: MemBank) -> Result<u64, Error> {
        let page = self.page_containing_pa(pa, bank).ok_or(Error::NoVaForPa(pa))?;
        Ok(page.translate_pa_to_va(pa))
    }

    /// Maps `[va, va + size)`, allocating pages on demand. Existing pages are
    /// reused; new pages honour the request attributes; any allocation
    /// failure surfaces as [`Error::MappingFailed`] with the rejected
    /// constraints, never a silently wrong mapping.
    pub fn map_address_range(
        &mut self,
        va: u64,
        size: u64,
        is_instr: bool,
        request: &GenPageRequest,
        page_choices: &[Choice],
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<(), Error> {
        assert!(size > 0, "map-address-range-empty");
        let end = va.checked_add(size - 1).expect("map-address-range-wraps");
        if end > self.mode.max_virtual_address() {
            return Err(Error::MappingFailed {
                va,
                size,
                rejected: format!("beyond max VA 0x{:x}", self.mode.max_virtual_address()),
            });
        }

        let mut addr = va;
        loop {
            if let Some(page) = self.page_containing_va(addr) {
                if request.force_new_addr {
                    return Err(Error::MappingFailed {
                        va,
                        size,
                        rejected: format!("VA 0x{:x} already mapped, new address forced", addr),
                    });
                }
                let next = page.va_hi;
                if next >= end {
                    return Ok(());
                }
                addr = next + 1;
                continue;
            }
            let page = self.allocate_page(addr, end, is_instr, request, page_choices, memory, rng)?;
            let next = page.va_hi;
            if next >= end {
                return Ok(());
            }
            addr = next + 1;
        }
    }

    /// Reverse mapping: ensures `[pa, pa + size)` has a virtual mapping and
    /// returns the VA of `pa`. A matching VA is allocated when none exists.
    pub fn map_address_range_for_pa(
        &mut self,
        pa: u64,
        bank: MemBank,
        size: u64,
        is_instr: bool,
        request: &GenPageRequest,
        page_choices: &[Choice],
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<u64, Error> {
        if let Some(page) = self.page_containing_pa(pa, bank) {
            return Ok(page.translate_pa_to_va(pa));
        }

        // Prefer the identity VA; fall back to random page-aligned spots.
        let page_bits = self.mode.page_shift(0);
        let page_mask = !((1u64 << page_bits) - 1);
        let mut aliased = request.clone();
        aliased.force_alias = Some((pa & page_mask, bank));

        let mut candidates: Vec<u64> = Vec::new();
        if pa <= self.mode.max_virtual_address() {
            candidates.push(pa & page_mask);
        }
        for _ in 0..8 {
            candidates.push(rng.below(self.mode.max_virtual_address() >> page_bits) << page_bits);
        }
        for base in candidates {
            if self.page_containing_va(base).is_some() {
                continue;
            }
            match self.map_address_range(
                base,
                1u64 << page_bits,
                is_instr,
                &aliased,
                page_choices,
                memory,
                rng,
            ) {
                Ok(()) => return Ok(base + (pa & !page_mask)),
                Err(_) => continue,
            }
        }
        Err(Error::MappingFailed {
            va: pa,
            size,
            rejected: format!("no free VA for PA 0x{:x} in bank {:?}", pa, bank),
        })
    }

    /// Picks a page level for a fresh mapping at `va`: the page must be
    /// naturally aligned at `va` and is chosen from the configured size
    /// weights, preferring what the weights allow.
    fn choose_page_level(
        &self,
        va: u64,
        _end: u64,
        request: &GenPageRequest,
        page_choices: &[Choice],
        rng: &mut Rng,
    ) -> u32 {
        if let Some(bits) = request.page_size_bits {
            return (bits - 12) / self.mode.table_step();
        }
        let usable: Vec<&Choice> = page_choices
            .iter()
            .filter(|c| {
                let level = c.value as u32;
                if level >= self.mode.levels() {
                    return false;
                }
                let bits = self.mode.page_shift(level);
                let page_size = 1u64 << bits;
                // Natural alignment, and no collision with neighbours.
                va & (page_size - 1) == 0 && self.span_is_unmapped(va, va + page_size - 1)
            })
            .collect();
        let weights: Vec<u32> = usable.iter().map(|c| c.weight).collect();
        match rng.pick_weighted(&weights) {
            Some(index) => usable[index].value as u32,
            None => 0,
        }
    }

    fn span_is_unmapped(&self, lo: u64, hi: u64) -> bool {
        let index = self.pages.partition_point(|p| p.va_hi < lo);
        self.pages.get(index).map_or(true, |p| p.va_lo > hi)
    }

    /// Allocates and commits one page covering `va`.
    #[allow(clippy::too_many_arguments)]
    fn allocate_page(
        &mut self,
        va: u64,
        end: u64,
        is_instr: bool,
        request: &GenPageRequest,
        page_choices: &[Choice],
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<Rc<Page>, Error> {
        let level = self.choose_page_level(va, end, request, page_choices, rng);
        let bits = self.mode.page_shift(level);
        let page_size = 1u64 << bits;
        let va_lo = va & !(page_size - 1);
        if !self.span_is_unmapped(va_lo, va_lo + page_size - 1) {
            // The aligned base collides with a neighbour; retreat to the
            // smallest page, which is always collision-free here.
            return self.allocate_small_page(va, is_instr, request, memory, rng);
        }
        self.commit_page(va_lo, level, is_instr, request, memory, rng)
    }

    fn allocate_small_page(
        &mut self,
        va: u64,
        is_instr: bool,
        request: &GenPageRequest,
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<Rc<Page>, Error> {
        let bits = self.mode.page_shift(0);
        let va_lo = va & !((1u64 << bits) - 1);
        self.commit_page(va_lo, 0, is_instr, request, memory, rng)
    }

    fn commit_page(
        &mut self,
        va_lo: u64,
        level: u32,
        is_instr: bool,
        request: &GenPageRequest,
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<Rc<Page>, Error> {
        let bits = self.mode.page_shift(level);
        let page_size = 1u64 << bits;
        let bank = request.bank.unwrap_or(self.default_bank);

        let pa_lo = if let Some((alias_pa, alias_bank)) = request.force_alias {
            assert_eq!(alias_bank, bank, "alias-bank-mismatch");
            alias_pa & !(page_size - 1)
        } else if request.flat_map || self.flat_map {
            let base = va_lo;
            if memory.bank(bank).free().contains_range(base, base + page_size - 1) {
                let mut window = ConstraintSet::from_range(base, base + page_size - 1);
                window.apply_constraint_set(memory.bank(bank).free());
                memory
                    .bank_mut(bank)
                    .allocate_free_block(!(page_size - 1), page_size, Some(&window), rng)?
            } else if request.can_alias {
                base
            } else {
                return Err(Error::MappingFailed {
                    va: va_lo,
                    size: page_size,
                    rejected: format!(
                        "flat-map PA 0x{:x} not free: {}",
                        base,
                        memory.bank(bank).free().to_simple_string()
                    ),
                });
            }
        } else {
            memory
                .bank_mut(bank)
                .allocate_free_block(!(page_size - 1), page_size, None, rng)
                .map_err(|_| Error::MappingFailed {
                    va: va_lo,
                    size: page_size,
                    rejected: memory.bank(bank).free().to_simple_string(),
                })?
        };

        let mut attributes = PageAttributes::VALID
            | PageAttributes::READ
            | PageAttributes::ACCESSED
            | PageAttributes::DIRTY
            | request.extra_attributes;
        if is_instr {
            attributes |= PageAttributes::EXECUTE;
        } else {
            attributes |= PageAttributes::WRITE;
        }

        let page = Rc::new(Page {
            va_lo,
            va_hi: va_lo + page_size - 1,
            pa_lo,
            pa_hi: pa_lo + page_size - 1,
            bank,
            level,
            attributes,
        });
        self.root.borrow_mut().table_mut().construct_page_table_walk(page.clone(), memory, rng)?;

        let position = self.pages.partition_point(|p| p.va_lo < page.va_lo);
        self.pages.insert(position, page.clone());

        let usable = if is_instr { &mut self.instr_usable } else { &mut self.data_usable };
        usable.add_range(page.va_lo, page.va_hi);

        info!(
            "context {} mapped {} page va 0x{:x}-0x{:x} => [{:?}]0x{:x} level {}",
            self.context_id,
            if is_instr { "instr" } else { "data" },
            page.va_lo,
            page.va_hi,
            page.bank,
            page.pa_lo,
            page.level
        );
        Ok(page)
    }
}
