//! Pages and translation ranges.

use bitflags::bitflags;

use crate::memory::MemBank;

bitflags! {
    /// Architectural page attributes, mirroring the RISC-V PTE permission
    /// and status bits.
    pub struct PageAttributes: u32 {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXECUTE  = 1 << 3;
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
    }
}

/// One mapped page: a VA span bound to a PA span in one bank.
#[derive(Clone, Debug)]
pub struct Page {
    pub va_lo: u64,
    pub va_hi: u64,
    pub pa_lo: u64,
    pub pa_hi: u64,
    pub bank: MemBank,
    /// Table level the leaf sits at; level 0 is the smallest page.
    pub level: u32,
    pub attributes: PageAttributes,
}

impl Page {
    pub fn size(&self) -> u64 {
        self.va_hi - self.va_lo + 1
    }

    pub fn contains_va(&self, va: u64) -> bool {
        va >= self.va_lo && va <= self.va_hi
    }

    pub fn contains_pa(&self, pa: u64, bank: MemBank) -> bool {
        bank == self.bank && pa >= self.pa_lo && pa <= self.pa_hi
    }

    pub fn translate_va_to_pa(&self, va: u64) -> u64 {
        debug_assert!(self.contains_va(va));
        self.pa_lo + (va - self.va_lo)
    }

    pub fn translate_pa_to_va(&self, pa: u64) -> u64 {
        debug_assert!(pa >= self.pa_lo && pa <= self.pa_hi);
        self.va_lo + (pa - self.pa_lo)
    }
}

/// A cached translation window, the form [`GenPC`](crate::gen_pc::GenPC)
/// holds while the PC stays inside one page.
#[derive(Clone, Copy, Debug)]
pub struct TranslationRange {
    pub va_lo: u64,
    pub va_hi: u64,
    pub pa_base: u64,
    pub bank: MemBank,
}

impl TranslationRange {
    pub fn from_page(page: &Page) -> Self {
        Self { va_lo: page.va_lo, va_hi: page.va_hi, pa_base: page.pa_lo, bank: page.bank }
    }

    pub fn contains(&self, va: u64) -> bool {
        va >= self.va_lo && va <= self.va_hi
    }

    pub fn translate(&self, va: u64) -> u64 {
        debug_assert!(self.contains(va));
        self.pa_base + (va - self.va_lo)
    }
}
