//! The modelled page table radix tree. Each table resolves a fixed bit
//! range of the virtual address; entries are either pointers to next-level
//! tables or leaf pages. Table frames are carved out of the owning bank's
//! free physical space as the walk is constructed.

use std::collections::BTreeMap;
use std::rc::Rc;

use log::debug;

use crate::error::Error;
use crate::memory::{MemBank, MemoryManager};
use crate::rng::Rng;
use crate::vm::page::Page;

/// Bytes per page table entry.
pub const PTE_SHIFT: u32 = 3;

/// One page table entry.
pub enum PageTableEntry {
    /// Pointer to a next-level table.
    Table(Box<PageTable>),
    /// Leaf entry mapping a page.
    Leaf(Rc<Page>),
}

/// A page table node resolving `[low_bit, low_bit + step)` of the VA.
pub struct PageTable {
    level: u32,
    low_bit: u32,
    step: u32,
    base: u64,
    bank: MemBank,
    entries: BTreeMap<u32, PageTableEntry>,
}

impl PageTable {
    pub fn new(level: u32, low_bit: u32, step: u32, base: u64, bank: MemBank) -> Self {
        Self { level, low_bit, step, base, bank, entries: BTreeMap::new() }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn table_base(&self) -> u64 {
        self.base
    }

    pub fn memory_bank(&self) -> MemBank {
        self.bank
    }

    /// Size in bytes of one table at this node's step.
    pub fn table_size(&self) -> u64 {
        1u64 << (self.step + PTE_SHIFT)
    }

    fn pte_index(&self, va: u64) -> u32 {
        ((va >> self.low_bit) & ((1u64 << self.step) - 1)) as u32
    }

    /// Walks the tree for the page covering `va`.
    pub fn lookup(&self, va: u64) -> Option<&Rc<Page>> {
        match self.entries.get(&self.pte_index(va))? {
            PageTableEntry::Leaf(page) => {
                if page.contains_va(va) {
                    Some(page)
                } else {
                    None
                }
            }
            PageTableEntry::Table(table) => table.lookup(va),
        }
    }

    /// Level of the first unconstructed table on the walk to `page`, or the
    /// page's own level when the walk is already complete.
    pub fn unconstructed_table_level(&self, page: &Page) -> u32 {
        if self.level == page.level {
            return page.level;
        }
        match self.entries.get(&self.pte_index(page.va_lo)) {
            Some(PageTableEntry::Table(table)) => table.unconstructed_table_level(page),
            _ => self.level - 1,
        }
    }

    /// Constructs the walk down to the page's level and commits the leaf.
    /// Intermediate table frames are allocated from the bank's free space.
    pub fn construct_page_table_walk(
        &mut self,
        page: Rc<Page>,
        memory: &mut MemoryManager,
        rng: &mut Rng,
    ) -> Result<(), Error> {
        let index = self.pte_index(page.va_lo);
        if self.level == page.level + 1 {
            // Leaf level reached.
            assert!(
                !self.entries.contains_key(&index),
                "pte-slot-already-in-use: va 0x{:x} level {}",
                page.va_lo,
                self.level
            );
            debug!(
                "commit leaf pte level {} index {} va 0x{:x}-0x{:x} pa 0x{:x}",
                self.level, index, page.va_lo, page.va_hi, page.pa_lo
            );
            self.entries.insert(index, PageTableEntry::Leaf(page));
            return Ok(());
        }

        if !matches!(self.entries.get(&index), Some(PageTableEntry::Table(_))) {
            let next_low = self.low_bit - self.step;
            let table_bytes = 1u64 << (self.step + PTE_SHIFT);
            let base = memory.bank_mut(self.bank).allocate_free_block(
                !(table_bytes - 1),
                table_bytes,
                None,
                rng,
            )?;
            debug!(
                "construct level {} table at 0x{:x} for va 0x{:x}",
                self.level - 1,
                base,
                page.va_lo
            );
            let table = PageTable::new(self.level - 1, next_low, self.step, base, self.bank);
            self.entries.insert(index, PageTableEntry::Table(Box::new(table)));
        }
        match self.entries.get_mut(&index) {
            Some(PageTableEntry::Table(table)) => {
                table.construct_page_table_walk(page, memory, rng)
            }
            _ => unreachable!("table entry vanished during walk construction"),
        }
    }

    /// Collects every mapped page under the node.
    pub fn collect_pages<'a>(&'a self, out: &mut Vec<&'a Rc<Page>>) {
        for entry in self.entries.values() {
            match entry {
                PageTableEntry::Leaf(page) => out.push(page),
                PageTableEntry::Table(table) => table.collect_pages(out),
            }
        }
    }
}

/// The root of one translation tree, possibly shared by several address
/// spaces whose contexts agree on the root placement.
pub struct RootPageTable {
    table: PageTable,
    highest_bit: u32,
    /// Context ids of the address spaces signed up on this root.
    address_spaces: Vec<u32>,
}

impl RootPageTable {
    /// Builds the root for a translation mode resolving VA bits
    /// `[low_bit, highest_bit]` at `levels` levels of `step` bits each.
    pub fn new(levels: u32, highest_bit: u32, step: u32, base: u64, bank: MemBank) -> Self {
        let low_bit = highest_bit + 1 - step;
        Self {
            table: PageTable::new(levels, low_bit, step, base, bank),
            highest_bit,
            address_spaces: Vec::new(),
        }
    }

    pub fn highest_lookup_bit(&self) -> u32 {
        self.highest_bit
    }

    pub fn root_table_size(&self) -> u64 {
        self.table.table_size()
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    /// Signs an address space up on this root.
    pub fn sign_up(&mut self, context_id: u32) {
        if !self.address_spaces.contains(&context_id) {
            self.address_spaces.push(context_id);
        }
    }

    pub fn address_spaces(&self) -> &[u32] {
        &self.address_spaces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::page::PageAttributes;

    fn test_memory() -> MemoryManager {
        let mut memory = MemoryManager::new();
        memory.add_memory_range(MemBank::Default, 0x8000_0000, 0x8fff_ffff);
        memory
    }

    fn leaf_page(va: u64, pa: u64, bits: u32, level: u32) -> Rc<Page> {
        let size = 1u64 << bits;
        Rc::new(Page {
            va_lo: va,
            va_hi: va + size - 1,
            pa_lo: pa,
            pa_hi: pa + size - 1,
            bank: MemBank::Default,
            level,
            attributes: PageAttributes::VALID | PageAttributes::READ,
        })
    }

    #[test]
    fn walk_construction_allocates_tables_and_resolves() {
        let mut memory = test_memory();
        let mut rng = Rng::new(7);
        // Sv39 geometry: three levels of 9 bits above 4 KiB pages.
        let mut root = RootPageTable::new(3, 38, 9, 0x8100_0000, MemBank::Default);
        let page = leaf_page(0x4000_1000, 0x8200_0000, 12, 0);
        root.table_mut().construct_page_table_walk(page.clone(), &mut memory, &mut rng).unwrap();

        let found = root.table().lookup(0x4000_1234).unwrap();
        assert_eq!(found.translate_va_to_pa(0x4000_1234), 0x8200_0234);
        assert!(root.table().lookup(0x4000_3000).is_none());

        let mut pages = Vec::new();
        root.table().collect_pages(&mut pages);
        assert_eq!(pages.len(), 1);
    }

    #[test]
    fn superpage_leaf_sits_at_higher_level() {
        let mut memory = test_memory();
        let mut rng = Rng::new(9);
        let mut root = RootPageTable::new(3, 38, 9, 0x8100_0000, MemBank::Default);
        // A 2 MiB page occupies a level-1 leaf.
        let page = leaf_page(0x4020_0000, 0x8400_0000, 21, 1);
        root.table_mut().construct_page_table_walk(page, &mut memory, &mut rng).unwrap();
        let found = root.table().lookup(0x4020_1000).unwrap();
        assert_eq!(found.level, 1);
    }

    #[test]
    #[should_panic(expected = "pte-slot-already-in-use")]
    fn double_commit_is_fatal() {
        let mut memory = test_memory();
        let mut rng = Rng::new(1);
        let mut root = RootPageTable::new(3, 38, 9, 0x8100_0000, MemBank::Default);
        let page = leaf_page(0x4000_1000, 0x8200_0000, 12, 0);
        root.table_mut().construct_page_table_walk(page.clone(), &mut memory, &mut rng).unwrap();
        root.table_mut().construct_page_table_walk(page, &mut memory, &mut rng).unwrap();
    }
}
