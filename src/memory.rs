//! The physical memory model: per-bank sparse byte storage with per-byte
//! attributes, the free/usable/shared constraint views carved out of the
//! configured physical ranges, and the manager owning every bank. One
//! [`MemoryManager`] may be shared by several generator instances; it is the
//! only cross-instance state in the crate.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::cell::RefCell;

use bitflags::bitflags;
use log::{debug, trace};
use num_derive::FromPrimitive;

use crate::constraint::ConstraintSet;
use crate::error::Error;
use crate::rng::Rng;

bitflags! {
    /// Per-byte memory attributes.
    pub struct MemoryAttributes: u8 {
        /// The byte has been given a meaningful value.
        const INITIALISED = 1 << 0;
        /// The byte is shared across threads.
        const SHARED      = 1 << 1;
        /// The byte belongs to an instruction stream.
        const INSTRUCTION = 1 << 2;
        /// The byte is reserved and must not be allocated.
        const RESERVED    = 1 << 3;
        /// The byte belongs to a data block.
        const DATA        = 1 << 4;
    }
}

/// Memory bank identifiers. RISC-V platforms modelled here carry a single
/// default bank; the type exists so every physical address stays paired with
/// its bank through the simulator boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive)]
pub enum MemBank {
    /// The default memory bank.
    Default = 0,
}

impl MemBank {
    /// The raw bank number used across the simulator boundary.
    pub fn number(self) -> u32 {
        self as u32
    }
}

/// A physical address paired with its bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaTuple {
    pub bank: MemBank,
    pub address: u64,
}

/// Sparse byte storage with a coalescing per-byte attribute map.
#[derive(Default)]
pub struct Memory {
    data: BTreeMap<u64, u8>,
    attributes: rangemap::RangeMap<u64, MemoryAttributes>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes bytes and marks them initialised.
    pub fn write(&mut self, address: u64, bytes: &[u8]) {
        for (offset, byte) in bytes.iter().enumerate() {
            self.data.insert(address + offset as u64, *byte);
        }
        self.or_attributes(address, bytes.len() as u64, MemoryAttributes::INITIALISED);
    }

    /// Reads bytes that may be only partially initialised. Initialised bytes
    /// are copied into `buffer`; uninitialised bytes leave the caller's
    /// buffer untouched. Returns a mask with bit `i` set when byte `i` was
    /// initialised. Never an error.
    pub fn read_partially_initialized(&self, address: u64, buffer: &mut [u8]) -> u64 {
        assert!(buffer.len() <= 64, "partial-read-too-wide");
        let mut mask = 0u64;
        for (offset, slot) in buffer.iter_mut().enumerate() {
            if let Some(byte) = self.data.get(&(address + offset as u64)) {
                *slot = *byte;
                mask |= 1 << offset;
            }
        }
        mask
    }

    /// Whether every byte of the range is initialised.
    pub fn is_initialized(&self, address: u64, size: u64) -> bool {
        if size == 0 {
            return true;
        }
        let range = address..address + size;
        self.attributes
            .gaps(&range)
            .next()
            .is_none()
            && self
                .attributes
                .overlapping(&range)
                .all(|(_, attrs)| attrs.contains(MemoryAttributes::INITIALISED))
    }

    /// Attributes of one byte.
    pub fn attributes_at(&self, address: u64) -> MemoryAttributes {
        self.attributes.get(&address).copied().unwrap_or_else(MemoryAttributes::empty)
    }

    /// Collects per-byte attributes over a range.
    pub fn attributes_over(&self, address: u64, size: u64, out: &mut [MemoryAttributes]) {
        for (offset, slot) in out.iter_mut().enumerate().take(size as usize) {
            *slot = self.attributes_at(address + offset as u64);
        }
    }

    /// ORs attribute flags over a byte range; attribute setting is
    /// monotonic.
    pub fn or_attributes(&mut self, address: u64, size: u64, flags: MemoryAttributes) {
        if size == 0 {
            return;
        }
        let range = address..address + size;
        let mut pieces: Vec<(std::ops::Range<u64>, MemoryAttributes)> = Vec::new();
        for (covered, attrs) in self.attributes.overlapping(&range) {
            let start = covered.start.max(range.start);
            let end = covered.end.min(range.end);
            pieces.push((start..end, *attrs | flags));
        }
        for gap in self.attributes.gaps(&range) {
            pieces.push((gap, flags));
        }
        for (piece, attrs) in pieces {
            self.attributes.insert(piece, attrs);
        }
    }

    /// Iterates the initialised byte runs in ascending order.
    pub fn initialized_runs(&self) -> Vec<(u64, Vec<u8>)> {
        let mut runs: Vec<(u64, Vec<u8>)> = Vec::new();
        for (&address, &byte) in &self.data {
            match runs.last_mut() {
                Some((start, bytes)) if *start + bytes.len() as u64 == address => bytes.push(byte),
                _ => runs.push((address, vec![byte])),
            }
        }
        runs
    }
}

/// One memory bank: storage plus the constraint views allocation works on.
pub struct MemoryBank {
    bank: MemBank,
    memory: Memory,
    /// Every configured physical byte of the bank.
    base: ConstraintSet,
    /// Physically existent and not reserved.
    free: ConstraintSet,
    /// Free filtered by data/access policy; starts equal to free.
    usable: ConstraintSet,
    /// Cross-thread shared ranges; grows monotonically.
    shared: ConstraintSet,
    symbols: SymbolManager,
}

impl MemoryBank {
    pub fn new(bank: MemBank) -> Self {
        Self {
            bank,
            memory: Memory::new(),
            base: ConstraintSet::new(),
            free: ConstraintSet::new(),
            usable: ConstraintSet::new(),
            shared: ConstraintSet::new(),
            symbols: SymbolManager::new(),
        }
    }

    pub fn bank_type(&self) -> MemBank {
        self.bank
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Adds a usable physical memory range.
    pub fn add_memory_range(&mut self, start: u64, end: u64) {
        debug!("bank {:?} adding range 0x{:x}-0x{:x}", self.bank, start, end);
        self.base.add_range(start, end);
        self.free.add_range(start, end);
        self.usable.add_range(start, end);
    }

    /// Subtracts a physical memory range from the configured space.
    pub fn sub_memory_range(&mut self, start: u64, end: u64) {
        self.base.sub_range(start, end);
        self.free.sub_range(start, end);
        self.usable.sub_range(start, end);
    }

    /// Applies an initialisation record to the bank.
    pub fn initialize_memory(&mut self, record: &MemoryInitRecord) {
        if record.data.is_empty() {
            return;
        }
        trace!(
            "bank {:?} init 0x{:x} {} bytes attrs {:?}",
            self.bank,
            record.address,
            record.data.len(),
            record.attributes
        );
        self.memory.write(record.address, &record.data);
        self.memory.or_attributes(record.address, record.data.len() as u64, record.attributes);
        let end = record.address + record.data.len() as u64 - 1;
        self.free.sub_range(record.address, end);
        self.usable.sub_range(record.address, end);
    }

    /// Writes data without carving it out of the free space; used when the
    /// simulator reports stores to already-allocated locations.
    pub fn write_memory(&mut self, address: u64, bytes: &[u8]) {
        self.memory.write(address, bytes);
    }

    /// Reads data that may be only partially initialised.
    pub fn read_memory_partially_initialized(&self, address: u64, buffer: &mut [u8]) -> u64 {
        self.memory.read_partially_initialized(address, buffer)
    }

    /// Marks a range as shared; sharing is monotonic.
    pub fn mark_shared(&mut self, address: u64, size: u64) {
        self.shared.add_range(address, address + size - 1);
        self.memory.or_attributes(address, size, MemoryAttributes::SHARED);
    }

    /// Reserves memory ranges, pulling them out of the free space.
    pub fn reserve_memory(&mut self, ranges: &ConstraintSet) {
        self.free.sub_constraint_set(ranges);
        self.usable.sub_constraint_set(ranges);
        let mut reserved = ranges.clone();
        reserved.apply_constraint_set(&self.base);
        for c in reserved.constraints() {
            self.memory.or_attributes(
                c.lower_bound(),
                c.upper_bound() - c.lower_bound() + 1,
                MemoryAttributes::RESERVED,
            );
        }
    }

    /// Returns previously reserved ranges to the free space, clipped to the
    /// configured base ranges.
    pub fn unreserve_memory(&mut self, ranges: &ConstraintSet) {
        let mut back = ranges.clone();
        back.apply_constraint_set(&self.base);
        self.free.merge_constraint_set(&back);
        self.usable.merge_constraint_set(&back);
    }

    pub fn free(&self) -> &ConstraintSet {
        &self.free
    }

    pub fn usable(&self) -> &ConstraintSet {
        &self.usable
    }

    pub fn shared(&self) -> &ConstraintSet {
        &self.shared
    }

    pub fn symbol_manager(&mut self) -> &mut SymbolManager {
        &mut self.symbols
    }

    /// Allocates an aligned block from the free space, optionally inside
    /// `within`. Returns the block base and removes it from free space.
    pub fn allocate_free_block(
        &mut self,
        align_mask: u64,
        size: u64,
        within: Option<&ConstraintSet>,
        rng: &mut Rng,
    ) -> Result<u64, Error> {
        let mut candidates = match within {
            Some(window) => {
                let mut c = self.free.clone();
                c.apply_constraint_set(window);
                c
            }
            None => self.free.clone(),
        };
        candidates.align_with_size(align_mask, size);
        if candidates.is_empty() {
            return Err(Error::ConstraintExhausted(format!(
                "no free block of 0x{:x} bytes aligned 0x{:x} in bank {:?}",
                size, !align_mask, self.bank
            )));
        }
        let value = candidates.choose_value(rng)?;
        // Clamp the aligned base so the whole block stays inside the element
        // the draw landed in; the aligned span guarantees the clamp target is
        // itself aligned.
        let element = candidates.element_containing(value).expect("chosen value left the set");
        let last_base = element.upper_bound() - (size - 1);
        let base = (value & align_mask).min(last_base);
        self.free.sub_range(base, base + size - 1);
        self.usable.sub_range(base, base + size - 1);
        debug!(
            "bank {:?} allocated block 0x{:x}+0x{:x} align 0x{:x}",
            self.bank, base, size, !align_mask
        );
        Ok(base)
    }
}

/// A named physical region registered for mapping by the virtual memory
/// system (handler tables, page table pools, boot regions).
#[derive(Clone, Debug)]
pub struct PhysicalRegion {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub bank: MemBank,
}

/// A batch byte initialisation flowing from the agents into a bank.
#[derive(Clone, Debug)]
pub struct MemoryInitRecord {
    pub bank: MemBank,
    pub address: u64,
    pub data: Vec<u8>,
    pub attributes: MemoryAttributes,
}

impl MemoryInitRecord {
    pub fn new(bank: MemBank, address: u64, data: Vec<u8>, attributes: MemoryAttributes) -> Self {
        Self { bank, address, data, attributes: attributes | MemoryAttributes::INITIALISED }
    }
}

/// Per-bank symbol table for the output image.
#[derive(Default)]
pub struct SymbolManager {
    symbols: BTreeMap<String, u64>,
}

impl SymbolManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_symbol(&mut self, name: &str, address: u64) {
        self.symbols.insert(name.to_string(), address);
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&str, u64)> {
        self.symbols.iter().map(|(name, address)| (name.as_str(), *address))
    }
}

/// Manager of all memory banks; shared by every generator of a test.
pub struct MemoryManager {
    banks: Vec<MemoryBank>,
    physical_regions: Vec<PhysicalRegion>,
}

/// The shared handle generators hold on the memory manager.
pub type SharedMemoryManager = Rc<RefCell<MemoryManager>>;

impl MemoryManager {
    /// Creates the manager with one bank per [`MemBank`] variant.
    pub fn new() -> Self {
        Self { banks: vec![MemoryBank::new(MemBank::Default)], physical_regions: Vec::new() }
    }

    /// Creates the manager behind the shared handle generators take.
    pub fn new_shared() -> SharedMemoryManager {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn number_banks(&self) -> usize {
        self.banks.len()
    }

    pub fn bank(&self, bank: MemBank) -> &MemoryBank {
        &self.banks[bank as usize]
    }

    pub fn bank_mut(&mut self, bank: MemBank) -> &mut MemoryBank {
        &mut self.banks[bank as usize]
    }

    /// Adds a usable physical range to a bank.
    pub fn add_memory_range(&mut self, bank: MemBank, start: u64, end: u64) {
        self.bank_mut(bank).add_memory_range(start, end);
    }

    /// Applies an initialisation record.
    pub fn initialize_memory(&mut self, record: &MemoryInitRecord) {
        self.bank_mut(record.bank).initialize_memory(record);
    }

    /// Reads bytes that may be only partially initialised.
    pub fn read_memory_partially_initialized(&self, pa: PaTuple, buffer: &mut [u8]) -> u64 {
        self.bank(pa.bank).read_memory_partially_initialized(pa.address, buffer)
    }

    /// Marks a range shared.
    pub fn mark_shared(&mut self, pa: PaTuple, size: u64) {
        self.bank_mut(pa.bank).mark_shared(pa.address, size);
    }

    /// Whether the whole range is initialised.
    pub fn pa_initialized(&self, pa: PaTuple, size: u64) -> bool {
        self.bank(pa.bank).memory().is_initialized(pa.address, size)
    }

    /// Registers a physical region for the virtual memory system to map.
    pub fn add_physical_region(&mut self, region: PhysicalRegion) {
        self.physical_regions.push(region);
    }

    pub fn physical_regions(&self) -> &[PhysicalRegion] {
        &self.physical_regions
    }

    /// Renders the initialised image as text, one line per byte run.
    pub fn output_image(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        for bank in &self.banks {
            for (address, bytes) in bank.memory().initialized_runs() {
                let _ = write!(out, "[{:?}] 0x{:016x}:", bank.bank_type(), address);
                for byte in &bytes {
                    let _ = write!(out, " {:02x}", byte);
                }
                out.push('\n');
            }
        }
        out
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_reads_leave_uninitialised_bytes() {
        let mut memory = Memory::new();
        memory.write(0x100, &[0xaa, 0xbb]);
        let mut buffer = [0x11u8; 4];
        let mask = memory.read_partially_initialized(0xff, &mut buffer);
        // Bytes at 0x100 and 0x101 are initialised, offset 1 and 2 in the buffer.
        assert_eq!(mask, 0b0110);
        assert_eq!(buffer, [0x11, 0xaa, 0xbb, 0x11]);
    }

    #[test]
    fn attributes_accumulate_monotonically() {
        let mut memory = Memory::new();
        memory.or_attributes(0x0, 0x100, MemoryAttributes::INSTRUCTION);
        memory.or_attributes(0x80, 0x100, MemoryAttributes::SHARED);
        assert_eq!(memory.attributes_at(0x0), MemoryAttributes::INSTRUCTION);
        assert_eq!(
            memory.attributes_at(0x90),
            MemoryAttributes::INSTRUCTION | MemoryAttributes::SHARED
        );
        assert_eq!(memory.attributes_at(0x120), MemoryAttributes::SHARED);
    }

    #[test]
    fn init_record_removes_from_free() {
        let mut bank = MemoryBank::new(MemBank::Default);
        bank.add_memory_range(0x0, 0xffff);
        let record = MemoryInitRecord::new(
            MemBank::Default,
            0x1000,
            vec![0u8; 0x10],
            MemoryAttributes::DATA,
        );
        bank.initialize_memory(&record);
        assert!(!bank.free().contains_value(0x1000));
        assert!(!bank.free().contains_value(0x100f));
        assert!(bank.free().contains_value(0x1010));
        assert!(bank.memory().is_initialized(0x1000, 0x10));
    }

    #[test]
    fn reserve_and_unreserve_round_trip() {
        let mut bank = MemoryBank::new(MemBank::Default);
        bank.add_memory_range(0x0, 0xffff);
        let reserved = ConstraintSet::from_range(0x4000, 0x4fff);
        bank.reserve_memory(&reserved);
        assert!(!bank.free().contains_value(0x4800));
        bank.unreserve_memory(&reserved);
        assert!(bank.free().contains_range(0x0, 0xffff));
    }

    #[test]
    fn allocation_respects_alignment_and_free_space() {
        let mut bank = MemoryBank::new(MemBank::Default);
        bank.add_memory_range(0x0, 0xf_ffff);
        let mut rng = Rng::new(3);
        let base = bank.allocate_free_block(!0xfff, 0x1000, None, &mut rng).unwrap();
        assert_eq!(base & 0xfff, 0);
        assert!(!bank.free().contains_value(base));
        assert!(!bank.free().contains_value(base + 0xfff));
    }

    #[test]
    fn shared_marking_is_monotonic() {
        let mut bank = MemoryBank::new(MemBank::Default);
        bank.add_memory_range(0x0, 0xffff);
        bank.mark_shared(0x100, 0x10);
        bank.mark_shared(0x108, 0x10);
        assert!(bank.shared().contains_range(0x100, 0x117));
    }
}
