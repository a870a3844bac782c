//! Ordered disjoint interval sets. A [`ConstraintSet`] represents an
//! arbitrary set of `u64` values as a sorted vector of disjoint,
//! non-adjacent constraints, and is the currency of the whole generator:
//! legal addresses, reserved register indices, operand values and page
//! spans are all constraint sets.
//!
//! Structural mutation goes through the block assembler in [`assembler`];
//! single-pass reductions go through [`trimmer`]. Address constraints
//! routinely carry ranges like `[0, 2^48)`, so every operation here is
//! linear in the size of the result, never quadratic.

mod assembler;
pub mod serialize;
mod trimmer;

use crate::error::Error;
use crate::rng::Rng;
use assembler::{assemble, ConstraintBlock};

/// A single constraint: one value or one inclusive range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Constraint {
    /// A single value.
    Value(u64),
    /// An inclusive range `lower..=upper` with `lower < upper`.
    Range {
        /// Lower bound, inclusive.
        lower: u64,
        /// Upper bound, inclusive.
        upper: u64,
    },
}

impl Constraint {
    /// Builds the canonical constraint for inclusive bounds: a `Value` when
    /// the bounds coincide, a `Range` otherwise.
    pub fn from_bounds(lower: u64, upper: u64) -> Self {
        assert!(lower <= upper, "constraint-bounds-reversed: 0x{:x} > 0x{:x}", lower, upper);
        if lower == upper {
            Constraint::Value(lower)
        } else {
            Constraint::Range { lower, upper }
        }
    }

    /// Lower bound, inclusive.
    pub fn lower_bound(&self) -> u64 {
        match *self {
            Constraint::Value(value) => value,
            Constraint::Range { lower, .. } => lower,
        }
    }

    /// Upper bound, inclusive.
    pub fn upper_bound(&self) -> u64 {
        match *self {
            Constraint::Value(value) => value,
            Constraint::Range { upper, .. } => upper,
        }
    }

    /// Number of values the constraint represents. Exact; a full-space range
    /// needs the wider type.
    pub fn value_count(&self) -> u128 {
        self.upper_bound() as u128 - self.lower_bound() as u128 + 1
    }

    /// Whether the constraint contains the value.
    pub fn contains(&self, value: u64) -> bool {
        value >= self.lower_bound() && value <= self.upper_bound()
    }

    /// Whether the two constraints share at least one value.
    pub fn intersects(&self, other: &Constraint) -> bool {
        self.lower_bound() <= other.upper_bound() && other.lower_bound() <= self.upper_bound()
    }
}

/// Aggregate size delta of one structural operation.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SizeChange {
    pub(crate) removed: u128,
    pub(crate) added: u128,
}

/// Cached sizes report exact counts up to this bound and saturate beyond it.
pub const SIZE_SATURATION: u64 = 1 << 62;

/// An ordered set of disjoint, non-adjacent constraints.
///
/// Invariants, restored by every operation:
///  1. no two elements intersect,
///  2. no two elements are adjacent (`a.upper + 1 == b.lower` never holds),
///  3. elements are sorted by lower bound.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConstraintSet {
    constraints: Vec<Constraint>,
    value_count: u128,
}

impl ConstraintSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding one inclusive range.
    pub fn from_range(lower: u64, upper: u64) -> Self {
        let constraint = Constraint::from_bounds(lower, upper);
        Self { constraints: vec![constraint], value_count: constraint.value_count() }
    }

    /// A set holding one value.
    pub fn from_value(value: u64) -> Self {
        Self::from_range(value, value)
    }

    /// Whether the set holds no values.
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Number of values in the set, exact up to [`SIZE_SATURATION`] and
    /// pegged there beyond.
    pub fn size(&self) -> u64 {
        if self.value_count >= SIZE_SATURATION as u128 {
            SIZE_SATURATION
        } else {
            self.value_count as u64
        }
    }

    /// Whether [`ConstraintSet::size`] is pegged at the saturation bound.
    pub fn is_size_saturated(&self) -> bool {
        self.value_count >= SIZE_SATURATION as u128
    }

    /// Exact number of values in the set.
    pub fn value_count(&self) -> u128 {
        self.value_count
    }

    /// Number of constraint elements.
    pub fn vector_size(&self) -> usize {
        self.constraints.len()
    }

    /// The constraint elements in order.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Smallest value in the set. Panics on an empty set.
    pub fn lower_bound(&self) -> u64 {
        self.constraints.first().expect("lower-bound-of-empty-constraint-set").lower_bound()
    }

    /// Largest value in the set. Panics on an empty set.
    pub fn upper_bound(&self) -> u64 {
        self.constraints.last().expect("upper-bound-of-empty-constraint-set").upper_bound()
    }

    /// Clears the set.
    pub fn clear(&mut self) {
        self.constraints.clear();
        self.value_count = 0;
    }

    // --- containment -----------------------------------------------------

    /// Whether the set contains the value. `O(log n)`.
    pub fn contains_value(&self, value: u64) -> bool {
        let index = self.first_index_reaching(value);
        self.constraints.get(index).map_or(false, |c| c.contains(value))
    }

    /// Whether the set contains every value of the inclusive range.
    pub fn contains_range(&self, lower: u64, upper: u64) -> bool {
        let index = self.first_index_reaching(lower);
        self.constraints
            .get(index)
            .map_or(false, |c| c.lower_bound() <= lower && upper <= c.upper_bound())
    }

    /// Whether the set contains the whole constraint.
    pub fn contains_constraint(&self, constraint: &Constraint) -> bool {
        self.contains_range(constraint.lower_bound(), constraint.upper_bound())
    }

    /// Whether the set contains every value of the other set.
    pub fn contains_constraint_set(&self, other: &ConstraintSet) -> bool {
        other.constraints.iter().all(|c| self.contains_constraint(c))
    }

    /// Whether the two sets share at least one value.
    pub fn intersects(&self, other: &ConstraintSet) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.constraints.len() && j < other.constraints.len() {
            let a = &self.constraints[i];
            let b = &other.constraints[j];
            if a.intersects(b) {
                return true;
            }
            if a.upper_bound() < b.upper_bound() {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }

    /// Index of the first element whose upper bound reaches `value`.
    fn first_index_reaching(&self, value: u64) -> usize {
        self.constraints.partition_point(|c| c.upper_bound() < value)
    }

    // --- merge -----------------------------------------------------------

    /// Adds one value to the set.
    pub fn add_value(&mut self, value: u64) {
        self.merge_constraint(Constraint::Value(value));
    }

    /// Adds one inclusive range to the set.
    pub fn add_range(&mut self, lower: u64, upper: u64) {
        self.merge_constraint(Constraint::from_bounds(lower, upper));
    }

    /// Merges one constraint into the set, combining with any elements it
    /// overlaps or touches.
    pub fn merge_constraint(&mut self, merge: Constraint) {
        // Fast path: append or extend at the tail, the common pattern when a
        // set is built in ascending order.
        if let Some(last) = self.constraints.last_mut() {
            if merge.lower_bound() > last.upper_bound().saturating_add(1) {
                self.value_count += merge.value_count();
                self.constraints.push(merge);
                return;
            }
            if merge.lower_bound() >= last.lower_bound() {
                let touch = last.upper_bound().checked_add(1);
                if merge.lower_bound() <= touch.unwrap_or(u64::MAX) {
                    if merge.upper_bound() > last.upper_bound() {
                        let grown = Constraint::from_bounds(last.lower_bound(), merge.upper_bound());
                        self.value_count += grown.value_count() - last.value_count();
                        *last = grown;
                    }
                    return;
                }
            }
        } else {
            self.value_count = merge.value_count();
            self.constraints.push(merge);
            return;
        }
        let single = ConstraintSet {
            constraints: vec![merge],
            value_count: merge.value_count(),
        };
        self.merge_constraint_set(&single);
    }

    /// Merges every value of `other` into the set (set union).
    pub fn merge_constraint_set(&mut self, other: &ConstraintSet) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.constraints = other.constraints.clone();
            self.value_count = other.value_count;
            return;
        }

        let mut blocks: Vec<ConstraintBlock> = Vec::new();
        let mut change = SizeChange::default();
        let mut new_size = 0usize;
        let mut move_start = 0usize;
        let mut search_from = 0usize;

        for &merge in &other.constraints {
            // The window includes neighbours exactly one off, so adjacency
            // collapses as required by the non-adjacency invariant.
            let window_lower = merge.lower_bound().saturating_sub(1);
            let window_upper = merge.upper_bound().saturating_add(1);
            let lower_index = search_from
                + self.constraints[search_from..]
                    .partition_point(|c| c.upper_bound() < window_lower);
            let upper_index = search_from
                + self.constraints[search_from..]
                    .partition_point(|c| c.lower_bound() <= window_upper);

            if lower_index == upper_index {
                // No overlap or adjacency; the constraint lands between two
                // existing runs.
                commit_move(&mut blocks, &mut new_size, move_start, lower_index);
                change.added += merge.value_count();
                blocks.push(ConstraintBlock::Clone { items: vec![merge] });
                new_size += 1;
                move_start = lower_index;
                search_from = lower_index;
            } else {
                // Combine the whole group into one span, written over the
                // last covered slot so later merges can keep chaining on it.
                let combined = Constraint::from_bounds(
                    self.constraints[lower_index].lower_bound().min(merge.lower_bound()),
                    self.constraints[upper_index - 1].upper_bound().max(merge.upper_bound()),
                );
                for covered in &self.constraints[lower_index..upper_index] {
                    change.removed += covered.value_count();
                }
                change.added += combined.value_count();
                commit_move(&mut blocks, &mut new_size, move_start, lower_index);
                self.constraints[upper_index - 1] = combined;
                move_start = upper_index - 1;
                search_from = upper_index - 1;
            }
        }
        commit_move(&mut blocks, &mut new_size, move_start, self.constraints.len());

        assemble(&mut self.constraints, blocks, new_size);
        self.value_count = self.value_count + change.added - change.removed;
        debug_assert!(self.check_invariants());
    }

    // --- subtract --------------------------------------------------------

    /// Removes one value from the set.
    pub fn sub_value(&mut self, value: u64) {
        self.sub_constraint(Constraint::Value(value));
    }

    /// Removes one inclusive range from the set.
    pub fn sub_range(&mut self, lower: u64, upper: u64) {
        self.sub_constraint(Constraint::from_bounds(lower, upper));
    }

    /// Removes every value of the constraint from the set.
    pub fn sub_constraint(&mut self, sub: Constraint) {
        let single = ConstraintSet {
            constraints: vec![sub],
            value_count: sub.value_count(),
        };
        self.sub_constraint_set(&single);
    }

    /// Removes every value of `other` from the set (set difference).
    pub fn sub_constraint_set(&mut self, other: &ConstraintSet) {
        if self.is_empty() || other.is_empty() {
            return;
        }

        let mut blocks: Vec<ConstraintBlock> = Vec::new();
        let mut change = SizeChange::default();
        let mut new_size = 0usize;
        let mut move_start = 0usize;
        let mut search_from = 0usize;
        let mut touched = false;

        for &sub in &other.constraints {
            let lower_index = search_from
                + self.constraints[search_from..]
                    .partition_point(|c| c.upper_bound() < sub.lower_bound());
            let upper_index = search_from
                + self.constraints[search_from..]
                    .partition_point(|c| c.lower_bound() <= sub.upper_bound());
            if lower_index == upper_index {
                search_from = lower_index;
                continue;
            }
            touched = true;

            for covered in &self.constraints[lower_index..upper_index] {
                change.removed += covered.value_count();
            }
            commit_move(&mut blocks, &mut new_size, move_start, lower_index);

            // Head remainder cannot intersect any later subtrahend, so it is
            // safe to emit now.
            let first = self.constraints[lower_index];
            if first.lower_bound() < sub.lower_bound() {
                let head = Constraint::from_bounds(first.lower_bound(), sub.lower_bound() - 1);
                change.added += head.value_count();
                blocks.push(ConstraintBlock::Insert { items: vec![head] });
                new_size += 1;
            }

            // The tail remainder may still be split by the next subtrahend;
            // rewrite it in its slot and leave it inside the following run.
            let last = self.constraints[upper_index - 1];
            if last.upper_bound() > sub.upper_bound() {
                let tail = Constraint::from_bounds(sub.upper_bound() + 1, last.upper_bound());
                change.added += tail.value_count();
                self.constraints[upper_index - 1] = tail;
                move_start = upper_index - 1;
                search_from = upper_index - 1;
            } else {
                move_start = upper_index;
                search_from = upper_index;
            }
        }
        if !touched {
            return;
        }
        commit_move(&mut blocks, &mut new_size, move_start, self.constraints.len());

        assemble(&mut self.constraints, blocks, new_size);
        self.value_count = self.value_count + change.added - change.removed;
        debug_assert!(self.check_invariants());
    }

    // --- intersect -------------------------------------------------------

    /// Keeps only values also present in the constraint.
    pub fn apply_constraint(&mut self, keep: Constraint) {
        let single = ConstraintSet {
            constraints: vec![keep],
            value_count: keep.value_count(),
        };
        self.apply_constraint_set(&single);
    }

    /// Keeps only values also present in `other` (set intersection).
    pub fn apply_constraint_set(&mut self, other: &ConstraintSet) {
        if self.is_empty() {
            return;
        }
        if other.is_empty() {
            self.clear();
            return;
        }

        let mut blocks: Vec<ConstraintBlock> = Vec::new();
        let mut change = SizeChange::default();
        let mut new_size = 0usize;
        let mut move_start = 0usize;
        let mut other_index = 0usize;

        for index in 0..self.constraints.len() {
            let element = self.constraints[index];
            while other_index < other.constraints.len()
                && other.constraints[other_index].upper_bound() < element.lower_bound()
            {
                other_index += 1;
            }
            let mut pieces: Vec<Constraint> = Vec::new();
            let mut scan = other_index;
            while scan < other.constraints.len()
                && other.constraints[scan].lower_bound() <= element.upper_bound()
            {
                let piece = Constraint::from_bounds(
                    element.lower_bound().max(other.constraints[scan].lower_bound()),
                    element.upper_bound().min(other.constraints[scan].upper_bound()),
                );
                pieces.push(piece);
                scan += 1;
            }

            if pieces.len() == 1 && pieces[0] == element {
                continue; // survives whole, stays in the current run
            }
            commit_move(&mut blocks, &mut new_size, move_start, index);
            change.removed += element.value_count();
            for piece in &pieces {
                change.added += piece.value_count();
            }
            if !pieces.is_empty() {
                new_size += pieces.len();
                blocks.push(ConstraintBlock::Insert { items: pieces });
            }
            move_start = index + 1;
        }
        if move_start == 0 {
            return; // everything survived
        }
        commit_move(&mut blocks, &mut new_size, move_start, self.constraints.len());

        assemble(&mut self.constraints, blocks, new_size);
        self.value_count = self.value_count + change.added - change.removed;
        debug_assert!(self.check_invariants());
    }

    // --- alignment and masking filters -----------------------------------

    /// Keeps, per element, the span of `align`-aligned blocks of `size`
    /// bytes. `align_mask` clears the offset bits (e.g. `!0xFFF` for 4 KiB
    /// alignment). Idempotent for fixed arguments.
    pub fn align_with_size(&mut self, align_mask: u64, size: u64) {
        let change =
            trimmer::trim(&mut self.constraints, |c| trimmer::align_with_size(c, align_mask, size));
        self.apply_size_change(change);
    }

    /// Like [`ConstraintSet::align_with_size`] for addresses congruent to
    /// `offset` within the alignment granule.
    pub fn align_offset_with_size(&mut self, align_mask: u64, offset: u64, size: u64) {
        let change = trimmer::trim(&mut self.constraints, |c| {
            trimmer::align_offset_with_size(c, align_mask, offset, size)
        });
        self.apply_size_change(change);
    }

    /// Keeps addresses congruent to `base_remainder` modulo `mul_data` with
    /// room for `size` bytes; for alignments that are not powers of two.
    pub fn align_mul_data_with_size(&mut self, mul_data: u64, base_remainder: u64, size: u64) {
        let change = trimmer::trim(&mut self.constraints, |c| {
            trimmer::align_mul_data_with_size(c, mul_data, base_remainder, size)
        });
        self.apply_size_change(change);
    }

    /// Keeps values `x` with `x & mask == index`, then strips the masked
    /// bits out of the surviving values.
    pub fn apply_index_mask(&mut self, index: u64, mask: u64) {
        let change = trimmer::trim(&mut self.constraints, |c| {
            trimmer::apply_index_mask(c, index, mask)
        });
        self.apply_size_change(change);
    }

    /// Shifts every value right by `shift` bits, merging elements that
    /// collide (VA spans to page frame numbers).
    pub fn shift_right(&mut self, shift: u32) {
        if shift == 0 || self.is_empty() {
            return;
        }
        let mut result: Vec<Constraint> = Vec::with_capacity(self.constraints.len());
        let mut count = 0u128;
        for c in &self.constraints {
            let shifted =
                Constraint::from_bounds(c.lower_bound() >> shift, c.upper_bound() >> shift);
            match result.last_mut() {
                Some(last) if shifted.lower_bound() <= last.upper_bound().saturating_add(1) => {
                    if shifted.upper_bound() > last.upper_bound() {
                        count += shifted.upper_bound() as u128 - last.upper_bound() as u128;
                        *last = Constraint::from_bounds(last.lower_bound(), shifted.upper_bound());
                    }
                }
                _ => {
                    count += shifted.value_count();
                    result.push(shifted);
                }
            }
        }
        self.constraints = result;
        self.value_count = count;
        debug_assert!(self.check_invariants());
    }

    fn apply_size_change(&mut self, change: SizeChange) {
        self.value_count = self.value_count + change.added - change.removed;
        debug_assert!(self.check_invariants());
    }

    // --- choosers --------------------------------------------------------

    /// Picks a value uniformly at random over every value the set
    /// represents. Uniformity is over actual values even when the cached
    /// size has saturated. Fails deterministically on an empty set.
    pub fn choose_value(&self, rng: &mut Rng) -> Result<u64, Error> {
        if self.is_empty() {
            return Err(Error::EmptyConstraint);
        }
        let mut draw = rng.below_u128(self.value_count);
        for c in &self.constraints {
            let count = c.value_count();
            if draw < count {
                return Ok(c.lower_bound() + draw as u64);
            }
            draw -= count;
        }
        unreachable!("choose-value-walk-exhausted");
    }

    /// The smallest value in the set, an error when empty.
    pub fn chosen_value_from_front(&self) -> Result<u64, Error> {
        if self.is_empty() {
            return Err(Error::EmptyConstraint);
        }
        Ok(self.lower_bound())
    }

    /// The largest value in the set, an error when empty.
    pub fn chosen_value_from_back(&self) -> Result<u64, Error> {
        if self.is_empty() {
            return Err(Error::EmptyConstraint);
        }
        Ok(self.upper_bound())
    }

    /// The element containing the value, when one does.
    pub fn element_containing(&self, value: u64) -> Option<Constraint> {
        let index = self.first_index_reaching(value);
        self.constraints.get(index).copied().filter(|c| c.contains(value))
    }

    /// Finds the first element intersecting `[lower, upper]` and returns the
    /// start of the intersection and its contiguous length.
    pub fn leading_intersecting_range(&self, lower: u64, upper: u64) -> Option<(u64, u64)> {
        let index = self.first_index_reaching(lower);
        let element = self.constraints.get(index)?;
        if element.lower_bound() > upper {
            return None;
        }
        let start = element.lower_bound().max(lower);
        let end = element.upper_bound().min(upper);
        Some((start, end - start + 1))
    }

    /// Returns the intersection of the set with the inclusive range as a new
    /// set, leaving the set untouched.
    pub fn clone_in_range(&self, lower: u64, upper: u64) -> ConstraintSet {
        let mut result = ConstraintSet::new();
        let start = self.first_index_reaching(lower);
        for c in &self.constraints[start..] {
            if c.lower_bound() > upper {
                break;
            }
            let piece =
                Constraint::from_bounds(c.lower_bound().max(lower), c.upper_bound().min(upper));
            result.value_count += piece.value_count();
            result.constraints.push(piece);
        }
        result
    }

    // --- diagnostics -----------------------------------------------------

    /// The simple text form: comma separated `0xv` / `0xlo-0xhi`.
    pub fn to_simple_string(&self) -> String {
        serialize::to_simple_string(self)
    }

    /// Verifies the ordering invariants and the cached size; used by debug
    /// assertions and tests.
    pub fn check_invariants(&self) -> bool {
        let mut previous: Option<&Constraint> = None;
        let mut count = 0u128;
        for c in &self.constraints {
            if c.lower_bound() > c.upper_bound() {
                return false;
            }
            if let Constraint::Range { lower, upper } = c {
                if lower == upper {
                    return false; // should have normalized to Value
                }
            }
            if let Some(p) = previous {
                // Sorted, disjoint, and not even adjacent.
                match p.upper_bound().checked_add(1) {
                    Some(limit) if limit < c.lower_bound() => {}
                    _ => return false,
                }
            }
            count += c.value_count();
            previous = Some(c);
        }
        count == self.value_count
    }
}

impl std::str::FromStr for ConstraintSet {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        serialize::parse(text)
    }
}

fn commit_move(
    blocks: &mut Vec<ConstraintBlock>,
    new_size: &mut usize,
    start: usize,
    end: usize,
) {
    if end > start {
        *new_size += end - start;
        blocks.push(ConstraintBlock::Move { start, end });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[(u64, u64)]) -> ConstraintSet {
        let mut s = ConstraintSet::new();
        for &(lo, hi) in ranges {
            s.add_range(lo, hi);
        }
        s
    }

    #[test]
    fn build_keeps_invariants() {
        let s = set(&[(0, 9), (20, 29), (15, 15)]);
        assert!(s.check_invariants());
        assert_eq!(s.size(), 21);
        assert_eq!(s.vector_size(), 3);
    }

    #[test]
    fn adjacent_ranges_coalesce() {
        let mut s = set(&[(0, 9)]);
        s.add_range(10, 15);
        assert_eq!(s.vector_size(), 1);
        assert_eq!(s.size(), 16);
        s.add_value(17);
        assert_eq!(s.vector_size(), 2);
        s.add_value(16);
        assert_eq!(s.vector_size(), 1);
        assert_eq!(s.size(), 18);
        assert!(s.check_invariants());
    }

    #[test]
    fn subtract_straddling_range() {
        // {[0,9],[20,29]} - [5,24] must leave {[0,4],[25,29]}.
        let mut s = set(&[(0, 9), (20, 29)]);
        s.sub_range(5, 24);
        assert_eq!(s.to_simple_string(), "0x0-0x4,0x19-0x1d");
        assert_eq!(s.size(), 10);
        assert!(s.check_invariants());
    }

    #[test]
    fn subtract_interior_splits() {
        let mut s = set(&[(0, 100)]);
        s.sub_range(10, 20);
        s.sub_range(30, 40);
        assert_eq!(s.vector_size(), 3);
        assert_eq!(s.size(), 101 - 11 - 11);
        assert!(!s.contains_value(15));
        assert!(!s.contains_value(35));
        assert!(s.contains_value(25));
        assert!(s.check_invariants());
    }

    #[test]
    fn subtract_multiple_from_one_pass() {
        let mut s = set(&[(0, 100)]);
        let cut = set(&[(10, 20), (30, 40), (99, 110)]);
        s.sub_constraint_set(&cut);
        assert_eq!(s.to_simple_string(), "0x0-0x9,0x15-0x1d,0x29-0x62");
        assert!(s.check_invariants());
    }

    #[test]
    fn merge_chains_through_existing_elements() {
        // The merged element must stay visible to later merges.
        let mut s = set(&[(7, 14)]);
        let other = set(&[(0, 8), (12, 15)]);
        s.merge_constraint_set(&other);
        assert_eq!(s.to_simple_string(), "0x0-0xf");
        assert_eq!(s.size(), 16);
        assert!(s.check_invariants());
    }

    #[test]
    fn merge_fills_gaps_with_clones() {
        let mut s = set(&[(0, 4), (100, 104)]);
        let other = set(&[(10, 14), (20, 24), (30, 34)]);
        s.merge_constraint_set(&other);
        assert_eq!(s.vector_size(), 5);
        assert_eq!(s.size(), 25);
        assert!(s.check_invariants());
    }

    #[test]
    fn merge_then_sub_properties() {
        // S.merge(T).sub(T) >= S.sub(T) and S.sub(T) disjoint from T.
        let s0 = set(&[(0, 50), (80, 120)]);
        let t = set(&[(40, 90), (200, 210)]);
        let mut merged = s0.clone();
        merged.merge_constraint_set(&t);
        merged.sub_constraint_set(&t);
        let mut subbed = s0.clone();
        subbed.sub_constraint_set(&t);
        assert!(merged.contains_constraint_set(&subbed));
        let mut inter = subbed.clone();
        inter.apply_constraint_set(&t);
        assert!(inter.is_empty());
    }

    #[test]
    fn intersection_splits_elements() {
        let mut s = set(&[(0, 100)]);
        let keep = set(&[(10, 20), (50, 60), (200, 300)]);
        s.apply_constraint_set(&keep);
        assert_eq!(s.to_simple_string(), "0xa-0x14,0x32-0x3c");
        assert!(s.check_invariants());
    }

    #[test]
    fn intersection_with_disjoint_clears() {
        let mut s = set(&[(0, 10)]);
        s.apply_constraint_set(&set(&[(20, 30)]));
        assert!(s.is_empty());
        assert_eq!(s.size(), 0);
    }

    #[test]
    fn containment_queries() {
        let s = set(&[(0, 9), (20, 29)]);
        assert!(s.contains_value(0));
        assert!(s.contains_value(29));
        assert!(!s.contains_value(10));
        assert!(s.contains_range(22, 25));
        assert!(!s.contains_range(8, 21));
        assert!(s.contains_constraint_set(&set(&[(1, 2), (25, 29)])));
        assert!(!s.contains_constraint_set(&set(&[(1, 2), (30, 31)])));
    }

    #[test]
    fn align_with_size_keeps_whole_blocks() {
        let mut s = set(&[(0x1001, 0x3fff)]);
        s.align_with_size(!0xfff, 0x1000);
        assert_eq!(s.to_simple_string(), "0x2000-0x3fff");
        assert!(s.check_invariants());
    }

    #[test]
    fn align_with_size_idempotent() {
        let mut s = set(&[(3, 1000), (2000, 2100), (4000, 4002)]);
        s.align_with_size(!0xf, 0x10);
        let once = s.clone();
        s.align_with_size(!0xf, 0x10);
        assert_eq!(s, once);
    }

    #[test]
    fn align_offset_with_size_selects_offset() {
        let mut s = set(&[(0, 0x100)]);
        s.align_offset_with_size(!0xf, 0x4, 4);
        // First qualifying start is 0x4, last is 0xf4.
        assert_eq!(s.lower_bound(), 0x4);
        assert_eq!(s.upper_bound(), 0xf7);
        let once = s.clone();
        s.align_offset_with_size(!0xf, 0x4, 4);
        assert_eq!(s, once);
    }

    #[test]
    fn align_mul_data_with_size_handles_non_power_of_two() {
        let mut s = set(&[(10, 100)]);
        s.align_mul_data_with_size(12, 5, 3);
        // First start >= 10 congruent to 5 mod 12 is 17; last start <= 98 is 89.
        assert_eq!(s.lower_bound(), 17);
        assert_eq!(s.upper_bound(), 91);
        let once = s.clone();
        s.align_mul_data_with_size(12, 5, 3);
        assert_eq!(s, once);
    }

    #[test]
    fn index_mask_strips_bits() {
        // [0,0xFFFF] filtered to x & 0xF == 0x3, masked bits stripped.
        let mut s = set(&[(0, 0xffff)]);
        s.apply_index_mask(0x3, 0xf);
        assert_eq!(s.size(), 0x1000);
        assert_eq!(s.to_simple_string(), "0x0-0xfff");
        assert!(s.check_invariants());
    }

    #[test]
    fn index_mask_merges_stripped_neighbours() {
        let mut s = set(&[(0x3, 0x3), (0x13, 0x13), (0x33, 0x33)]);
        s.apply_index_mask(0x3, 0xf);
        assert_eq!(s.to_simple_string(), "0x0-0x1,0x3");
        assert!(s.check_invariants());
    }

    #[test]
    fn choose_value_uniform_membership() {
        let s = set(&[(0, 9), (20, 29)]);
        let mut rng = Rng::new(42);
        for _ in 0..100 {
            let v = s.choose_value(&mut rng).unwrap();
            assert!(s.contains_value(v));
        }
        assert!(matches!(
            ConstraintSet::new().choose_value(&mut rng),
            Err(Error::EmptyConstraint)
        ));
    }

    #[test]
    fn choose_value_on_saturated_set() {
        // Straddles the saturation boundary: cached size pegs, chooser stays
        // uniform over actual elements.
        let s = set(&[(0, u64::MAX - 1), (u64::MAX, u64::MAX)]);
        assert!(s.is_size_saturated());
        assert_eq!(s.size(), SIZE_SATURATION);
        let mut rng = Rng::new(1);
        for _ in 0..64 {
            let v = s.choose_value(&mut rng).unwrap();
            assert!(s.contains_value(v));
        }
    }

    #[test]
    fn leading_intersecting_range_reports_first_overlap() {
        let s = set(&[(0, 9), (20, 29)]);
        assert_eq!(s.leading_intersecting_range(5, u64::MAX), Some((5, 5)));
        assert_eq!(s.leading_intersecting_range(12, u64::MAX), Some((20, 10)));
        assert_eq!(s.leading_intersecting_range(30, 40), None);
    }

    #[test]
    fn shift_right_merges_collisions() {
        let mut s = set(&[(0x1000, 0x1fff), (0x3000, 0x3fff)]);
        s.shift_right(12);
        assert_eq!(s.to_simple_string(), "0x1,0x3");
        let mut t = set(&[(0x1000, 0x1fff), (0x2000, 0x2fff)]);
        t.shift_right(12);
        assert_eq!(t.to_simple_string(), "0x1-0x2");
    }

    #[test]
    fn clone_in_range_is_non_destructive() {
        let s = set(&[(0, 9), (20, 29)]);
        let window = s.clone_in_range(5, 24);
        assert_eq!(window.to_simple_string(), "0x5-0x9,0x14-0x18");
        assert_eq!(s.size(), 20);
    }

    #[test]
    fn large_range_operations_stay_cheap() {
        // An address-sized range: operations must not walk values.
        let mut s = set(&[(0, 1 << 48)]);
        s.sub_range(0x1000, 0x1fff);
        s.sub_range(0x8000, 0x8fff);
        assert_eq!(s.vector_size(), 3);
        s.merge_constraint_set(&set(&[(0x1000, 0x1fff)]));
        assert_eq!(s.vector_size(), 2);
        assert!(s.check_invariants());
    }
}
