//! One-pass reducing operations on a constraint vector. A trimmer visits
//! every element in order and emits a keep/replace/remove decision; surviving
//! elements are compacted toward the front of the vector in the same pass, so
//! a trim never costs more than one walk regardless of how much it removes.

use super::{Constraint, SizeChange};

/// Decision for one element.
pub(crate) enum TrimResult {
    /// The element survives unchanged.
    Keep,
    /// The element is replaced by a narrower constraint.
    Replace(Constraint),
    /// The element is removed entirely.
    Remove,
}

/// Runs `decide` over every element of `constraints`, compacting in place.
/// Returns the aggregate size change.
pub(crate) fn trim<F>(constraints: &mut Vec<Constraint>, mut decide: F) -> SizeChange
where
    F: FnMut(&Constraint) -> TrimResult,
{
    let mut change = SizeChange::default();
    let mut insert = 0usize;
    for through in 0..constraints.len() {
        let item = constraints[through];
        match decide(&item) {
            TrimResult::Keep => {
                insert = emit(constraints, insert, item);
            }
            TrimResult::Replace(replacement) => {
                change.removed += item.value_count();
                change.added += replacement.value_count();
                insert = emit(constraints, insert, replacement);
            }
            TrimResult::Remove => {
                change.removed += item.value_count();
            }
        }
    }
    constraints.truncate(insert);
    change
}

/// Writes a surviving element at the compaction point, folding it into the
/// previous survivor when value rewrites (index-mask stripping) have made
/// the two adjacent.
fn emit(constraints: &mut Vec<Constraint>, insert: usize, item: Constraint) -> usize {
    if insert > 0 {
        let previous = constraints[insert - 1];
        if previous.upper_bound().checked_add(1) == Some(item.lower_bound()) {
            constraints[insert - 1] =
                Constraint::from_bounds(previous.lower_bound(), item.upper_bound());
            return insert;
        }
    }
    constraints[insert] = item;
    insert + 1
}

/// Keeps, per element, the whole span from the first `align`-aligned address
/// whose `size` bytes fit inside the element to the end of the last such
/// block. `align_mask` clears the offset bits (e.g. `!0xFFF` for 4 KiB).
pub(crate) fn align_with_size(constraint: &Constraint, align_mask: u64, size: u64) -> TrimResult {
    align_offset_with_size(constraint, align_mask, 0, size)
}

/// Like [`align_with_size`] but for addresses congruent to `offset` within
/// the alignment granule.
pub(crate) fn align_offset_with_size(
    constraint: &Constraint,
    align_mask: u64,
    offset: u64,
    size: u64,
) -> TrimResult {
    let (lower, upper) = (constraint.lower_bound(), constraint.upper_bound());
    let granule = !align_mask;
    debug_assert!(size >= 1);
    debug_assert_eq!(offset & align_mask, 0);

    // First start address >= lower with the requested offset.
    let mut first = (lower & align_mask) | offset;
    if first < lower {
        match first.checked_add(granule.wrapping_add(1)) {
            Some(next) => first = next,
            None => return TrimResult::Remove,
        }
    }
    // Last start address whose block still fits below upper.
    let room = match upper.checked_sub(size - 1) {
        Some(limit) => limit,
        None => return TrimResult::Remove,
    };
    let mut last = (room & align_mask) | offset;
    if last > room {
        match last.checked_sub(granule.wrapping_add(1)) {
            Some(previous) => last = previous,
            None => return TrimResult::Remove,
        }
    }
    if first > last {
        return TrimResult::Remove;
    }

    let new_upper = last + (size - 1);
    if first == lower && new_upper == upper {
        TrimResult::Keep
    } else {
        TrimResult::Replace(Constraint::from_bounds(first, new_upper))
    }
}

/// Keeps addresses congruent to `base_remainder` modulo `mul_data` with room
/// for `size` bytes, for alignments that are not powers of two.
pub(crate) fn align_mul_data_with_size(
    constraint: &Constraint,
    mul_data: u64,
    base_remainder: u64,
    size: u64,
) -> TrimResult {
    let (lower, upper) = (constraint.lower_bound(), constraint.upper_bound());
    debug_assert!(mul_data != 0);
    debug_assert!(base_remainder < mul_data);
    debug_assert!(size >= 1);

    let lower_rem = lower % mul_data;
    let mut first = lower - lower_rem + base_remainder;
    if first < lower {
        match first.checked_add(mul_data) {
            Some(next) => first = next,
            None => return TrimResult::Remove,
        }
    }
    let room = match upper.checked_sub(size - 1) {
        Some(limit) => limit,
        None => return TrimResult::Remove,
    };
    let room_rem = room % mul_data;
    let mut last = room - room_rem + base_remainder;
    if last > room {
        match last.checked_sub(mul_data) {
            Some(previous) => last = previous,
            None => return TrimResult::Remove,
        }
    }
    if first > last {
        return TrimResult::Remove;
    }

    let new_upper = last + (size - 1);
    if first == lower && new_upper == upper {
        TrimResult::Keep
    } else {
        TrimResult::Replace(Constraint::from_bounds(first, new_upper))
    }
}

/// Keeps values `x` with `x & mask == index`, then strips the masked bits.
/// The mask must be a contiguous run of low bits; the surviving values land
/// densely once the run is shifted out.
pub(crate) fn apply_index_mask(constraint: &Constraint, index: u64, mask: u64) -> TrimResult {
    assert!(
        mask != 0 && (mask & (mask + 1)) == 0,
        "unexpected-index-mask: mask 0x{:x} is not a contiguous low-bit run",
        mask
    );
    debug_assert_eq!(index & !mask, 0);
    let shift = mask.count_ones();
    let (lower, upper) = (constraint.lower_bound(), constraint.upper_bound());

    // First and last values in range whose masked bits equal the index.
    let mut first = (lower & !mask) | index;
    if first < lower {
        match first.checked_add(mask + 1) {
            Some(next) => first = next,
            None => return TrimResult::Remove,
        }
    }
    let mut last = (upper & !mask) | index;
    if last > upper {
        match last.checked_sub(mask + 1) {
            Some(previous) => last = previous,
            None => return TrimResult::Remove,
        }
    }
    if first > last {
        return TrimResult::Remove;
    }
    TrimResult::Replace(Constraint::from_bounds(first >> shift, last >> shift))
}
