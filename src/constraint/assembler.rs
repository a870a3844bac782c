//! Block assembly for [`ConstraintSet`](super::ConstraintSet) mutation.
//!
//! Structural operations never rewrite the constraint vector with per-element
//! inserts and erases; they describe the result as an ordered list of blocks
//! (runs kept in place, runs copied from another set, newly built runs) and
//! this module lands every block exactly once with bulk moves. Placement
//! starts in the shrinking direction (left to right) or the expanding
//! direction (right to left) depending on whether the result is smaller or
//! larger than the current vector; when a block's target collides with data
//! that has not moved yet, the remainder of the work is pushed on a placement
//! stack with the opposite direction and resumed after the colliding span is
//! resolved.

use super::Constraint;

/// One contiguous span of the result vector.
pub(crate) enum ConstraintBlock {
    /// A run `[start, end)` of the target vector that survives as-is.
    Move { start: usize, end: usize },
    /// A run copied out of another constraint set.
    Clone { items: Vec<Constraint> },
    /// Newly constructed constraints to splice in.
    Insert { items: Vec<Constraint> },
}

impl ConstraintBlock {
    pub(crate) fn len(&self) -> usize {
        match self {
            ConstraintBlock::Move { start, end } => end - start,
            ConstraintBlock::Clone { items } | ConstraintBlock::Insert { items } => items.len(),
        }
    }

    fn is_in_place(&self) -> bool {
        matches!(self, ConstraintBlock::Move { .. })
    }

    fn in_place_start(&self) -> usize {
        match self {
            ConstraintBlock::Move { start, .. } => *start,
            _ => panic!("in-place-start-not-implemented: block has no vector position"),
        }
    }

    fn in_place_end(&self) -> usize {
        match self {
            ConstraintBlock::Move { end, .. } => *end,
            _ => panic!("in-place-end-not-implemented: block has no vector position"),
        }
    }

    fn items(&self) -> &[Constraint] {
        match self {
            ConstraintBlock::Clone { items } | ConstraintBlock::Insert { items } => items,
            ConstraintBlock::Move { .. } => panic!("move block carries no items"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MoveDirection {
    Shrink,
    Expand,
}

/// One pending placement: blocks `[lower_index, upper_index]` target the
/// vector span `[lower_loc, upper_loc]`, walked in the given direction.
#[derive(Clone, Copy, Debug)]
struct BlocksPlacement {
    lower_index: usize,
    upper_index: usize,
    lower_loc: usize,
    upper_loc: usize,
    direction: MoveDirection,
}

/// Assembles `blocks` into `target`, which must currently hold the source
/// vector every `Move` block refers to. `new_size` is the sum of all block
/// sizes.
pub(crate) fn assemble(target: &mut Vec<Constraint>, blocks: Vec<ConstraintBlock>, new_size: usize) {
    let blocks = coalesce(blocks);
    debug_assert_eq!(new_size, blocks.iter().map(|b| b.len()).sum::<usize>());

    if new_size == 0 {
        assert!(blocks.is_empty(), "blocks-exist-for-empty-result-vector");
        target.clear();
        return;
    }

    let orig_size = target.len();
    if new_size <= orig_size {
        let mut assembler = Assembler::new(target, &blocks);
        assembler.run(BlocksPlacement {
            lower_index: 0,
            upper_index: blocks.len() - 1,
            lower_loc: 0,
            upper_loc: new_size - 1,
            direction: MoveDirection::Shrink,
        });
        target.truncate(new_size);
    } else if new_size <= target.capacity() {
        // Expand inside the existing buffer; freshly exposed slots are
        // placeholders that every expand pass overwrites exactly once.
        target.resize(new_size, Constraint::Value(0));
        let mut assembler = Assembler::new(target, &blocks);
        assembler.run(BlocksPlacement {
            lower_index: 0,
            upper_index: blocks.len() - 1,
            lower_loc: 0,
            upper_loc: new_size - 1,
            direction: MoveDirection::Expand,
        });
    } else {
        // Capacity is insufficient; build the result in a fresh buffer.
        let old = std::mem::replace(target, Vec::with_capacity(new_size));
        for block in &blocks {
            match block {
                ConstraintBlock::Move { start, end } => target.extend_from_slice(&old[*start..*end]),
                ConstraintBlock::Clone { items } | ConstraintBlock::Insert { items } => {
                    target.extend_from_slice(items)
                }
            }
        }
    }
}

/// Folds runs of clone/insert blocks into single blocks. Placement boundary
/// checks assume at most one non-in-place block sits between two in-place
/// runs; processors that split a gap into several pieces rely on this pass.
fn coalesce(blocks: Vec<ConstraintBlock>) -> Vec<ConstraintBlock> {
    let mut result: Vec<ConstraintBlock> = Vec::with_capacity(blocks.len());
    for block in blocks {
        let fold = !block.is_in_place()
            && result.last().map_or(false, |last| !last.is_in_place());
        if fold {
            let items = match block {
                ConstraintBlock::Clone { items } | ConstraintBlock::Insert { items } => items,
                ConstraintBlock::Move { .. } => unreachable!(),
            };
            match result.last_mut().unwrap() {
                ConstraintBlock::Clone { items: previous }
                | ConstraintBlock::Insert { items: previous } => previous.extend(items),
                ConstraintBlock::Move { .. } => unreachable!(),
            }
        } else {
            result.push(block);
        }
    }
    result
}

struct Assembler<'a> {
    target: &'a mut Vec<Constraint>,
    blocks: &'a [ConstraintBlock],
    placement_stack: Vec<BlocksPlacement>,
}

impl<'a> Assembler<'a> {
    fn new(target: &'a mut Vec<Constraint>, blocks: &'a [ConstraintBlock]) -> Self {
        Self { target, blocks, placement_stack: Vec::new() }
    }

    fn run(&mut self, initial: BlocksPlacement) {
        self.placement_stack.push(initial);
        while let Some(placement) = self.placement_stack.pop() {
            match placement.direction {
                MoveDirection::Shrink => self.shrink_place(placement),
                MoveDirection::Expand => self.expand_place(placement),
            }
        }
    }

    /// The boundary a shrinking insertion must stay below: the current
    /// position of the next block that still occupies the vector.
    fn next_shrinking_boundary(&self, next_index: usize, placement: &BlocksPlacement) -> usize {
        if next_index > placement.upper_index {
            placement.upper_loc + 1
        } else if self.blocks[next_index].is_in_place() {
            self.blocks[next_index].in_place_start()
        } else {
            // A pending clone/insert block provides no room of its own.
            0
        }
    }

    /// The boundary an expanding insertion must stay at or above.
    fn next_expanding_boundary(&self, placement: &BlocksPlacement, index: usize) -> usize {
        if index < placement.lower_index || index == usize::MAX {
            placement.lower_loc
        } else if self.blocks[index].is_in_place() {
            self.blocks[index].in_place_end()
        } else {
            usize::MAX
        }
    }

    /// Walks blocks left to right, packing each one toward the low end.
    fn shrink_place(&mut self, placement: BlocksPlacement) {
        let mut block_loc = placement.lower_loc;
        let mut index = placement.lower_index;
        while index <= placement.upper_index {
            let block = &self.blocks[index];
            let block_size = block.len();
            match block {
                ConstraintBlock::Move { start, end } => {
                    debug_assert!(block_loc <= *start, "shrinking-to-larger-location");
                    if block_loc != *start {
                        self.target.copy_within(*start..*end, block_loc);
                    }
                    block_loc += block_size;
                }
                _ => {
                    let end_loc = block_loc + block_size - 1;
                    if end_loc < self.next_shrinking_boundary(index + 1, &placement) {
                        self.target[block_loc..block_loc + block_size].copy_from_slice(block.items());
                        block_loc += block_size;
                    } else {
                        // Not enough packed room yet; find where the needed
                        // space ends and swap direction for the covered span.
                        let (upper_loc, upper_index) =
                            self.seek_shrinking_space(block_loc, block_size, index + 1, &placement);
                        if upper_loc < placement.upper_loc {
                            assert!(
                                upper_index < placement.upper_index,
                                "upper-index-should-be-less-than-original-placement"
                            );
                            self.placement_stack.push(BlocksPlacement {
                                lower_index: upper_index + 1,
                                upper_index: placement.upper_index,
                                lower_loc: upper_loc + 1,
                                upper_loc: placement.upper_loc,
                                direction: MoveDirection::Shrink,
                            });
                        }
                        self.placement_stack.push(BlocksPlacement {
                            lower_index: index,
                            upper_index,
                            lower_loc: block_loc,
                            upper_loc,
                            direction: MoveDirection::Expand,
                        });
                        return;
                    }
                }
            }
            index += 1;
        }
    }

    /// Walks blocks right to left, packing each one toward the high end.
    fn expand_place(&mut self, placement: BlocksPlacement) {
        let mut block_loc = placement.upper_loc;
        let mut index = placement.upper_index;
        loop {
            let block = &self.blocks[index];
            let block_size = block.len();
            match block {
                ConstraintBlock::Move { start, end } => {
                    let end_loc = *end - 1;
                    debug_assert!(block_loc >= end_loc, "expanding-to-lesser-location");
                    if block_loc != end_loc {
                        self.target.copy_within(*start..*end, block_loc + 1 - block_size);
                    }
                    block_loc = block_loc.wrapping_sub(block_size);
                }
                _ => {
                    let boundary = self.next_expanding_boundary(&placement, index.wrapping_sub(1));
                    let fits = match (block_loc + 1).checked_sub(block_size) {
                        Some(end_loc) => boundary != usize::MAX && end_loc >= boundary,
                        None => false,
                    };
                    if fits {
                        let start = block_loc + 1 - block_size;
                        self.target[start..start + block_size].copy_from_slice(block.items());
                        block_loc = block_loc.wrapping_sub(block_size);
                    } else {
                        let (lower_loc, lower_index) =
                            self.seek_expanding_space(block_loc, block_size, index, &placement);
                        if lower_loc > placement.lower_loc {
                            assert!(
                                lower_index > placement.lower_index,
                                "lower-index-should-be-larger-than-original-placement"
                            );
                            self.placement_stack.push(BlocksPlacement {
                                lower_index: placement.lower_index,
                                upper_index: lower_index - 1,
                                lower_loc: placement.lower_loc,
                                upper_loc: lower_loc - 1,
                                direction: MoveDirection::Expand,
                            });
                        }
                        self.placement_stack.push(BlocksPlacement {
                            lower_index,
                            upper_index: index,
                            lower_loc,
                            upper_loc: block_loc,
                            direction: MoveDirection::Shrink,
                        });
                        return;
                    }
                }
            }
            if index == placement.lower_index {
                return;
            }
            index -= 1;
        }
    }

    /// Finds the span of vector room that lets a block of `block_size` land
    /// at `target_loc` while shrinking. Returns the inclusive upper location
    /// of the room found and the index of the last block inside it.
    fn seek_shrinking_space(
        &self,
        target_loc: usize,
        block_size: usize,
        mut search_index: usize,
        placement: &BlocksPlacement,
    ) -> (usize, usize) {
        let mut remaining = block_size;
        let mut last_start = target_loc as i64;
        while search_index <= placement.upper_index {
            let next_item = &self.blocks[search_index];
            if next_item.is_in_place() {
                let next_start = next_item.in_place_start() as i64;
                assert!(next_start >= last_start, "next-start-less-than-last-start");
                let space_found = (next_start - last_start) as usize;
                if space_found >= remaining {
                    return (last_start as usize + remaining - 1, search_index - 1);
                }
                remaining -= space_found;
                last_start = next_item.in_place_end() as i64;
            } else {
                remaining += next_item.len();
            }
            search_index += 1;
        }

        // Room may come entirely from deleted entries at the tail.
        let last_size = placement.upper_loc as i64 - last_start + 1;
        if last_size == remaining as i64 {
            return (placement.upper_loc, placement.upper_index);
        }
        panic!(
            "no-space-to-insert-while-shrinking: block size {} last start {} remaining {}",
            block_size, last_start, remaining
        );
    }

    /// The expanding-direction mirror of [`Self::seek_shrinking_space`].
    /// Returns the inclusive lower location of the room found and the index
    /// of the first block inside it.
    fn seek_expanding_space(
        &self,
        target_loc: usize,
        block_size: usize,
        current_index: usize,
        placement: &BlocksPlacement,
    ) -> (usize, usize) {
        let mut remaining = block_size;
        let mut last_end = target_loc as i64;
        let mut search_index = current_index as i64 - 1;
        while search_index >= placement.lower_index as i64 {
            let next_item = &self.blocks[search_index as usize];
            if next_item.is_in_place() {
                let next_end = next_item.in_place_end() as i64 - 1;
                assert!(next_end <= last_end, "next-end-larger-than-last-end");
                let space_found = (last_end - next_end) as usize;
                if space_found >= remaining {
                    return (last_end as usize - (remaining - 1), search_index as usize + 1);
                }
                remaining -= space_found;
                last_end = next_item.in_place_start() as i64 - 1;
            } else {
                remaining += next_item.len();
            }
            search_index -= 1;
        }

        let first_size = last_end - placement.lower_loc as i64 + 1;
        if first_size == remaining as i64 {
            return (placement.lower_loc, placement.lower_index);
        }
        panic!(
            "no-space-to-insert-while-expanding: block size {} last end {} remaining {}",
            block_size, last_end, remaining
        );
    }
}
