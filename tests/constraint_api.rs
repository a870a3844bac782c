//! Constraint-set algebra exercised through the public API, including the
//! serialized dump round trip.

use rvgen::constraint::serialize::{self, ConstraintSetSerializer};
use rvgen::constraint::ConstraintSet;
use rvgen::rng::Rng;

fn set(ranges: &[(u64, u64)]) -> ConstraintSet {
    let mut s = ConstraintSet::new();
    for &(lo, hi) in ranges {
        s.add_range(lo, hi);
    }
    s
}

#[test]
fn subtraction_scenario_matches_expected() {
    let mut s = set(&[(0, 9), (20, 29)]);
    s.sub_range(5, 24);
    assert_eq!(s.to_simple_string(), "0x0-0x4,0x19-0x1d");
    assert_eq!(s.size(), 10);
    assert!(s.check_invariants());
}

#[test]
fn index_mask_scenario_matches_expected() {
    let mut s = set(&[(0, 0xffff)]);
    s.apply_index_mask(0x3, 0xf);
    assert_eq!(s.size(), 0x1000);
    assert!(s.check_invariants());
}

#[test]
fn merge_sub_intersect_identities_hold() {
    let s = set(&[(0, 63), (100, 163), (1000, 1063)]);
    let t = set(&[(32, 131), (2000, 2063)]);

    // S.merge(T).sub(T) contains S.sub(T).
    let mut merged_then_subbed = s.clone();
    merged_then_subbed.merge_constraint_set(&t);
    merged_then_subbed.sub_constraint_set(&t);
    let mut subbed = s.clone();
    subbed.sub_constraint_set(&t);
    assert!(merged_then_subbed.contains_constraint_set(&subbed));

    // S.sub(T) is disjoint from T.
    let mut leftover = subbed.clone();
    leftover.apply_constraint_set(&t);
    assert!(leftover.is_empty());

    // Sizes stay consistent with the element sum throughout.
    assert!(merged_then_subbed.check_invariants());
    assert!(subbed.check_invariants());
}

#[test]
fn chooser_draws_members_only() {
    let s = set(&[(10, 19), (30, 39), (50, 59)]);
    let mut rng = Rng::new(0xfeed);
    for _ in 0..256 {
        assert!(s.contains_value(s.choose_value(&mut rng).unwrap()));
    }
}

#[test]
fn alignment_filter_is_idempotent() {
    let mut s = set(&[(0x123, 0x4567), (0x9000, 0x9fff)]);
    s.align_with_size(!0xff, 0x100);
    let once = s.clone();
    s.align_with_size(!0xff, 0x100);
    assert_eq!(s, once);
    assert!(s.check_invariants());
}

#[test]
fn dump_file_round_trip() {
    let directory = std::env::temp_dir();
    let mut original = ConstraintSet::new();
    original.add_range(0x8000_0000, 0x8fff_ffff);
    original.add_value(0x4000);
    original.add_range(0x1_0000, 0x1_ffff);

    ConstraintSetSerializer::new(&original, 2)
        .serialize(&directory, "UsableSnapshot", 7)
        .unwrap();

    let mut loaded = ConstraintSet::new();
    serialize::deserialize(&mut loaded, &directory, "UsableSnapshot", 7).unwrap();
    assert_eq!(loaded, original);
}
