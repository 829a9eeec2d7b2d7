//! Proptest strategies for assignment planning inputs.

use proptest::prelude::*;

/// Queue priorities within the valid 1..=4 range.
pub fn priorities_strategy() -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(1..=4i32, 0..40)
}

/// Per-worker free slot counts.
pub fn capacities_strategy() -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(1..=5i32, 1..5)
}
