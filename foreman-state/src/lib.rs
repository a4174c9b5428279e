//! Foreman Task State Machine
//!
//! Pure transition logic over task snapshots. Nothing here performs I/O:
//! `plan_transition` validates a proposed transition against the current
//! task state, its version, and a view of its dependencies, then returns the
//! staged mutation (new task state + audit record) for the store to apply
//! atomically under its compare-and-set.
//!
//! Validation order is fixed: transition pair, then version, then the
//! state-specific preconditions. The version check is what keeps concurrent
//! actors (PM loop, workers, users) from trampling each other; everything
//! downstream leans on it.

mod machine;
mod ordering;

pub use machine::{
    is_legal, plan_transition, unmet_dependencies, StagedTransition, TransitionEffects,
    TransitionInput, LEGAL_TRANSITIONS,
};
pub use ordering::{ready_order, sort_ready};
