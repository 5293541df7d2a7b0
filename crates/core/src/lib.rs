//! Core types shared across the keyed state crates.
//!
//! Everything here is a plain value or a pure function. The key-group scheme in
//! [`key_group`] is the contract that lets state written by one parallel instance
//! be split and redistributed when a job is rescaled, so it must never change
//! for an existing `max_parallelism`.

pub mod key_group;

pub use key_group::{
    assign_to_key_group, compute_default_max_parallelism, compute_key_group_for_key_hash,
    compute_key_group_range_for_operator_index, compute_operator_index_for_key_group, key_hash,
    KeyGroupError, KeyGroupRange, DEFAULT_LOWER_BOUND_MAX_PARALLELISM,
    UPPER_BOUND_MAX_PARALLELISM,
};

/// Milliseconds since Unix epoch.
pub type Timestamp = u64;

/// Identifier of a checkpoint, assigned by the checkpoint coordinator.
pub type CheckpointId = u64;
