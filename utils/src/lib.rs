//! Shared infrastructure utilities for sandpatch.
//!
//! Cross-cutting IO helpers that don't belong in the domain-pure
//! `sandpatch-types` crate:
//!
//! - **`atomic_write`**: Crash-safe file persistence (temp + rename)
//! - **`diff`**: Line-level change statistics

pub mod atomic_write;
pub mod diff;

pub use atomic_write::{
    AtomicWriteOptions, FileSyncPolicy, PersistMode, atomic_write_new, atomic_write_with_options,
};
pub use diff::{DiffStats, compute_diff_stats};
