//! Unified diff handling: hunk headers, per-file line remapping, and
//! per-commit grouping of hunks by file.

pub mod commit;
pub mod hunk;
pub mod remap;

pub use commit::CommitDiff;
pub use hunk::Hunk;
pub use remap::{BeyondRangePolicy, LineMap, Remap};
