#![deny(missing_docs)]
//! Merge planner and executor for a partitioned, log-structured columnar
//! table engine.
//!
//! A table's data is an ordered catalog of immutable sorted *parts*; writes
//! produce new small parts, and background workers repeatedly pick a
//! contiguous run of parts within one month partition and merge it into a
//! single larger part. This crate owns the two halves of that loop:
//!
//! - **Selection** — [`MergeSelector`] walks a snapshot of the part set and
//!   picks at most one run, balancing merge fan-in against disk headroom,
//!   part age, and the nightly maintenance window, so total merge work stays
//!   within `O(N log N)` of the ingested rows.
//! - **Execution** — [`PartMerger`] k-way merges the run's block streams
//!   under the table's row-combining mode (ordinary, collapsing, or
//!   summing), writes the output through a [`PartStore`], and publishes it
//!   with one atomic [`PartSet::replace_parts`] swap.
//!
//! Parts are reached only through the [`PartStore`] seam; the on-disk column
//! format belongs to collaborators. [`MemoryPartStore`] ships as the
//! embedded backend and test harness.

pub mod block;
mod error;
pub(crate) mod logging;
pub mod merge;
pub mod option;
pub mod part;
pub mod table;

pub use error::MergeError;
pub use merge::{
    estimate_disk_space_for_merge, MergeClock, MergeSelector, PartMerger, SelectorFlags,
    DISK_USAGE_COEFFICIENT_TO_RESERVE, DISK_USAGE_COEFFICIENT_TO_SELECT,
};
pub use option::MergeOptions;
pub use part::{
    memory::MemoryPartStore,
    set::PartSet,
    store::{BlockSink, BlockSource, MarkRange, PartStore},
    Part, PartRef,
};
pub use table::{BlockExpression, MergeMode, TableConfig};
