//! Merge planning and execution.

mod executor;
mod selector;
mod space;
mod stream;

pub use executor::PartMerger;
pub use selector::{MergeClock, MergeSelector, SelectorFlags};
pub use space::{
    estimate_disk_space_for_merge, DISK_USAGE_COEFFICIENT_TO_RESERVE,
    DISK_USAGE_COEFFICIENT_TO_SELECT,
};
