//! Immutable part metadata and the authoritative part catalog.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};

pub mod memory;
pub mod set;
pub mod store;

/// Shared handle to immutable part metadata.
pub type PartRef = Arc<Part>;

/// Metadata of one immutable, sorted, column-oriented table fragment.
///
/// Parts are published once and never mutated; merges replace a contiguous
/// run of parts with a single larger part carrying the union of their
/// ranges and a level one above the deepest input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    /// Derived unique identifier: `{left_date}_{right_date}_{left}_{right}_{level}`.
    pub name: String,
    /// Smallest block identifier covered by the part.
    pub left: u64,
    /// Largest block identifier covered by the part.
    pub right: u64,
    /// First date present in the part.
    pub left_date: NaiveDate,
    /// Last date present in the part.
    pub right_date: NaiveDate,
    /// First day of `left_date`'s month; the partition key for mergeable parts.
    pub left_month: NaiveDate,
    /// First day of `right_date`'s month.
    pub right_month: NaiveDate,
    /// Number of index marks; `rows ≈ size × index_granularity`.
    pub size: u64,
    /// On-disk footprint.
    pub size_in_bytes: u64,
    /// Merge generation; merges produce `max(inputs) + 1`.
    pub level: u32,
    /// Unix seconds of the part's last write.
    pub modification_time: i64,
}

impl Part {
    /// Build part metadata from its ranges and level; `size`,
    /// `size_in_bytes`, and `modification_time` start at zero and are filled
    /// in by the writer (see the `with_*` methods).
    pub fn new(
        left_date: NaiveDate,
        right_date: NaiveDate,
        left: u64,
        right: u64,
        level: u32,
    ) -> Self {
        Self {
            name: part_name(left_date, right_date, left, right, level),
            left,
            right,
            left_date,
            right_date,
            left_month: month_of(left_date),
            right_month: month_of(right_date),
            size: 0,
            size_in_bytes: 0,
            level,
            modification_time: 0,
        }
    }

    /// Set the mark count.
    pub fn with_size(mut self, marks: u64) -> Self {
        self.size = marks;
        self
    }

    /// Set the on-disk footprint.
    pub fn with_size_in_bytes(mut self, bytes: u64) -> Self {
        self.size_in_bytes = bytes;
        self
    }

    /// Set the last write time, unix seconds.
    pub fn with_modification_time(mut self, unix_seconds: i64) -> Self {
        self.modification_time = unix_seconds;
        self
    }

    /// Whether the part covers more than one calendar month. Such parts are
    /// never merged.
    pub fn spans_months(&self) -> bool {
        self.left_month != self.right_month
    }

    /// The partition this part belongs to (canonical month).
    pub fn partition_key(&self) -> NaiveDate {
        self.left_month
    }

    /// Approximate row count for the given index granularity.
    pub fn rows(&self, index_granularity: u64) -> u64 {
        self.size * index_granularity
    }

    pub(crate) fn ordering_key(&self) -> (NaiveDate, u64) {
        (self.left_month, self.left)
    }
}

/// Derive the canonical part name from its ranges and level.
pub fn part_name(
    left_date: NaiveDate,
    right_date: NaiveDate,
    left: u64,
    right: u64,
    level: u32,
) -> String {
    format!(
        "{}_{}_{}_{}_{}",
        left_date.format("%Y%m%d"),
        right_date.format("%Y%m%d"),
        left,
        right,
        level
    )
}

/// Canonical month of a date: the first day of its month.
pub fn month_of(date: NaiveDate) -> NaiveDate {
    date.with_day(1).expect("every month has a first day")
}
