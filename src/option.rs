//! Merge selection knobs.

/// Tuning parameters consulted by the selector when choosing a run of parts.
///
/// With `max_parts_to_merge_at_once >=
/// log(max_rows_to_merge_parts / index_granularity) /
/// log(max_size_ratio_to_merge_parts)` the selector keeps total merge work
/// within `O(N log N)` of the ingested row count.
#[derive(Clone, Debug)]
pub struct MergeOptions {
    /// Cap on the number of parts merged in one run.
    pub max_parts_to_merge_at_once: usize,
    /// Per-part row ceiling for inclusion in the main stream.
    pub max_rows_to_merge_parts: u64,
    /// Stricter per-part row ceiling applied when only small merges are wanted.
    pub max_rows_to_merge_parts_second: u64,
    /// Multiplier applied to the row ceiling during the nightly window.
    pub merge_parts_at_night_inc: u64,
    /// Base balance constant; the largest part must stay below this ratio of
    /// the rest of the run, after age and size modifiers.
    pub max_size_ratio_to_merge_parts: f64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            max_parts_to_merge_at_once: 10,
            max_rows_to_merge_parts: 100 * 1024 * 1024,
            max_rows_to_merge_parts_second: 1024 * 1024,
            merge_parts_at_night_inc: 10,
            max_size_ratio_to_merge_parts: 5.0,
        }
    }
}

impl MergeOptions {
    /// Set the cap on run length.
    pub fn with_max_parts_to_merge_at_once(mut self, value: usize) -> Self {
        self.max_parts_to_merge_at_once = value;
        self
    }

    /// Set the per-part row ceiling for the main stream.
    pub fn with_max_rows_to_merge_parts(mut self, value: u64) -> Self {
        self.max_rows_to_merge_parts = value;
        self
    }

    /// Set the stricter row ceiling used for small-only merges.
    pub fn with_max_rows_to_merge_parts_second(mut self, value: u64) -> Self {
        self.max_rows_to_merge_parts_second = value;
        self
    }

    /// Set the nightly row-ceiling multiplier.
    pub fn with_merge_parts_at_night_inc(mut self, value: u64) -> Self {
        self.merge_parts_at_night_inc = value;
        self
    }

    /// Set the base balance constant.
    pub fn with_max_size_ratio_to_merge_parts(mut self, value: f64) -> Self {
        self.max_size_ratio_to_merge_parts = value;
        self
    }
}
