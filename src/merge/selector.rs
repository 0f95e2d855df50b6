//! Selection of contiguous part runs for merging.
//!
//! The selector walks every possible left end of a run, extends it to the
//! longest valid run starting there, and keeps the inclusion-maximal
//! candidate with the lexicographically best `(max size, min size, -length)`.
//! Balance requirements tighten with the total size of the run and relax
//! with its age, so freshly inserted parts merge eagerly while large old
//! parts wait for enough siblings. Repeatedly applying the selector keeps
//! total merge work within `O(N log N)` of the ingested rows.

use std::{cmp::Reverse, sync::Arc};

use chrono::{Datelike, Local, NaiveDate, Timelike};
use log::Level;

use crate::{
    logging::grist_log,
    merge::space::DISK_USAGE_COEFFICIENT_TO_SELECT,
    part::{month_of, Part, PartRef},
    table::TableConfig,
};

const SECONDS_PER_DAY: i64 = 24 * 3600;
const GIB: u64 = 1024 * 1024 * 1024;

/// Behavior switches for one selection pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectorFlags {
    /// Merge arbitrarily unbalanced runs in months that are already over,
    /// once the run is old enough.
    pub merge_anything_for_old_months: bool,
    /// Ignore balance rules and per-part row ceilings entirely.
    pub aggressive: bool,
    /// Use the stricter row ceiling; set while another worker is busy with a
    /// large merge.
    pub only_small: bool,
}

/// Point-in-time inputs of a selection pass; injected so nightly and
/// age-dependent behavior is testable.
#[derive(Clone, Copy, Debug)]
pub struct MergeClock {
    /// Current unix time, seconds.
    pub now: i64,
    /// Current local date.
    pub today: NaiveDate,
    /// Current local hour, `0..=23`.
    pub hour: u32,
}

impl MergeClock {
    /// Clock reading the local wall time.
    pub fn local() -> Self {
        let now = Local::now();
        Self {
            now: now.timestamp(),
            today: now.date_naive(),
            hour: now.hour(),
        }
    }

    /// Whether the nightly window (01:00-05:00 local) is active.
    pub fn is_night(&self) -> bool {
        (1..=5).contains(&self.hour)
    }
}

struct Candidate {
    max: u64,
    min: u64,
    len: usize,
    begin: usize,
}

/// Chooses at most one contiguous run of parts to merge next.
#[derive(Clone)]
pub struct MergeSelector {
    table: Arc<TableConfig>,
}

impl MergeSelector {
    /// Create a selector for `table`.
    pub fn new(table: Arc<TableConfig>) -> Self {
        Self { table }
    }

    /// Select a run out of `parts` (a consistent snapshot, in set order), or
    /// `None` when nothing should be merged right now.
    ///
    /// `can_merge` is the collaborator predicate gating adjacent pairs; it
    /// is expected to exclude parts already claimed by other merge workers.
    pub fn select(
        &self,
        parts: &[PartRef],
        available_disk_bytes: u64,
        flags: SelectorFlags,
        can_merge: &dyn Fn(&Part, &Part) -> bool,
        clock: &MergeClock,
    ) -> Option<Vec<PartRef>> {
        grist_log!(Level::Debug, "select_parts", "selecting parts to merge");

        let options = self.table.options();
        let granularity = self.table.index_granularity();

        let mut row_ceiling = options.max_rows_to_merge_parts;
        if clock.is_night() {
            row_ceiling = row_ceiling.saturating_mul(options.merge_parts_at_night_inc);
        }
        if flags.only_small {
            row_ceiling = options.max_rows_to_merge_parts_second;
        }

        let current_month = month_of(clock.today);
        let mut best: Option<Candidate> = None;
        // How many parts, starting at the current one, are covered by a
        // valid run that begins further left. Tracks inclusion-maximality.
        let mut max_count_from_left: usize = 0;

        for (begin, first) in parts.iter().enumerate() {
            max_count_from_left = max_count_from_left.saturating_sub(1);

            if first.rows(granularity) > row_ceiling && !flags.aggressive {
                continue;
            }
            if first.spans_months() {
                grist_log!(
                    Level::Warn,
                    "select_parts",
                    "part {} spans more than one month",
                    first.name
                );
                continue;
            }

            let month = first.left_month;
            // This partition's month ended at least a day ago.
            let is_old_month = clock.today.day() >= 2 && current_month > month;

            let mut cur_max = first.size;
            let mut cur_min = first.size;
            let mut cur_sum = first.size;
            let mut cur_total_bytes = first.size_in_bytes;
            let mut cur_len = 1usize;
            let mut cur_right = first.right;
            let mut oldest_modification = first.modification_time;

            // Longest valid run starting at `begin`.
            let mut longest: Option<(u64, u64, usize)> = None;

            let mut prev: &PartRef = first;
            for next in parts[begin + 1..].iter() {
                if cur_len >= options.max_parts_to_merge_at_once {
                    break;
                }
                if !can_merge(prev, next) || next.spans_months() || next.left_month != month {
                    break;
                }
                if next.rows(granularity) > row_ceiling && !flags.aggressive {
                    break;
                }
                if next.left < cur_right {
                    grist_log!(
                        Level::Warn,
                        "select_parts",
                        "part {} intersects previous part",
                        next.name
                    );
                    break;
                }

                oldest_modification = oldest_modification.min(next.modification_time);
                cur_max = cur_max.max(next.size);
                cur_min = cur_min.min(next.size);
                cur_sum += next.size;
                cur_total_bytes += next.size_in_bytes;
                cur_len += 1;
                cur_right = next.right;

                let age = (clock.now - oldest_modification).max(0);

                // Large freshly written parts merge at least three at a time.
                let min_len = if cur_max * granularity * 150 > GIB && age < 6 * 3600 {
                    3
                } else {
                    2
                };

                // ~0.5 for new runs, ~5 at one month of age.
                let time_ratio_modifier =
                    0.5 + 9.0 * age as f64 / ((30 * SECONDS_PER_DAY) as f64 + age as f64);
                let log_sum = ((cur_sum * granularity).max(1) as f64).log2();
                // ~2 for small runs, decaying towards 0.25 for very large ones.
                let size_ratio_modifier = (2.0 - 3.0 * log_sum / (25.0 + log_sum)).max(0.25);
                let ratio = (time_ratio_modifier
                    * size_ratio_modifier
                    * options.max_size_ratio_to_merge_parts)
                    .max(0.5);

                let balanced = cur_len >= min_len
                    && ((cur_max as f64) / (cur_sum - cur_max) as f64) < ratio;
                let old_month_exempt = is_old_month
                    && flags.merge_anything_for_old_months
                    && age > 15 * SECONDS_PER_DAY;

                if balanced || flags.aggressive || old_month_exempt {
                    if available_disk_bytes as f64
                        > cur_total_bytes as f64 * DISK_USAGE_COEFFICIENT_TO_SELECT
                    {
                        longest = Some((cur_max, cur_min, cur_len));
                    } else {
                        grist_log!(
                            Level::Warn,
                            "select_parts",
                            "won't merge parts from {} to {}: {} bytes free and unreserved, {} required now (+{}% on overhead)",
                            first.name,
                            next.name,
                            available_disk_bytes,
                            cur_total_bytes,
                            ((DISK_USAGE_COEFFICIENT_TO_SELECT - 1.0) * 100.0) as u32
                        );
                    }
                }

                prev = next;
            }

            if let Some((max, min, len)) = longest {
                // Maximal by inclusion: no valid run starting further left
                // still covers this one.
                if len > max_count_from_left {
                    max_count_from_left = len;
                    let better = match &best {
                        None => true,
                        Some(current) => {
                            (max, min, Reverse(len)) < (current.max, current.min, Reverse(current.len))
                        }
                    };
                    if better {
                        best = Some(Candidate {
                            max,
                            min,
                            len,
                            begin,
                        });
                    }
                }
            }
        }

        match best {
            Some(candidate) => {
                let run = parts[candidate.begin..candidate.begin + candidate.len].to_vec();
                grist_log!(
                    Level::Debug,
                    "select_parts",
                    "selected {} parts from {} to {}",
                    run.len(),
                    run.first().map(|p| p.name.as_str()).unwrap_or(""),
                    run.last().map(|p| p.name.as_str()).unwrap_or(""),
                );
                Some(run)
            }
            None => {
                grist_log!(Level::Debug, "select_parts", "no parts to merge");
                None
            }
        }
    }
}
