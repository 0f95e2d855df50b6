//! Disk headroom accounting for merge selection and reservation.

use crate::part::PartRef;

/// Selection refuses a run unless free disk exceeds the run's input bytes by
/// this factor.
pub const DISK_USAGE_COEFFICIENT_TO_SELECT: f64 = 1.6;

/// Factor applied when reserving disk before execution. Kept a little below
/// the selection factor: free space may shrink between selection and
/// reservation.
pub const DISK_USAGE_COEFFICIENT_TO_RESERVE: f64 = 1.4;

/// Bytes to reserve before merging `parts`.
pub fn estimate_disk_space_for_merge(parts: &[PartRef]) -> u64 {
    let total: u64 = parts.iter().map(|part| part.size_in_bytes).sum();
    (total as f64 * DISK_USAGE_COEFFICIENT_TO_RESERVE).ceil() as u64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;

    use super::*;
    use crate::part::Part;

    #[test]
    fn estimate_applies_reservation_coefficient() {
        let day = NaiveDate::from_ymd_opt(2014, 6, 1).unwrap();
        let parts: Vec<PartRef> = (0..2)
            .map(|i| {
                Arc::new(Part::new(day, day, i, i, 0).with_size_in_bytes(100))
            })
            .collect();
        assert_eq!(estimate_disk_space_for_merge(&parts), 280);
    }
}
