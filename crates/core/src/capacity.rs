//! Admission quota for the work queue dispatcher.
//!
//! Messages that were received but not yet acknowledged (`not_visible`) still
//! count against the limit. The dispatcher cannot see how many execution units
//! are actually running, so in-flight deliveries are the conservative proxy and
//! capacity is never over-committed.

use thiserror::Error;

/// Queue-level visibility counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct QueueVisibility {
    /// Messages eligible to be received.
    pub visible: u32,
    /// Messages received by some consumer and not yet acknowledged or expired.
    pub not_visible: u32,
}

impl QueueVisibility {
    pub fn new(visible: u32, not_visible: u32) -> Self {
        Self { visible, not_visible }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapacityError {
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: i64 },

    #[error("{field} is out of range, got {value}")]
    Overflow { field: &'static str, value: i64 },
}

/// Number of additional execution units that may be started this tick.
pub fn quota(limit: u32, visibility: QueueVisibility) -> u32 {
    let remaining = limit.saturating_sub(visibility.not_visible);
    remaining.min(visibility.visible)
}

/// [`quota`] for untyped counters (e.g. parsed from an orchestrator event).
///
/// Negative inputs indicate corrupted configuration or metrics and fail
/// instead of being clamped to zero.
pub fn checked_quota(limit: i64, not_visible: i64, visible: i64) -> Result<u32, CapacityError> {
    let limit = counter("limit", limit)?;
    let not_visible = counter("not_visible", not_visible)?;
    let visible = counter("visible", visible)?;
    Ok(quota(limit, QueueVisibility::new(visible, not_visible)))
}

/// Convert an untyped counter, rejecting negative or oversized values.
pub fn counter(field: &'static str, value: i64) -> Result<u32, CapacityError> {
    if value < 0 {
        return Err(CapacityError::Negative { field, value });
    }
    u32::try_from(value).map_err(|_| CapacityError::Overflow { field, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn remaining_capacity_is_limited_by_visible_messages() {
        assert_eq!(quota(20, QueueVisibility::new(30, 5)), 15);
        assert_eq!(quota(20, QueueVisibility::new(3, 5)), 3);
    }

    #[test]
    fn in_flight_beyond_limit_yields_zero() {
        assert_eq!(quota(20, QueueVisibility::new(10, 25)), 0);
        assert_eq!(quota(20, QueueVisibility::new(10, 20)), 0);
    }

    #[test]
    fn negative_counters_fail_fast() {
        assert_eq!(
            checked_quota(-1, 0, 0),
            Err(CapacityError::Negative { field: "limit", value: -1 })
        );
        assert_eq!(
            checked_quota(20, -5, 10),
            Err(CapacityError::Negative { field: "not_visible", value: -5 })
        );
        assert_eq!(
            checked_quota(20, 0, i64::MAX),
            Err(CapacityError::Overflow { field: "visible", value: i64::MAX })
        );
        assert_eq!(checked_quota(20, 5, 30), Ok(15));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        /// quota = min(max(0, limit - not_visible), visible), never above either bound.
        #[test]
        fn quota_matches_formula(limit in 0u32..1_000, not_visible in 0u32..1_000, visible in 0u32..1_000) {
            let q = quota(limit, QueueVisibility::new(visible, not_visible));
            let expected = (i64::from(limit) - i64::from(not_visible)).max(0).min(i64::from(visible));

            prop_assert_eq!(i64::from(q), expected);
            prop_assert!(q <= visible);
            prop_assert!(q <= limit);
        }
    }
}
