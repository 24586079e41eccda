//! Secret rotation policy.
//!
//! Pure functions of (interval, last rotation, now). No I/O.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::tag::tagged_enum;

/// Days before the deadline during which a secret is reported as due soon.
pub const ROTATION_WARNING_DAYS: i64 = 7;

/// Longest accepted rotation interval (100 years).
pub const MAX_ROTATION_INTERVAL_DAYS: i64 = 36_500;

tagged_enum! {
    /// Rotation state of a secret.
    pub enum RotationStatus in "rotation_status" {
        NoPolicy => ("no_policy", "No Policy"),
        Ok => ("ok", "OK"),
        DueSoon => ("due_soon", "Due Soon"),
        Overdue => ("overdue", "Overdue"),
    }
}

/// Rotation policy fields of one secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotationPolicy {
    pub interval_days: Option<i64>,
    pub last_rotated_at: Option<DateTime<Utc>>,
}

impl RotationPolicy {
    pub fn new(interval_days: Option<i64>, last_rotated_at: Option<DateTime<Utc>>) -> Self {
        Self {
            interval_days,
            last_rotated_at,
        }
    }

    /// Classify the secret at `now`.
    ///
    /// With an interval of 7 days or less the warning window starts at or
    /// before the rotation itself; that is valid and simply means the secret
    /// is due soon right after rotation.
    pub fn status(&self, now: DateTime<Utc>) -> RotationStatus {
        let Some(interval) = self.interval_days else {
            return RotationStatus::NoPolicy;
        };
        let Some(last) = self.last_rotated_at else {
            return RotationStatus::Overdue;
        };

        // Out-of-range intervals have a deadline that is never reached.
        let age = now.signed_duration_since(last);
        let reached = |days: i64| Duration::try_days(days).is_some_and(|limit| age >= limit);
        if reached(interval) {
            RotationStatus::Overdue
        } else if reached(interval.saturating_sub(ROTATION_WARNING_DAYS)) {
            RotationStatus::DueSoon
        } else {
            RotationStatus::Ok
        }
    }

    /// Calendar days until the rotation deadline.
    ///
    /// `None` without a policy, `0` if never rotated, negative once overdue.
    pub fn days_until_rotation(&self, now: DateTime<Utc>) -> Option<i64> {
        let interval = self.interval_days?;
        let Some(last) = self.last_rotated_at else {
            return Some(0);
        };
        let elapsed = now.date_naive().signed_duration_since(last.date_naive()).num_days();
        Some(interval.saturating_sub(elapsed))
    }
}

/// Aggregate rotation counts over a set of secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RotationSummary {
    pub total: usize,
    pub no_policy: usize,
    pub ok: usize,
    pub due_soon: usize,
    pub overdue: usize,
}

impl RotationSummary {
    pub fn collect<'a>(
        policies: impl IntoIterator<Item = &'a RotationPolicy>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut summary = Self::default();
        for policy in policies {
            summary.total += 1;
            match policy.status(now) {
                RotationStatus::NoPolicy => summary.no_policy += 1,
                RotationStatus::Ok => summary.ok += 1,
                RotationStatus::DueSoon => summary.due_soon += 1,
                RotationStatus::Overdue => summary.overdue += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    fn rotated_days_ago(interval: i64, days: i64) -> RotationPolicy {
        RotationPolicy::new(Some(interval), Some(now() - Duration::days(days)))
    }

    #[test]
    fn test_no_interval_is_no_policy() {
        let policy = RotationPolicy::new(None, Some(now()));
        assert_eq!(policy.status(now()), RotationStatus::NoPolicy);
        assert_eq!(policy.days_until_rotation(now()), None);
    }

    #[test]
    fn test_never_rotated_is_overdue() {
        let policy = RotationPolicy::new(Some(30), None);
        assert_eq!(policy.status(now()), RotationStatus::Overdue);
        assert_eq!(policy.days_until_rotation(now()), Some(0));
    }

    #[test]
    fn test_thirty_day_interval() {
        assert_eq!(rotated_days_ago(30, 20).status(now()), RotationStatus::Ok);
        assert_eq!(rotated_days_ago(30, 22).status(now()), RotationStatus::Ok);
        // The warning window is the last 7 days: 23..30.
        assert_eq!(rotated_days_ago(30, 23).status(now()), RotationStatus::DueSoon);
        assert_eq!(rotated_days_ago(30, 25).status(now()), RotationStatus::DueSoon);
        assert_eq!(rotated_days_ago(30, 27).status(now()), RotationStatus::DueSoon);
        assert_eq!(rotated_days_ago(30, 30).status(now()), RotationStatus::Overdue);
        assert_eq!(rotated_days_ago(30, 31).status(now()), RotationStatus::Overdue);
    }

    #[test]
    fn test_short_interval_window_degenerates() {
        // interval <= 7: fresh secrets are already inside the window.
        assert_eq!(rotated_days_ago(7, 0).status(now()), RotationStatus::DueSoon);
        assert_eq!(rotated_days_ago(5, 1).status(now()), RotationStatus::DueSoon);
        assert_eq!(rotated_days_ago(5, 5).status(now()), RotationStatus::Overdue);
    }

    #[test]
    fn test_days_until_rotation() {
        assert_eq!(rotated_days_ago(30, 25).days_until_rotation(now()), Some(5));
        assert_eq!(rotated_days_ago(30, 0).days_until_rotation(now()), Some(30));
        assert_eq!(rotated_days_ago(30, 31).days_until_rotation(now()), Some(-1));
    }

    #[test]
    fn test_summary_counts() {
        let policies = [
            RotationPolicy::default(),
            rotated_days_ago(30, 1),
            rotated_days_ago(30, 27),
            RotationPolicy::new(Some(30), None),
            rotated_days_ago(90, 120),
        ];
        let summary = RotationSummary::collect(policies.iter(), now());

        assert_eq!(summary.total, 5);
        assert_eq!(summary.no_policy, 1);
        assert_eq!(summary.ok, 1);
        assert_eq!(summary.due_soon, 1);
        assert_eq!(summary.overdue, 2);
    }

    #[test]
    fn test_status_tags_roundtrip() {
        for status in RotationStatus::ALL {
            assert_eq!(status.as_str().parse::<RotationStatus>().unwrap(), *status);
        }
        assert!("stale".parse::<RotationStatus>().unwrap_err().is_validation());
    }

    #[test]
    fn test_out_of_range_interval_does_not_panic() {
        for interval in [i64::MAX, i64::MAX / 2, 10_000_000_000_000] {
            let policy = rotated_days_ago(interval, 3);
            assert_eq!(policy.status(now()), RotationStatus::Ok);
            assert_eq!(policy.days_until_rotation(now()), Some(interval - 3));
        }
        let policy = RotationPolicy::new(Some(i64::MIN), Some(now()));
        assert_eq!(policy.status(now()), RotationStatus::Ok);
        assert_eq!(policy.days_until_rotation(now()), Some(i64::MIN));
    }
}
