use chrono::{DateTime, Utc};

use crate::config::StalenessConfig;
use crate::models::Staleness;

/// Classify an agent's freshness from its last heartbeat timestamp.
///
/// Bounds are inclusive on the lower edge: an age exactly at
/// `fresh_threshold_secs` is already `Stale`, and an age exactly at
/// `stale_threshold_secs` is already `Disconnected`. This mirrors the
/// daemon-side reconciliation query, which compares on `>=`.
pub fn compute_staleness(now: DateTime<Utc>, last_heartbeat: DateTime<Utc>, config: &StalenessConfig) -> Staleness {
    let age_secs = now.signed_duration_since(last_heartbeat).num_seconds().max(0);

    if age_secs < config.fresh_threshold_secs as i64 {
        Staleness::Fresh
    } else if age_secs < config.stale_threshold_secs as i64 {
        Staleness::Stale
    } else {
        Staleness::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn config() -> StalenessConfig {
        StalenessConfig::default()
    }

    #[test]
    fn fresh_just_under_threshold() {
        let now = Utc::now();
        let last = now - Duration::seconds(14);
        assert_eq!(compute_staleness(now, last, &config()), Staleness::Fresh);
    }

    #[test]
    fn stale_at_lower_bound() {
        let now = Utc::now();
        let last = now - Duration::seconds(15);
        assert_eq!(compute_staleness(now, last, &config()), Staleness::Stale);
    }

    #[test]
    fn stale_just_under_disconnected() {
        let now = Utc::now();
        let last = now - Duration::seconds(89);
        assert_eq!(compute_staleness(now, last, &config()), Staleness::Stale);
    }

    #[test]
    fn disconnected_at_lower_bound() {
        let now = Utc::now();
        let last = now - Duration::seconds(90);
        assert_eq!(compute_staleness(now, last, &config()), Staleness::Disconnected);
    }

    #[test]
    fn clock_skew_future_heartbeat_treated_as_fresh() {
        let now = Utc::now();
        let last = now + Duration::seconds(5);
        assert_eq!(compute_staleness(now, last, &config()), Staleness::Fresh);
    }
}
