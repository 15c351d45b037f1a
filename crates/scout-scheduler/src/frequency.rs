//! Tracking frequency policy.
//!
//! A profile's tier decides how long after a dispatch it becomes due again.

use chrono::{DateTime, Duration, Utc};

use scout_store::TrackingFrequency;

/// Time between dispatches for a tier.
pub fn interval(frequency: TrackingFrequency) -> Duration {
    match frequency {
        TrackingFrequency::Hourly => Duration::hours(1),
        TrackingFrequency::Daily => Duration::days(1),
        TrackingFrequency::Weekly => Duration::weeks(1),
    }
}

/// When a profile dispatched at `now` becomes due again.
pub fn next_run(frequency: TrackingFrequency, now: DateTime<Utc>) -> DateTime<Utc> {
    now + interval(frequency)
}

/// Like [`next_run`] for a stored label. Unknown labels are treated as daily.
pub fn next_run_for_label(label: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    next_run(TrackingFrequency::from_label(label).unwrap_or_default(), now)
}
