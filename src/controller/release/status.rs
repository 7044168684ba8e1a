use crate::crd::release::{Phase, ReleaseStatus};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Longest the driving loop sleeps before re-checking a waiting release
pub const MAX_REQUEUE: Duration = Duration::from_secs(300);

/// Shortest timed requeue for a waiting release
pub const MIN_REQUEUE: Duration = Duration::from_secs(1);

/// Parse an RFC3339 status timestamp
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Time elapsed since an RFC3339 timestamp
///
/// Returns None when the timestamp is missing or malformed. A timestamp in the
/// future (clock skew between writers) counts as zero elapsed.
pub fn elapsed_since(ts: Option<&str>, now: DateTime<Utc>) -> Option<Duration> {
    let then = parse_timestamp(ts?)?;
    Some((now - then).to_std().unwrap_or(Duration::ZERO))
}

/// Whether the current step is due for an analysis run
///
/// Analysis runs immediately on entering Analyzing, then at most once per
/// interval while the phase holds.
pub fn analysis_due(status: &ReleaseStatus, interval: Duration, now: DateTime<Utc>) -> bool {
    let last_analysis = match status.last_analysis_time.as_deref().and_then(parse_timestamp) {
        Some(t) => t,
        None => return true,
    };

    let entered = status
        .last_transition_time
        .as_deref()
        .and_then(parse_timestamp);
    if entered.is_some_and(|entered| entered > last_analysis) {
        return true;
    }

    (now - last_analysis)
        .to_std()
        .map_or(false, |elapsed| elapsed >= interval)
}

/// Delay until the release has work due
///
/// `None` means no timed wakeup: the release is terminal, parked for a
/// manual command, or its interval is unknown.
pub fn next_wakeup(
    status: &ReleaseStatus,
    interval: Option<Duration>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    match status.phase {
        Phase::Pending | Phase::Promoting | Phase::Failing => Some(Duration::ZERO),
        Phase::Progressing => {
            let interval = interval?;
            let elapsed = elapsed_since(status.last_transition_time.as_deref(), now)
                .unwrap_or(interval);
            Some(clamp_requeue(interval.saturating_sub(elapsed)))
        }
        Phase::Analyzing => {
            let interval = interval?;
            if analysis_due(status, interval, now) {
                return Some(Duration::ZERO);
            }
            let elapsed = elapsed_since(status.last_analysis_time.as_deref(), now)
                .unwrap_or(interval);
            Some(clamp_requeue(interval.saturating_sub(elapsed)))
        }
        Phase::Paused
        | Phase::Succeeded
        | Phase::Failed
        | Phase::RolledBack
        | Phase::Aborted => None,
    }
}

fn clamp_requeue(remaining: Duration) -> Duration {
    if remaining.is_zero() {
        return Duration::ZERO;
    }
    remaining.clamp(MIN_REQUEUE, MAX_REQUEUE)
}
