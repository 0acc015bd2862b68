//! Automatic check timing

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::updater::UpdaterState;

/// Whether the scheduler should start a check now.
///
/// Only an idle updater with automatic checks enabled is ever checked, and
/// only once `interval` has passed since the last check.
pub fn should_check(
    now: DateTime<Utc>,
    last_check: Option<DateTime<Utc>>,
    state: UpdaterState,
    enabled: bool,
    interval: Duration,
) -> bool {
    if !enabled || state != UpdaterState::Idle {
        return false;
    }
    match last_check {
        None => true,
        Some(last) => elapsed(now, last) >= interval,
    }
}

/// How long to sleep before the next check is due
pub fn next_delay(now: DateTime<Utc>, last_check: Option<DateTime<Utc>>, interval: Duration) -> Duration {
    match last_check {
        None => Duration::ZERO,
        Some(last) => interval.saturating_sub(elapsed(now, last)),
    }
}

/// Time since `last`; a timestamp in the future counts as just now
fn elapsed(now: DateTime<Utc>, last: DateTime<Utc>) -> Duration {
    (now - last).to_std().unwrap_or(Duration::ZERO)
}
