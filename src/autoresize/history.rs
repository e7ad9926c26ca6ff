//! Bounded, time-ordered resize history

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::crd::ResizeEvent;

/// Retained history entries beyond which pruning starts evicting early.
///
/// Quota-consuming entries inside the window are never evicted, so the
/// history can exceed this on clusters with many members.
pub const MAX_HISTORY_ENTRIES: usize = 50;

/// Retention added on top of the largest rate-limit window
pub const RETENTION_MARGIN: Duration = Duration::from_secs(3_600);

/// Append `event` and prune what no window can still count.
///
/// The event's timestamp is raised to the newest recorded one if the clock
/// went backwards, so the sequence stays ordered by `requested_at`.
pub fn append(
    history: &mut Vec<ResizeEvent>,
    mut event: ResizeEvent,
    window: Duration,
    now: DateTime<Utc>,
) {
    if let Some(last) = history.last() {
        if event.requested_at < last.requested_at {
            event.requested_at = last.requested_at;
        }
    }
    history.push(event);
    prune(history, window, now);
}

/// Drop entries older than `window` plus the retention margin, then shrink
/// towards the cap.
///
/// Over the cap, entries outside the window go first, then in-window entries
/// that do not count toward any quota, oldest first in both passes.
pub fn prune(history: &mut Vec<ResizeEvent>, window: Duration, now: DateTime<Utc>) {
    let retention = ChronoDuration::from_std(window + RETENTION_MARGIN).unwrap_or(ChronoDuration::MAX);
    if let Some(cutoff) = now.checked_sub_signed(retention) {
        history.retain(|e| e.requested_at > cutoff);
    }
    if history.len() <= MAX_HISTORY_ENTRIES {
        return;
    }

    let mut excess = history.len() - MAX_HISTORY_ENTRIES;
    let window_start = ChronoDuration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    evict_oldest(history, &mut excess, |e| e.requested_at < window_start);
    evict_oldest(history, &mut excess, |e| !e.outcome.counts_toward_quota());
}

fn evict_oldest(
    history: &mut Vec<ResizeEvent>,
    excess: &mut usize,
    evictable: impl Fn(&ResizeEvent) -> bool,
) {
    history.retain(|e| {
        if *excess > 0 && evictable(e) {
            *excess -= 1;
            false
        } else {
            true
        }
    });
}

/// Whether an event carrying `id` was already recorded
pub fn contains(history: &[ResizeEvent], id: &str) -> bool {
    history.iter().any(|e| e.id == id)
}
