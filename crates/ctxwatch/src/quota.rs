//! Rolling quota windows.
//!
//! Token consumption across all sessions is bounded by a rolling window
//! (5 hours by default). Windows are anchored at first use: the first usage
//! after the previous window ended opens a new window starting at that
//! usage's timestamp, not at a calendar boundary.
//!
//! ```text
//! T0            T0+5h          T1 (first use after expiry)   T1+5h
//! |--- window 1 ---)            |--------- window 2 ---------)
//! ```
//!
//! Windows are never deleted. Once a newer window opens (or a query's `now`
//! passes its end) a window is marked [`WindowStatus::Expired`] and becomes
//! read-only history.

use std::collections::BTreeSet;
use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::QuotaConfig;
use crate::error::{Result, TrackerError};

/// Lifecycle state of a quota window.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Active,
    Expired,
}

/// Result of charging tokens to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaCharge {
    /// The window after the charge.
    pub window: QuotaWindow,
    /// The charge opened this window.
    pub opened: bool,
}

/// One rolling accounting period.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QuotaWindow {
    pub start: DateTime<Utc>,
    /// Exclusive end: `start + window length`.
    pub end: DateTime<Utc>,
    pub tokens_used: u64,
    /// Sessions that contributed to this window.
    pub sessions: BTreeSet<String>,
    pub status: WindowStatus,
}

impl QuotaWindow {
    fn open(start: DateTime<Utc>, length: TimeDelta) -> Self {
        Self {
            start,
            end: start + length,
            tokens_used: 0,
            sessions: BTreeSet::new(),
            status: WindowStatus::Active,
        }
    }

    /// Whether `t` falls in `[start, end)`.
    pub fn covers(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// Point-in-time view of the quota, for presentation layers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QuotaStatus {
    pub limit: u64,
    pub used: u64,
    /// `limit - used`, never below zero.
    pub remaining: u64,
    /// True when more than `limit` tokens were recorded in the window.
    pub over_budget: bool,
    /// Usage as a fraction of the limit (may exceed 1.0 when over budget).
    pub percent_used: f64,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    #[serde(rename = "time_until_reset_secs", with = "delta_secs")]
    pub time_until_reset: TimeDelta,
}

/// Serialize a [`TimeDelta`] as whole seconds.
mod delta_secs {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &TimeDelta, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<TimeDelta, D::Error> {
        let secs = i64::deserialize(d)?;
        Ok(TimeDelta::try_seconds(secs).unwrap_or_else(TimeDelta::zero))
    }
}

impl QuotaStatus {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "quota: {} / {} tokens ({:.0}%), resets in {}m",
            self.used,
            self.limit,
            self.percent_used * 100.0,
            self.time_until_reset.num_minutes(),
        )
    }
}

/// Tracks rolling quota windows shared by every session.
///
/// All mutation happens under one mutex so concurrent writers (a session's
/// log watcher and a periodic poller, or several sessions) never lose
/// increments. Queries take the same lock briefly and never fail.
#[derive(Debug)]
pub struct QuotaTracker {
    config: QuotaConfig,
    windows: Mutex<Vec<QuotaWindow>>,
}

impl QuotaTracker {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild a tracker from persisted window history.
    pub fn with_history(config: QuotaConfig, mut history: Vec<QuotaWindow>) -> Self {
        history.sort_by_key(|w| w.start);
        Self {
            config,
            windows: Mutex::new(history),
        }
    }

    /// Configured token limit per window.
    pub fn limit(&self) -> u64 {
        self.config.limit
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<QuotaWindow>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Charge `tokens` to the window covering `timestamp`, opening a new
    /// window when none does.
    ///
    /// Returns a copy of the window after the update. Events older than the
    /// latest window's start, or inside a window that already expired, are
    /// rejected with [`TrackerError::StaleEvent`] and never applied.
    pub fn record_usage(
        &self,
        session_id: &str,
        tokens: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<QuotaWindow> {
        self.charge(session_id, tokens, timestamp).map(|c| c.window)
    }

    /// Like [`record_usage`](Self::record_usage), also reporting whether
    /// the charge opened a new window.
    pub fn charge(
        &self,
        session_id: &str,
        tokens: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<QuotaCharge> {
        if tokens < 0 {
            return Err(TrackerError::InvalidInput(format!(
                "token count must be non-negative, got {tokens}"
            )));
        }
        let tokens = tokens as u64;
        let length = self.config.window();

        let mut windows = self.lock();
        let needs_new_window = match windows.last_mut() {
            Some(latest) if timestamp < latest.start => {
                let boundary = latest.start;
                warn!("Dropping stale quota event from {session_id}: {timestamp} < window start {boundary}");
                return Err(TrackerError::StaleEvent {
                    session_id: session_id.to_string(),
                    timestamp,
                    boundary,
                });
            }
            Some(latest) if latest.covers(timestamp) => {
                if latest.status == WindowStatus::Expired {
                    let boundary = latest.end;
                    warn!("Dropping quota event from {session_id} inside expired window ending {boundary}");
                    return Err(TrackerError::StaleEvent {
                        session_id: session_id.to_string(),
                        timestamp,
                        boundary,
                    });
                }
                false
            }
            Some(latest) => {
                latest.status = WindowStatus::Expired;
                true
            }
            None => true,
        };

        if needs_new_window {
            debug!("Opening quota window at {timestamp} for {length}");
            windows.push(QuotaWindow::open(timestamp, length));
        }

        // Non-empty: the latest window either covered the event or was just opened.
        let idx = windows.len() - 1;
        let window = &mut windows[idx];
        window.tokens_used = window.tokens_used.saturating_add(tokens);
        window.sessions.insert(session_id.to_string());
        Ok(QuotaCharge {
            window: window.clone(),
            opened: needs_new_window,
        })
    }

    /// Mark every window whose end is at or before `now` as expired.
    pub fn expire_elapsed(&self, now: DateTime<Utc>) {
        let mut windows = self.lock();
        for w in windows.iter_mut() {
            if w.status == WindowStatus::Active && w.end <= now {
                debug!("Quota window {} .. {} expired", w.start, w.end);
                w.status = WindowStatus::Expired;
            }
        }
    }

    /// The window whose `[start, end)` interval contains `now`.
    pub fn current_window(&self, now: DateTime<Utc>) -> Option<QuotaWindow> {
        self.expire_elapsed(now);
        self.lock().iter().rev().find(|w| w.covers(now)).cloned()
    }

    /// Tokens left in the window covering `now`, or the full limit when no
    /// window is active. Saturates at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> u64 {
        match self.current_window(now) {
            Some(w) => self.config.limit.saturating_sub(w.tokens_used),
            None => self.config.limit,
        }
    }

    /// Time until the window covering `now` ends, or zero.
    pub fn time_until_reset(&self, now: DateTime<Utc>) -> TimeDelta {
        match self.current_window(now) {
            Some(w) => w.end - now,
            None => TimeDelta::zero(),
        }
    }

    /// Full status snapshot at `now`.
    pub fn status(&self, now: DateTime<Utc>) -> QuotaStatus {
        let limit = self.config.limit;
        match self.current_window(now) {
            Some(w) => QuotaStatus {
                limit,
                used: w.tokens_used,
                remaining: limit.saturating_sub(w.tokens_used),
                over_budget: w.tokens_used > limit,
                percent_used: w.tokens_used as f64 / limit as f64,
                window_start: Some(w.start),
                window_end: Some(w.end),
                time_until_reset: w.end - now,
            },
            None => QuotaStatus {
                limit,
                used: 0,
                remaining: limit,
                over_budget: false,
                percent_used: 0.0,
                window_start: None,
                window_end: None,
                time_until_reset: TimeDelta::zero(),
            },
        }
    }

    /// Copy of every window, oldest first.
    pub fn history(&self) -> Vec<QuotaWindow> {
        self.lock().clone()
    }

    /// Replace the window history with a checkpointed one.
    pub fn restore(&self, mut history: Vec<QuotaWindow>) {
        history.sort_by_key(|w| w.start);
        *self.lock() = history;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn tracker() -> QuotaTracker {
        QuotaTracker::new(QuotaConfig::default())
    }

    #[test]
    fn empty_tracker_has_full_quota() {
        let q = tracker();
        assert!(q.current_window(t0()).is_none());
        assert_eq!(q.remaining(t0()), 1_000_000);
        assert_eq!(q.time_until_reset(t0()), TimeDelta::zero());
    }

    #[test]
    fn usage_accumulates_and_new_window_opens_at_end() {
        let q = tracker();
        q.record_usage("s1", 400_000, t0()).unwrap();
        q.record_usage("s1", 400_000, t0() + TimeDelta::hours(1)).unwrap();
        assert_eq!(q.remaining(t0() + TimeDelta::hours(2)), 200_000);

        q.record_usage("s1", 1, t0() + TimeDelta::hours(5)).unwrap();
        assert_eq!(q.remaining(t0() + TimeDelta::hours(5)), 999_999);

        let history = q.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, WindowStatus::Expired);
        assert_eq!(history[0].tokens_used, 800_000);
        assert_eq!(history[1].start, t0() + TimeDelta::hours(5));
    }

    #[test]
    fn event_one_nanosecond_before_end_stays_in_window() {
        let q = tracker();
        q.record_usage("s1", 10, t0()).unwrap();
        let end = t0() + TimeDelta::hours(5);
        let w = q.record_usage("s1", 5, end - TimeDelta::nanoseconds(1)).unwrap();
        assert_eq!(w.start, t0());
        assert_eq!(w.tokens_used, 15);
        assert_eq!(q.history().len(), 1);
    }

    #[test]
    fn negative_tokens_rejected_without_effect() {
        let q = tracker();
        let err = q.record_usage("s1", -1, t0()).unwrap_err();
        assert!(matches!(err, TrackerError::InvalidInput(_)));
        assert!(q.history().is_empty());
    }

    #[test]
    fn events_before_window_start_are_stale() {
        let q = tracker();
        q.record_usage("s1", 100, t0()).unwrap();
        let err = q
            .record_usage("s2", 100, t0() - TimeDelta::minutes(1))
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(q.remaining(t0()), 999_900);
    }

    #[test]
    fn late_event_inside_expired_window_is_stale() {
        let q = tracker();
        q.record_usage("s1", 100, t0()).unwrap();
        // Query past the end expires the window.
        assert_eq!(q.remaining(t0() + TimeDelta::hours(6)), 1_000_000);
        let err = q
            .record_usage("s1", 100, t0() + TimeDelta::hours(4))
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(q.history()[0].tokens_used, 100);
    }

    #[test]
    fn remaining_never_negative_when_over_budget() {
        let q = QuotaTracker::new(QuotaConfig {
            limit: 1_000,
            ..Default::default()
        });
        q.record_usage("s1", 1_500, t0()).unwrap();
        assert_eq!(q.remaining(t0()), 0);
        let status = q.status(t0());
        assert!(status.over_budget);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.used, 1_500);
    }

    #[test]
    fn time_until_reset_counts_down() {
        let q = tracker();
        q.record_usage("s1", 1, t0()).unwrap();
        assert_eq!(
            q.time_until_reset(t0() + TimeDelta::hours(2)),
            TimeDelta::hours(3)
        );
    }

    #[test]
    fn sessions_share_the_active_window() {
        let q = tracker();
        q.record_usage("s1", 10, t0()).unwrap();
        let w = q.record_usage("s2", 20, t0() + TimeDelta::minutes(3)).unwrap();
        assert_eq!(w.tokens_used, 30);
        assert!(w.sessions.contains("s1"));
        assert!(w.sessions.contains("s2"));
    }

    #[test]
    fn concurrent_writers_lose_no_increments() {
        let q = Arc::new(tracker());
        q.record_usage("seed", 0, t0()).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        q.record_usage(&format!("s{i}"), 3, t0() + TimeDelta::seconds(1))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.status(t0() + TimeDelta::seconds(2)).used, 8 * 1_000 * 3);
    }

    #[test]
    fn history_restores_in_order() {
        let q = tracker();
        q.record_usage("s1", 5, t0()).unwrap();
        q.record_usage("s1", 7, t0() + TimeDelta::hours(6)).unwrap();
        let mut history = q.history();
        history.reverse();

        let restored = QuotaTracker::with_history(QuotaConfig::default(), history);
        assert_eq!(restored.remaining(t0() + TimeDelta::hours(7)), 999_993);
        assert_eq!(restored.history()[0].start, t0());
    }

    #[test]
    fn status_serializes_reset_as_seconds() {
        let q = tracker();
        q.record_usage("s1", 1, t0()).unwrap();
        let status = q.status(t0() + TimeDelta::hours(4));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["time_until_reset_secs"], 3600);
        let back: QuotaStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn status_log_string() {
        let q = tracker();
        q.record_usage("s1", 250_000, t0()).unwrap();
        let log = q.status(t0()).to_log_string();
        assert!(log.contains("250000 / 1000000"));
        assert!(log.contains("25%"));
    }
}
