//! Sliding-window rate-limit tracking: RPM, TPM, and RPD.
//!
//! Windows are recomputed on every read by discarding entries older than 60
//! seconds. The daily counter resets when the clock crosses midnight in the
//! provider reference timezone. There is no server-side coordination; all
//! accounting is client-side and may optionally be persisted to a JSON file
//! so counters survive a restart (the original kept them in session storage).

use crate::config::{ms_until_daily_reset, reference_day, RateLimits};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

const WINDOW_MS: i64 = 60_000;

/// One recorded token spend inside the TPM window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenSpend {
    pub timestamp: i64,
    pub tokens: u32,
}

/// Raw usage counters, serializable for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitUsage {
    pub rpm_timestamps: Vec<i64>,
    pub tpm_history: Vec<TokenSpend>,
    pub daily_requests: u32,
    pub last_reset_time: i64,
}

impl RateLimitUsage {
    fn fresh(now_ms: i64) -> Self {
        Self {
            rpm_timestamps: Vec::new(),
            tpm_history: Vec::new(),
            daily_requests: 0,
            last_reset_time: now_ms,
        }
    }
}

/// Usage vs. limit for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
}

/// Full tracker state at one instant.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitState {
    pub rpm: WindowUsage,
    pub tpm: WindowUsage,
    pub rpd: WindowUsage,
    pub ms_until_reset: i64,
    pub is_limited: bool,
}

/// Sliding-window counters against provider-advertised limits.
#[derive(Debug)]
pub struct RateLimitTracker {
    limits: RateLimits,
    usage: RateLimitUsage,
    persist_path: Option<PathBuf>,
}

impl RateLimitTracker {
    /// In-memory tracker.
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            usage: RateLimitUsage::fresh(now_ms()),
            persist_path: None,
        }
    }

    /// Tracker backed by a JSON file. Stale window entries are pruned on load;
    /// data older than a day is discarded outright.
    pub fn with_persistence(limits: RateLimits, path: PathBuf) -> Self {
        let now = now_ms();
        let usage = match load_usage(&path, now) {
            Some(u) => u,
            None => RateLimitUsage::fresh(now),
        };
        Self {
            limits,
            usage,
            persist_path: Some(path),
        }
    }

    /// Current state; prunes expired entries and applies the daily reset first.
    pub fn calculate_state(&mut self) -> RateLimitState {
        self.state_at(now_ms())
    }

    fn state_at(&mut self, now: i64) -> RateLimitState {
        self.prune(now);

        let rpm_used = self.usage.rpm_timestamps.len() as u32;
        let tpm_used: u32 = self.usage.tpm_history.iter().map(|e| e.tokens).sum();
        let rpd_used = self.usage.daily_requests;

        let rpm = window(rpm_used, self.limits.rpm);
        let tpm = window(tpm_used, self.limits.tpm);
        let rpd = window(rpd_used, self.limits.rpd);
        let is_limited = rpm.remaining == 0 || tpm.remaining == 0 || rpd.remaining == 0;

        RateLimitState {
            rpm,
            tpm,
            rpd,
            ms_until_reset: ms_until_daily_reset(now),
            is_limited,
        }
    }

    /// Record one outbound request and its estimated token cost. Returns false
    /// (recording nothing) when any window is already exhausted.
    pub fn record_request(&mut self, estimated_tokens: u32) -> bool {
        self.record_request_at(estimated_tokens, now_ms())
    }

    fn record_request_at(&mut self, estimated_tokens: u32, now: i64) -> bool {
        if self.state_at(now).is_limited {
            return false;
        }
        self.usage.rpm_timestamps.push(now);
        self.usage.tpm_history.push(TokenSpend {
            timestamp: now,
            tokens: estimated_tokens,
        });
        self.usage.daily_requests += 1;
        self.save();
        debug!(
            rpm_used = self.usage.rpm_timestamps.len(),
            daily = self.usage.daily_requests,
            tokens = estimated_tokens,
            "recorded request against rate limits"
        );
        true
    }

    /// Clear all counters back to the documented initial state.
    pub fn reset(&mut self) {
        self.usage = RateLimitUsage::fresh(now_ms());
        self.save();
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Discard window entries older than 60s; clear everything when the clock
    /// has crossed the reference-timezone midnight since the last reset.
    fn prune(&mut self, now: i64) {
        if reference_day(now) != reference_day(self.usage.last_reset_time) {
            self.usage = RateLimitUsage::fresh(now);
            self.save();
        }
        self.usage.rpm_timestamps.retain(|ts| now - ts < WINDOW_MS);
        self.usage.tpm_history.retain(|e| now - e.timestamp < WINDOW_MS);
    }

    fn save(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        match serde_json::to_vec(&self.usage) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    warn!(path = %path.display(), error = %e, "failed to persist rate-limit usage");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize rate-limit usage"),
        }
    }
}

fn window(used: u32, limit: u32) -> WindowUsage {
    WindowUsage {
        used,
        limit,
        remaining: limit.saturating_sub(used),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn load_usage(path: &PathBuf, now: i64) -> Option<RateLimitUsage> {
    let bytes = std::fs::read(path).ok()?;
    let mut usage: RateLimitUsage = match serde_json::from_slice(&bytes) {
        Ok(u) => u,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding unreadable usage file");
            return None;
        }
    };
    // Daily boundary crossed, or data a full day old: start over.
    if reference_day(now) != reference_day(usage.last_reset_time)
        || now - usage.last_reset_time > 24 * 60 * 60 * 1000
    {
        return None;
    }
    usage.rpm_timestamps.retain(|ts| now - ts < WINDOW_MS);
    usage.tpm_history.retain(|e| now - e.timestamp < WINDOW_MS);
    Some(usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: RateLimits = RateLimits {
        rpm: 10,
        tpm: 250_000,
        rpd: 20,
    };

    #[test]
    fn retained_timestamps_are_inside_the_window() {
        let mut tracker = RateLimitTracker::new(LIMITS);
        let t0 = now_ms();
        tracker.usage.rpm_timestamps = vec![t0 - 70_000, t0 - 59_000, t0 - 1_000];
        tracker.usage.tpm_history = vec![
            TokenSpend { timestamp: t0 - 61_000, tokens: 100 },
            TokenSpend { timestamp: t0 - 5_000, tokens: 200 },
        ];
        let state = tracker.state_at(t0);
        assert_eq!(state.rpm.used, 2);
        assert_eq!(state.tpm.used, 200);
        for ts in &tracker.usage.rpm_timestamps {
            assert!(t0 - ts < WINDOW_MS);
        }
    }

    #[test]
    fn record_request_consumes_all_three_windows() {
        let mut tracker = RateLimitTracker::new(LIMITS);
        let t0 = now_ms();
        assert!(tracker.record_request_at(1_000, t0));
        let state = tracker.state_at(t0);
        assert_eq!(state.rpm.used, 1);
        assert_eq!(state.tpm.used, 1_000);
        assert_eq!(state.rpd.used, 1);
        assert!(!state.is_limited);
    }

    #[test]
    fn exhausted_rpm_blocks_recording() {
        let mut tracker = RateLimitTracker::new(RateLimits { rpm: 2, tpm: 250_000, rpd: 20 });
        let t0 = now_ms();
        assert!(tracker.record_request_at(10, t0));
        assert!(tracker.record_request_at(10, t0));
        assert!(!tracker.record_request_at(10, t0));
        // RPD only advanced for the accepted requests.
        assert_eq!(tracker.state_at(t0).rpd.used, 2);
    }

    #[test]
    fn rpm_window_slides() {
        let mut tracker = RateLimitTracker::new(RateLimits { rpm: 1, tpm: 250_000, rpd: 20 });
        let t0 = now_ms();
        assert!(tracker.record_request_at(10, t0));
        assert!(!tracker.record_request_at(10, t0 + 1_000));
        assert!(tracker.record_request_at(10, t0 + 61_000));
    }

    #[test]
    fn daily_boundary_clears_all_counters() {
        let mut tracker = RateLimitTracker::new(LIMITS);
        // Pin the last reset to a known reference-tz day, then cross midnight.
        let day_start = 1_705_305_600_000; // 2024-01-15 00:00 UTC-8
        tracker.usage.last_reset_time = day_start + 1_000;
        tracker.usage.daily_requests = 15;
        tracker.usage.rpm_timestamps = vec![day_start + 1_000];
        let next_day = day_start + 24 * 60 * 60 * 1000 + 5_000;
        let state = tracker.state_at(next_day);
        assert_eq!(state.rpd.used, 0);
        assert_eq!(state.rpm.used, 0);
        assert_eq!(state.tpm.used, 0);
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        {
            let mut tracker = RateLimitTracker::with_persistence(LIMITS, path.clone());
            assert!(tracker.record_request(500));
        }
        let mut reloaded = RateLimitTracker::with_persistence(LIMITS, path);
        let state = reloaded.calculate_state();
        assert_eq!(state.rpd.used, 1);
        assert_eq!(state.tpm.used, 500);
    }

    #[test]
    fn corrupt_usage_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        std::fs::write(&path, b"not json").unwrap();
        let mut tracker = RateLimitTracker::with_persistence(LIMITS, path);
        assert_eq!(tracker.calculate_state().rpd.used, 0);
    }
}
