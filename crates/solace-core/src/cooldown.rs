//! Minimum spacing between outbound calls, independent of all other limits.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Enforces a minimum delay between consecutive API calls.
#[derive(Debug)]
pub struct CooldownManager {
    min_delay: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl CooldownManager {
    /// Default spacing: 1 second between calls.
    pub fn new() -> Self {
        Self::with_min_delay(Duration::from_millis(1000))
    }

    pub fn with_min_delay(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_call: Mutex::new(None),
        }
    }

    /// Sleep until the spacing requirement is satisfied, then claim the slot.
    pub async fn wait_if_needed(&self) {
        let wait = {
            let last = self.last_call.lock().unwrap_or_else(|e| e.into_inner());
            match *last {
                Some(at) => self.min_delay.saturating_sub(at.elapsed()),
                None => Duration::ZERO,
            }
        };
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "cooldown: spacing outbound call");
            tokio::time::sleep(wait).await;
        }
        self.record_call();
    }

    /// Mark now as the most recent outbound call.
    pub fn record_call(&self) {
        let mut last = self.last_call.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(Instant::now());
    }

    /// Time since the last recorded call, or `None` if none was made.
    pub fn time_since_last_call(&self) -> Option<Duration> {
        let last = self.last_call.lock().unwrap_or_else(|e| e.into_inner());
        last.map(|at| at.elapsed())
    }

    /// Forget the last call; the next `wait_if_needed` proceeds immediately.
    pub fn reset(&self) {
        let mut last = self.last_call.lock().unwrap_or_else(|e| e.into_inner());
        *last = None;
    }
}

impl Default for CooldownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_is_immediate() {
        let cooldown = CooldownManager::with_min_delay(Duration::from_secs(5));
        let start = Instant::now();
        cooldown.wait_if_needed().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn second_call_waits_out_the_spacing() {
        let cooldown = CooldownManager::with_min_delay(Duration::from_millis(1000));
        cooldown.record_call();
        let start = tokio::time::Instant::now();
        cooldown.wait_if_needed().await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn reset_clears_the_spacing_requirement() {
        let cooldown = CooldownManager::with_min_delay(Duration::from_secs(5));
        cooldown.record_call();
        cooldown.reset();
        assert!(cooldown.time_since_last_call().is_none());
        let start = Instant::now();
        cooldown.wait_if_needed().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
