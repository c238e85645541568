//! Reconnection backoff policy.

use crate::config::ReconnectConfig;
use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

struct ReconnectState {
    attempts: u32,
    current_delay: Duration,
}

/// Exponential backoff with jitter, capped at a maximum delay.
///
/// `delay = min(initial * multiplier^(attempt-1), max) + uniform(0, 0.25) * delay`
pub struct Reconnector {
    config: ReconnectConfig,
    state: Mutex<ReconnectState>,
}

impl Reconnector {
    pub fn new(config: ReconnectConfig) -> Self {
        let initial = config.initial_delay();
        Self {
            config,
            state: Mutex::new(ReconnectState {
                attempts: 0,
                current_delay: initial,
            }),
        }
    }

    /// The delay to sleep before the next attempt, or `None` once the
    /// attempt cap is exhausted.
    pub fn next_delay(&self) -> Option<Duration> {
        let mut state = self.state.lock().expect("reconnector state poisoned");
        state.attempts += 1;

        if self.config.max_attempts > 0 && state.attempts > self.config.max_attempts {
            warn!(
                attempts = state.attempts,
                max_attempts = self.config.max_attempts,
                "max reconnection attempts exceeded"
            );
            return None;
        }

        let base = (self.config.initial_delay().as_secs_f64()
            * self.config.multiplier.powi(state.attempts as i32 - 1))
        .min(self.config.max_delay().as_secs_f64());

        let jitter = base * 0.25 * rand::thread_rng().gen::<f64>();
        let delay = Duration::from_secs_f64(base + jitter);

        state.current_delay = delay;
        debug!(attempt = state.attempts, delay_ms = delay.as_millis() as u64, "calculated reconnect delay");
        Some(delay)
    }

    /// Called after a successful connect.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("reconnector state poisoned");
        state.attempts = 0;
        state.current_delay = self.config.initial_delay();
        debug!("reconnector reset");
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().expect("reconnector state poisoned").attempts
    }

    pub fn current_delay(&self) -> Duration {
        self.state
            .lock()
            .expect("reconnector state poisoned")
            .current_delay
    }

    pub fn should_retry(&self) -> bool {
        if self.config.max_attempts == 0 {
            return true;
        }
        self.attempts() < self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            enabled: true,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[test]
    fn delays_grow_within_jitter_bounds_and_cap() {
        let reconnector = Reconnector::new(config(0));

        // Base values 1s, 2s, 4s, 8s, then capped at 10s; jitter adds up
        // to 25% of the (capped) base.
        let expected_base = [1.0, 2.0, 4.0, 8.0, 10.0, 10.0, 10.0];
        for base in expected_base {
            let delay = reconnector.next_delay().unwrap().as_secs_f64();
            assert!(
                delay >= base && delay <= base * 1.25 + 1e-9,
                "delay {delay} outside [{base}, {}]",
                base * 1.25
            );
        }

        reconnector.reset();
        let delay = reconnector.next_delay().unwrap().as_secs_f64();
        assert!((1.0..=1.25).contains(&delay));
        assert_eq!(reconnector.attempts(), 1);
    }

    #[test]
    fn stops_after_max_attempts() {
        let reconnector = Reconnector::new(config(3));
        for _ in 0..3 {
            assert!(reconnector.next_delay().is_some());
        }
        // The k+1-th call returns the stop sentinel.
        assert!(reconnector.next_delay().is_none());
        assert!(!reconnector.should_retry());

        reconnector.reset();
        assert!(reconnector.next_delay().is_some());
    }

    #[test]
    fn unlimited_attempts_never_stop() {
        let reconnector = Reconnector::new(config(0));
        for _ in 0..50 {
            assert!(reconnector.next_delay().is_some());
        }
        assert!(reconnector.should_retry());
    }
}
