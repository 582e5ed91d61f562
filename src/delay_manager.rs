use std::thread;
use std::time::Duration;

use log::debug;

/// Fixed, non-adaptive pacing. Each worker applies it to its own requests;
/// nothing here is shared between workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayPolicy {
    /// Slept before every request.
    pub request_delay: Duration,
    /// Slept after a 429 before asking again.
    pub rate_limit_cooldown: Duration,
    /// 429 responses tolerated for one fetch before giving up.
    pub max_rate_limit_retries: u32,
    /// Full fetch+parse attempts per job.
    pub max_attempts: u32,
    /// Wait after the first failed attempt; doubles each time.
    pub initial_backoff: Duration,
}

impl Default for DelayPolicy {
    fn default() -> Self {
        DelayPolicy {
            request_delay: Duration::from_millis(700),
            rate_limit_cooldown: Duration::from_secs(5),
            max_rate_limit_retries: 3,
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl DelayPolicy {
    /// No waiting at all, for tests and dry runs.
    pub fn immediate() -> Self {
        DelayPolicy {
            request_delay: Duration::ZERO,
            rate_limit_cooldown: Duration::ZERO,
            initial_backoff: Duration::ZERO,
            ..DelayPolicy::default()
        }
    }

    /// Backoff after failed attempt `attempt` (1-based): 1s, 2s, 4s, ...
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << exp)
    }
}

pub fn request_delay(policy: &DelayPolicy) {
    pause(policy.request_delay, "request");
}

pub fn rate_limit_cooldown(policy: &DelayPolicy) {
    pause(policy.rate_limit_cooldown, "rate limit cooldown");
}

pub fn retry_backoff(policy: &DelayPolicy, attempt: u32) {
    pause(policy.backoff_for(attempt), "retry backoff");
}

fn pause(duration: Duration, reason: &str) {
    if duration.is_zero() {
        return;
    }
    debug!("Waiting for {:?} ({})", duration, reason);
    thread::sleep(duration);
}
