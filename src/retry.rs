use crate::error::Retryable;
use rand::Rng;
use std::fmt;
use std::thread::sleep;
use std::time::Duration;

/// Jittered exponential backoff shared by API calls and batch writes.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the delay used as +/- jitter (0.0..=1.0).
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        jitter_pct: f64,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 2.0 },
            max_delay: max_delay.max(base_delay),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn nominal_delay(&self, retry: usize) -> Duration {
        let factor = self.multiplier.powi(retry.min(62) as i32);
        let ms = (self.base_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }

    /// Jittered delay before retry number `retry`; a server wait hint acts as the floor.
    pub fn delay_for(&self, retry: usize, hint: Option<Duration>) -> Duration {
        let nominal = self.nominal_delay(retry);
        let jittered = if self.jitter_pct > 0.0 {
            let ms = nominal.as_millis() as i64;
            let spread = (ms as f64 * self.jitter_pct) as i64;
            let delta = rand::thread_rng().gen_range(-spread..=spread);
            Duration::from_millis(ms.saturating_add(delta).max(0) as u64)
        } else {
            nominal
        };
        match hint {
            Some(h) => jittered.max(h),
            None => jittered,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 2.0, Duration::from_secs(60), 0.2)
    }
}

/// Run `op` until it succeeds, fails permanently, or the retry budget is spent.
/// `op` receives the attempt number (0 for the first call).
pub fn retry<T, E, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + fmt::Display,
    F: FnMut(usize) -> Result<T, E>,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt, e.retry_after());
                tracing::warn!(
                    "{what}: attempt {}/{} failed, retrying in {:?}: {e}",
                    attempt + 1,
                    policy.max_retries + 1,
                    delay
                );
                sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::warn!("{what}: giving up after {} attempts: {e}", attempt + 1);
                }
                return Err(e);
            }
        }
    }
}
