use crate::config::EngineConfig;
use rand::Rng;
use std::time::Duration;

const GROWTH: f64 = 1.5;

/// Reconnect delay: `min(base * 1.5^attempt, max) + uniform(0, jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Backoff {
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self {
            base: Duration::from_millis(engine.reconnect_base_ms),
            max: Duration::from_millis(engine.reconnect_max_ms),
            jitter: Duration::from_millis(engine.reconnect_jitter_ms),
        }
    }

    /// The capped exponential part, without jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        // 1.5^64 already dwarfs any sane cap.
        let factor = GROWTH.powi(attempt.min(64) as i32);
        let millis = (self.base.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let sample = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };
        self.delay_with_jitter(attempt, Duration::from_millis(sample))
    }

    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        self.ceiling(attempt) + jitter.min(self.jitter)
    }
}
