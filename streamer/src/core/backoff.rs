//! Exponential backoff with jitter for connect and handshake retries

use rand::Rng;
use std::time::Duration;

use crate::config::StreamingSettings;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    cap: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            factor: factor.max(1.0),
            cap: cap.max(base),
            jitter: jitter.clamp(0.0, 0.99),
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &StreamingSettings) -> Self {
        Self::new(
            settings.backoff_base,
            settings.backoff_factor,
            settings.backoff_cap,
            settings.backoff_jitter,
        )
    }

    /// Delay before the next attempt, without jitter
    pub fn nominal_delay(&self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let scaled = self.base.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal_delay();
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter == 0.0 {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + spread)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
