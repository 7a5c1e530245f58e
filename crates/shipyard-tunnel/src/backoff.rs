//! Exponential backoff with optional jitter

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// 初期待機時間
    pub initial: Duration,
    /// 最大待機時間
    pub max: Duration,
    /// Exponential倍率
    pub multiplier: f64,
    /// Randomize each delay between `initial` and the computed delay
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(2),
            multiplier: 1.2,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// 指定回数目の待機時間を計算（ジッターなし）
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}

/// Stateful backoff sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay to wait before the next attempt; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let base = self.config.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if !self.config.jitter || base <= self.config.initial {
            return base;
        }

        let low = self.config.initial.as_secs_f64();
        let high = base.as_secs_f64();
        Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
