//! Target encounter rate per user (encounters/day).
//!
//! Multiplicative both ways but asymmetric: a quick answer speeds things up by
//! 10%, a normal one by 5%, a miss backs off by 10%.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::FrequencyConfig;

const HOURS_PER_DAY: f64 = 24.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyOutcome {
    FastSuccess,
    NormalSuccess,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct FrequencyController {
    config: FrequencyConfig,
}

impl FrequencyController {
    pub fn new(config: &FrequencyConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn classify_success(&self, latency: Duration) -> FrequencyOutcome {
        if latency < Duration::from_secs(self.config.fast_response_threshold_secs) {
            FrequencyOutcome::FastSuccess
        } else {
            FrequencyOutcome::NormalSuccess
        }
    }

    pub fn adjust(&self, frequency: f64, outcome: FrequencyOutcome) -> f64 {
        let multiplier = match outcome {
            FrequencyOutcome::FastSuccess => self.config.fast_success_multiplier,
            FrequencyOutcome::NormalSuccess => self.config.normal_success_multiplier,
            FrequencyOutcome::Timeout => self.config.timeout_multiplier,
        };
        self.clamp(self.clamp(frequency) * multiplier)
    }

    /// Clamp to `[min, max]`; NaN/inf fall back to the default rate.
    pub fn clamp(&self, frequency: f64) -> f64 {
        if !frequency.is_finite() {
            return self.config.default_frequency;
        }
        frequency.clamp(self.config.min_frequency, self.config.max_frequency)
    }

    pub fn default_frequency(&self) -> f64 {
        self.config.default_frequency
    }

    pub fn contains(&self, frequency: f64) -> bool {
        frequency.is_finite()
            && (self.config.min_frequency..=self.config.max_frequency).contains(&frequency)
    }

    /// Rate actually used for planning after consecutive misses.
    ///
    /// Each miss adds a fixed number of hours to the gap, so the backoff is the
    /// same absolute delay whatever the base rate:
    /// `24 / (24 / base + backoff_hours * failures)`.
    pub fn effective_frequency(&self, base: f64, consecutive_failures: u32) -> f64 {
        let base = self.clamp(base);
        if consecutive_failures == 0 {
            return base;
        }
        let gap_hours = HOURS_PER_DAY / base
            + self.config.miss_backoff_hours * f64::from(consecutive_failures);
        HOURS_PER_DAY / gap_hours
    }
}
