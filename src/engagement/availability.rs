//! Per-user availability model: one success probability per hour of day,
//! learned with a prediction-error rule.
//!
//! `delta = learning_rate * (actual - expected)`: a surprise moves the
//! bucket a lot, a confirmation barely moves it. Buckets never leave
//! `[floor, ceil]`, which keeps a run of misses from zeroing an hour forever.

use super::clock::HOURS_PER_DAY;
use super::config::AvailabilityConfig;

pub type Buckets = [f64; HOURS_PER_DAY];

#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilityModel {
    buckets: Buckets,
    learning_rate: f64,
    floor: f64,
    ceil: f64,
}

impl AvailabilityModel {
    /// Fresh model with every bucket at the configured prior.
    pub fn new(config: &AvailabilityConfig) -> Self {
        Self::from_buckets([config.initial_probability; HOURS_PER_DAY], config)
    }

    /// Values outside `[floor, ceil]` are clamped on the way in.
    pub fn from_buckets(buckets: Buckets, config: &AvailabilityConfig) -> Self {
        let mut model = Self {
            buckets,
            learning_rate: config.learning_rate,
            floor: config.floor,
            ceil: config.ceil,
        };
        for b in model.buckets.iter_mut() {
            *b = b.clamp(model.floor, model.ceil);
        }
        model
    }

    /// Validate a persisted distribution. `None` when the length is wrong or
    /// any value is non-finite or outside `[floor, ceil]`.
    pub fn sanitize(raw: &[f64], config: &AvailabilityConfig) -> Option<Buckets> {
        if raw.len() != HOURS_PER_DAY {
            return None;
        }
        if raw
            .iter()
            .any(|v| !v.is_finite() || *v < config.floor || *v > config.ceil)
        {
            return None;
        }
        let mut buckets = [0.0; HOURS_PER_DAY];
        buckets.copy_from_slice(raw);
        Some(buckets)
    }

    pub fn update(&mut self, hour: usize, success: bool) {
        let expected = self.buckets[hour];
        let actual = if success { 1.0 } else { 0.0 };
        let delta = self.learning_rate * (actual - expected);
        self.nudge(hour, delta);
    }

    /// Add `delta` to a bucket, clamped to `[floor, ceil]`.
    pub(crate) fn nudge(&mut self, hour: usize, delta: f64) {
        self.buckets[hour] = (self.buckets[hour] + delta).clamp(self.floor, self.ceil);
    }

    pub fn probability(&self, hour: usize) -> f64 {
        self.buckets[hour]
    }

    pub fn distribution(&self) -> Buckets {
        self.buckets
    }

    pub fn into_buckets(self) -> Buckets {
        self.buckets
    }

    pub fn floor(&self) -> f64 {
        self.floor
    }

    pub fn ceil(&self) -> f64 {
        self.ceil
    }
}
