//! Next-delivery planning.
//!
//! The adaptive planner integrates availability mass forward in time and stops
//! once it has accumulated `1 / frequency`. Low-probability hours contribute
//! little and are skipped over without any hard-coded notion of sleep.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::availability::AvailabilityModel;
use super::clock::LocalClock;
use super::config::PlannerConfig;

pub const MIN_LEGACY_INTERVAL_HOURS: u32 = 1;
pub const MAX_LEGACY_INTERVAL_HOURS: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Adaptive,
    Legacy,
    Fixed,
}

impl DeliveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Adaptive => "adaptive",
            Self::Legacy => "legacy",
            Self::Fixed => "fixed",
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adaptive" => Ok(Self::Adaptive),
            "legacy" => Ok(Self::Legacy),
            "fixed" => Ok(Self::Fixed),
            other => Err(format!("unknown delivery mode: {other}")),
        }
    }
}

/// A daily local time, `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedTime {
    pub hour: u8,
    pub minute: u8,
}

impl FixedTime {
    fn secs_into_day(self) -> i64 {
        i64::from(self.hour) * 3_600 + i64::from(self.minute) * 60
    }

    /// Parse a list, sorted and deduplicated. `None` if empty or any entry is bad.
    pub fn parse_list<S: AsRef<str>>(raw: &[S]) -> Option<Vec<FixedTime>> {
        let mut times = raw
            .iter()
            .map(|s| s.as_ref().parse::<FixedTime>().ok())
            .collect::<Option<Vec<_>>>()?;
        if times.is_empty() {
            return None;
        }
        times.sort_unstable();
        times.dedup();
        Some(times)
    }
}

impl FromStr for FixedTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got {s:?}"))?;
        let hour: u8 = h.parse().map_err(|_| format!("invalid hour in {s:?}"))?;
        let minute: u8 = m.parse().map_err(|_| format!("invalid minute in {s:?}"))?;
        if hour > 23 || minute > 59 {
            return Err(format!("time out of range: {s:?}"));
        }
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for FixedTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryPlanner {
    lookahead_hours: i64,
    fallback_hours: i64,
}

impl DeliveryPlanner {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            lookahead_hours: i64::from(config.lookahead_hours.max(1)),
            fallback_hours: i64::from(config.fallback_hours.max(1)),
        }
    }

    /// Walks candidates `now + 1h ..= now + lookahead`, summing the bucket of
    /// each, and returns the first candidate (truncated to its hour) where the
    /// sum reaches `1 / frequency`. Falls back to exactly `now + fallback`.
    ///
    /// Deterministic: no randomness, identical inputs give identical output.
    pub fn schedule_next(
        &self,
        model: &AvailabilityModel,
        frequency: f64,
        now: DateTime<Utc>,
        clock: LocalClock,
    ) -> DateTime<Utc> {
        if !(frequency.is_finite() && frequency > 0.0) {
            return self.fallback(now);
        }
        let target_mass = 1.0 / frequency;

        let mut mass = 0.0;
        for step in 1..=self.lookahead_hours {
            let candidate = now + Duration::hours(step);
            mass += model.probability(clock.hour_of(candidate));
            if mass >= target_mass {
                return clock.truncate_to_hour(candidate);
            }
        }
        self.fallback(now)
    }

    /// Fixed interval plus any miss backoff, clamped to `[1, 24]` hours and
    /// truncated to the hour.
    pub fn schedule_legacy(
        &self,
        interval_hours: u32,
        backoff_hours: f64,
        now: DateTime<Utc>,
        clock: LocalClock,
    ) -> DateTime<Utc> {
        let backoff = if backoff_hours.is_finite() {
            backoff_hours.max(0.0)
        } else {
            0.0
        };
        let hours = (f64::from(interval_hours) + backoff).clamp(
            f64::from(MIN_LEGACY_INTERVAL_HOURS),
            f64::from(MAX_LEGACY_INTERVAL_HOURS),
        );
        let target = now + Duration::seconds((hours * 3_600.0) as i64);
        clock.truncate_to_hour(target)
    }

    /// Next listed local time strictly after `now`. `None` only when `times`
    /// is empty.
    pub fn schedule_fixed(
        &self,
        times: &[FixedTime],
        now: DateTime<Utc>,
        clock: LocalClock,
    ) -> Option<DateTime<Utc>> {
        let today = clock.start_of_day(now);
        (0..=1)
            .flat_map(|day| {
                times.iter().map(move |t| {
                    today + Duration::days(day) + Duration::seconds(t.secs_into_day())
                })
            })
            .filter(|candidate| *candidate > now)
            .min()
    }

    pub fn fallback(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        Duration::try_hours(self.fallback_hours)
            .and_then(|gap| now.checked_add_signed(gap))
            .unwrap_or(now)
    }
}
