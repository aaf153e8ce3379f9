//! Spreads the outcome of one encounter over every hour it spanned.
//!
//! A success only says the response hour was good; the hours the prompt sat
//! unanswered before it are evidence too. A timeout marks the whole window
//! from send to deadline as unavailable.

use chrono::{DateTime, Duration, Utc};

use super::availability::AvailabilityModel;
use super::clock::LocalClock;
use super::config::PenaltyConfig;

/// Which buckets an application touched, in walk order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowSummary {
    pub rewarded_hour: Option<usize>,
    pub penalized_hours: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct PenaltyDistributor {
    penalty_rate: f64,
    max_window_hours: i64,
}

impl PenaltyDistributor {
    pub fn new(config: &PenaltyConfig) -> Self {
        Self {
            penalty_rate: config.penalty_rate,
            max_window_hours: i64::from(config.max_window_hours.max(1)),
        }
    }

    /// Full positive update for the response hour, weighted negative update
    /// `penalty_rate * (0 - p) * p` for each hour strictly between the send
    /// hour and the response hour. The send hour itself is left alone.
    pub fn apply_success(
        &self,
        model: &mut AvailabilityModel,
        clock: LocalClock,
        sent_at: DateTime<Utc>,
        responded_at: DateTime<Utc>,
    ) -> WindowSummary {
        let responded_at = responded_at.max(sent_at);
        let response_hour = clock.hour_of(responded_at);
        let response_slot = clock.truncate_to_hour(responded_at);
        let first_missed = self.window_start(clock, sent_at, responded_at) + Duration::hours(1);

        let mut summary = WindowSummary {
            rewarded_hour: Some(response_hour),
            penalized_hours: Vec::new(),
        };

        for slot in clock.hour_slots(first_missed, responded_at) {
            if slot >= response_slot {
                break;
            }
            let hour = clock.hour_of(slot);
            // Multi-day windows revisit the response bucket; it was not missed.
            if hour == response_hour {
                continue;
            }
            let p = model.probability(hour);
            model.nudge(hour, self.penalty_rate * (0.0 - p) * p);
            summary.penalized_hours.push(hour);
        }

        model.update(response_hour, true);
        summary
    }

    /// Full negative update for every hour from the send hour through the
    /// deadline hour, inclusive.
    pub fn apply_timeout(
        &self,
        model: &mut AvailabilityModel,
        clock: LocalClock,
        sent_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> WindowSummary {
        let deadline = deadline.max(sent_at);
        let start = self.window_start(clock, sent_at, deadline);

        let mut summary = WindowSummary::default();
        for slot in clock.hour_slots(start, deadline) {
            let hour = clock.hour_of(slot);
            model.update(hour, false);
            summary.penalized_hours.push(hour);
        }
        summary
    }

    /// Send slot, or the oldest slot still inside `max_window_hours` of `end`.
    fn window_start(
        &self,
        clock: LocalClock,
        sent_at: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let start = clock.truncate_to_hour(sent_at);
        let earliest = clock.truncate_to_hour(end) - Duration::hours(self.max_window_hours - 1);
        start.max(earliest)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::engagement::config::AvailabilityConfig;

    fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, h, m, 0).unwrap()
    }

    fn setup() -> (PenaltyDistributor, AvailabilityModel) {
        (
            PenaltyDistributor::new(&PenaltyConfig::default()),
            AvailabilityModel::new(&AvailabilityConfig::default()),
        )
    }

    #[test]
    fn success_penalizes_strictly_between() {
        let (pd, mut model) = setup();
        let summary = pd.apply_success(&mut model, LocalClock::utc(), at(2, 10, 5), at(2, 14, 20));

        assert_eq!(summary.rewarded_hour, Some(14));
        assert_eq!(summary.penalized_hours, vec![11, 12, 13]);
        assert!((model.probability(14) - 0.6).abs() < 1e-12);
        for h in [11, 12, 13] {
            // 0.5 + 0.1 * (0 - 0.5) * 0.5
            assert!((model.probability(h) - 0.475).abs() < 1e-12);
        }
        assert_eq!(model.probability(10), 0.5);
    }

    #[test]
    fn same_hour_has_empty_window() {
        let (pd, mut model) = setup();
        let summary = pd.apply_success(&mut model, LocalClock::utc(), at(2, 10, 5), at(2, 10, 50));
        assert!(summary.penalized_hours.is_empty());
        assert!((model.probability(10) - 0.6).abs() < 1e-12);
    }

    #[test]
    fn weighted_penalty_is_gentler_on_uncertain_hours() {
        let cfg = AvailabilityConfig::default();
        let pd = PenaltyDistributor::new(&PenaltyConfig::default());
        let mut buckets = [0.5; 24];
        buckets[11] = 0.9;
        buckets[12] = 0.2;
        let mut model = AvailabilityModel::from_buckets(buckets, &cfg);

        pd.apply_success(&mut model, LocalClock::utc(), at(2, 10, 0), at(2, 13, 0));

        let drop_trusted = 0.9 - model.probability(11);
        let drop_unsure = 0.2 - model.probability(12);
        assert!(drop_trusted > drop_unsure);
    }

    #[test]
    fn timeout_penalizes_inclusive_window() {
        let (pd, mut model) = setup();
        let summary = pd.apply_timeout(&mut model, LocalClock::utc(), at(2, 22, 30), at(3, 1, 0));
        assert_eq!(summary.penalized_hours, vec![22, 23, 0, 1]);
        for h in [22, 23, 0, 1] {
            assert!((model.probability(h) - 0.4).abs() < 1e-12);
        }
        assert_eq!(model.probability(2), 0.5);
    }

    #[test]
    fn response_before_send_is_treated_as_instant() {
        let (pd, mut model) = setup();
        let summary = pd.apply_success(&mut model, LocalClock::utc(), at(2, 10, 30), at(2, 8, 0));
        assert_eq!(summary.rewarded_hour, Some(10));
        assert!(summary.penalized_hours.is_empty());
    }

    #[test]
    fn multi_day_window_skips_response_bucket() {
        let (pd, mut model) = setup();
        let summary = pd.apply_success(&mut model, LocalClock::utc(), at(2, 9, 0), at(3, 10, 0));
        assert!(!summary.penalized_hours.contains(&10));
        assert_eq!(summary.penalized_hours.len(), 23);
    }

    #[test]
    fn long_windows_are_capped() {
        let pd = PenaltyDistributor::new(&PenaltyConfig {
            penalty_rate: 0.1,
            max_window_hours: 5,
        });
        let mut model = AvailabilityModel::new(&AvailabilityConfig::default());
        let summary = pd.apply_timeout(&mut model, LocalClock::utc(), at(1, 0, 0), at(20, 12, 0));
        assert_eq!(summary.penalized_hours, vec![8, 9, 10, 11, 12]);
    }
}
