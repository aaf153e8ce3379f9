//! Per-user encounter lifecycle.
//!
//! The persisted record only carries `sent` and `next_delivery`; the phase is
//! derived once here and matched on everywhere else. Every transition goes
//! through this type so the learning components are invoked in one place.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::EngagementConfig;
use super::frequency::{FrequencyController, FrequencyOutcome};
use super::penalty::PenaltyDistributor;
use super::planner::{DeliveryMode, DeliveryPlanner};
use super::record::{initial_delivery, EngagementRecord};
use super::reward::{DifficultyTier, RewardBreakdown, RewardCalculator, RewardContext};
use crate::services::content::Content;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncounterPhase {
    /// Not enrolled; nothing to do.
    Idle,
    PendingSend,
    AwaitingResponse,
    TimedOut,
    /// Auto-disabled; frozen until re-enrollment.
    Disabled,
}

/// Handed to collaborators for logging; never persisted by the machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncounterOutcome {
    pub success: bool,
    pub response_latency_secs: Option<u64>,
    pub sent_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    NotEnrolled,
    Disabled,
    NothingOutstanding,
    DeadlinePassed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Deliver now. The caller confirms with `record_sent` or reports
    /// `record_delivery_failure`.
    Send { scheduled_for: DateTime<Utc> },
    Timeout {
        outcome: EncounterOutcome,
        consecutive_failures: u32,
        disable: bool,
        missed_hours: Vec<usize>,
        next_delivery: DateTime<Utc>,
        content: Option<Content>,
    },
    /// Soft threshold crossed; the user is still enrolled.
    Warn { consecutive_failures: u32 },
    Resolved {
        outcome: EncounterOutcome,
        reward: RewardBreakdown,
        streak_count: u32,
        is_public: bool,
        content: Option<Content>,
    },
    /// A resolve that no longer applies. Not an error.
    Ignored { reason: IgnoreReason },
}

#[derive(Debug, Clone)]
pub struct EncounterStateMachine {
    config: EngagementConfig,
    penalty: PenaltyDistributor,
    frequency: FrequencyController,
    planner: DeliveryPlanner,
    reward: RewardCalculator,
}

impl EncounterStateMachine {
    pub fn new(config: &EngagementConfig) -> Self {
        Self {
            config: config.clone(),
            penalty: PenaltyDistributor::new(&config.penalty),
            frequency: FrequencyController::new(&config.frequency),
            planner: DeliveryPlanner::new(&config.planner),
            reward: RewardCalculator::new(&config.reward),
        }
    }

    pub fn config(&self) -> &EngagementConfig {
        &self.config
    }

    /// A `now` before `sent` counts as zero elapsed time, so clock skew never
    /// produces a timeout.
    pub fn phase(record: &EngagementRecord, now: DateTime<Utc>) -> EncounterPhase {
        if record.disabled {
            return EncounterPhase::Disabled;
        }
        if !record.enrolled {
            return EncounterPhase::Idle;
        }
        match record.delivery.sent {
            None => EncounterPhase::PendingSend,
            Some(sent) if now < sent => EncounterPhase::AwaitingResponse,
            Some(_) if now >= record.delivery.next_delivery => EncounterPhase::TimedOut,
            Some(_) => EncounterPhase::AwaitingResponse,
        }
    }

    /// Poll step. Empty when there is nothing to do.
    pub fn tick(&self, record: &mut EngagementRecord, now: DateTime<Utc>) -> Vec<Action> {
        match Self::phase(record, now) {
            EncounterPhase::Disabled | EncounterPhase::Idle | EncounterPhase::AwaitingResponse => {
                Vec::new()
            }
            EncounterPhase::PendingSend => {
                if now >= record.delivery.next_delivery {
                    vec![Action::Send {
                        scheduled_for: record.delivery.next_delivery,
                    }]
                } else {
                    Vec::new()
                }
            }
            EncounterPhase::TimedOut => self.expire(record, now),
        }
    }

    /// Mark the encounter dispatched. `next_delivery` becomes its deadline.
    /// Returns the deadline, or `None` if nothing was waiting to be sent.
    pub fn record_sent(
        &self,
        record: &mut EngagementRecord,
        content: Option<Content>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if Self::phase(record, now) != EncounterPhase::PendingSend {
            return None;
        }
        let deadline = self.plan_next(record, now);
        record.delivery.sent = Some(now);
        record.delivery.next_delivery = deadline;
        record.current_encounter = content;
        Some(deadline)
    }

    /// Push the send target forward without counting a miss. Used when there
    /// is nothing to deliver.
    pub fn defer(&self, record: &mut EngagementRecord, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if Self::phase(record, now) != EncounterPhase::PendingSend {
            return None;
        }
        let next = self.plan_next(record, now);
        record.delivery.next_delivery = next;
        Some(next)
    }

    /// Transport failure: treated as an immediate timeout of the encounter.
    pub fn record_delivery_failure(
        &self,
        record: &mut EngagementRecord,
        content: Option<Content>,
        now: DateTime<Utc>,
    ) -> Vec<Action> {
        match Self::phase(record, now) {
            EncounterPhase::PendingSend => {
                record.delivery.sent = Some(now);
                record.current_encounter = content;
            }
            EncounterPhase::AwaitingResponse | EncounterPhase::TimedOut => {}
            EncounterPhase::Idle | EncounterPhase::Disabled => return Vec::new(),
        }
        record.delivery.next_delivery = now;
        self.expire(record, now)
    }

    pub fn resolve(
        &self,
        record: &mut EngagementRecord,
        responded_at: DateTime<Utc>,
        is_public: bool,
    ) -> Action {
        let reason = match Self::phase(record, responded_at) {
            EncounterPhase::AwaitingResponse => None,
            EncounterPhase::Disabled => Some(IgnoreReason::Disabled),
            EncounterPhase::Idle => Some(IgnoreReason::NotEnrolled),
            EncounterPhase::PendingSend => Some(IgnoreReason::NothingOutstanding),
            EncounterPhase::TimedOut => Some(IgnoreReason::DeadlinePassed),
        };
        let (Some(sent_at), None) = (record.delivery.sent, reason) else {
            return Action::Ignored {
                reason: reason.unwrap_or(IgnoreReason::NothingOutstanding),
            };
        };

        let latency = (responded_at - sent_at).to_std().unwrap_or_default();

        let mut model = record.model(&self.config);
        self.penalty
            .apply_success(&mut model, record.clock(), sent_at, responded_at);
        record.store_model(model);

        let outcome = self.frequency.classify_success(latency);
        record.delivery.frequency = self.frequency.adjust(record.delivery.frequency, outcome);
        record.delivery.consecutive_failures = 0;
        record.streak_count = record.streak_count.saturating_add(1);
        record.delivery.sent = None;

        let content = record.current_encounter.take();
        let base_points = content
            .as_ref()
            .map_or(self.config.reward.default_base_points, |c| c.base_points);
        let difficulty_tier = content
            .as_ref()
            .map_or_else(|| DifficultyTier::from_base_points(base_points), |c| c.difficulty);
        let reward = self.reward.breakdown(&RewardContext {
            base_points,
            difficulty_tier,
            streak_count: record.streak_count,
            response_latency: latency,
            is_public,
        });

        Action::Resolved {
            outcome: EncounterOutcome {
                success: true,
                response_latency_secs: Some(latency.as_secs()),
                sent_at,
                resolved_at: responded_at,
            },
            reward,
            streak_count: record.streak_count,
            is_public,
            content,
        }
    }

    /// Enrollment resets delivery state but keeps the learned distribution.
    pub fn enroll(&self, record: &mut EngagementRecord, themes: Vec<String>, now: DateTime<Utc>) {
        record.enrolled = true;
        record.disabled = false;
        record.themes = themes;
        record.streak_count = 0;
        record.current_encounter = None;
        record.delivery.sent = None;
        record.delivery.consecutive_failures = 0;
        record.delivery.frequency = self.frequency.default_frequency();
        record.delivery.next_delivery = initial_delivery(&self.config, now);
    }

    /// Drops any outstanding encounter; the distribution and rate survive for
    /// a later re-enrollment.
    pub fn unenroll(&self, record: &mut EngagementRecord) {
        record.enrolled = false;
        record.delivery.sent = None;
        record.current_encounter = None;
    }

    /// Next send time (or deadline) for the record's delivery mode.
    pub fn plan_next(&self, record: &EngagementRecord, now: DateTime<Utc>) -> DateTime<Utc> {
        let clock = record.clock();
        let failures = record.delivery.consecutive_failures;
        match record.delivery_mode {
            DeliveryMode::Adaptive => {
                let rate = self
                    .frequency
                    .effective_frequency(record.delivery.frequency, failures);
                self.planner
                    .schedule_next(&record.model(&self.config), rate, now, clock)
            }
            DeliveryMode::Legacy => self.planner.schedule_legacy(
                record.legacy_interval_hours,
                self.config.frequency.miss_backoff_hours * f64::from(failures),
                now,
                clock,
            ),
            DeliveryMode::Fixed => self
                .planner
                .schedule_fixed(&record.fixed_schedule(&self.config), now, clock)
                .unwrap_or_else(|| self.planner.fallback(now)),
        }
    }

    fn expire(&self, record: &mut EngagementRecord, now: DateTime<Utc>) -> Vec<Action> {
        let Some(sent_at) = record.delivery.sent else {
            return Vec::new();
        };
        let deadline = record.delivery.next_delivery;

        let mut model = record.model(&self.config);
        let window = self
            .penalty
            .apply_timeout(&mut model, record.clock(), sent_at, deadline);
        record.store_model(model);

        record.delivery.consecutive_failures = record.delivery.consecutive_failures.saturating_add(1);
        record.delivery.frequency = self
            .frequency
            .adjust(record.delivery.frequency, FrequencyOutcome::Timeout);
        record.delivery.sent = None;
        record.streak_count = 0;
        let content = record.current_encounter.take();

        let failures = record.delivery.consecutive_failures;
        let lifecycle = &self.config.lifecycle;
        let disable = failures >= lifecycle.disable_threshold;
        if disable {
            record.disabled = true;
            record.enrolled = false;
        }
        record.delivery.next_delivery = self.plan_next(record, now);

        let mut actions = vec![Action::Timeout {
            outcome: EncounterOutcome {
                success: false,
                response_latency_secs: None,
                sent_at,
                resolved_at: now,
            },
            consecutive_failures: failures,
            disable,
            missed_hours: window.penalized_hours,
            next_delivery: record.delivery.next_delivery,
            content,
        }];
        if !disable && failures >= lifecycle.warn_threshold {
            actions.push(Action::Warn {
                consecutive_failures: failures,
            });
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 10, 5, 0).unwrap()
    }

    fn machine() -> EncounterStateMachine {
        EncounterStateMachine::new(&EngagementConfig::default())
    }

    fn enrolled(sm: &EncounterStateMachine) -> EngagementRecord {
        let mut record = EngagementRecord::new("u1", sm.config(), t0());
        sm.enroll(&mut record, vec!["focus".into()], t0());
        record
    }

    fn content(points: u32) -> Content {
        Content {
            text: "I finish what I start.".into(),
            theme: "focus".into(),
            base_points: points,
            difficulty: DifficultyTier::from_base_points(points),
        }
    }

    #[test]
    fn enrollment_waits_initial_delay() {
        let sm = machine();
        let mut record = enrolled(&sm);
        assert!(sm.tick(&mut record, t0()).is_empty());
        let due = t0() + Duration::seconds(30);
        assert_eq!(
            sm.tick(&mut record, due),
            vec![Action::Send { scheduled_for: due }]
        );
    }

    #[test]
    fn send_turns_next_delivery_into_deadline() {
        let sm = machine();
        let mut record = enrolled(&sm);
        let now = t0() + Duration::minutes(1);
        let deadline = sm.record_sent(&mut record, Some(content(50)), now).unwrap();

        assert_eq!(deadline, Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap());
        assert_eq!(record.delivery.next_delivery, deadline);
        assert_eq!(
            EncounterStateMachine::phase(&record, now),
            EncounterPhase::AwaitingResponse
        );
        assert!(sm.record_sent(&mut record, None, now).is_none());
    }

    #[test]
    fn resolve_scores_and_keeps_next_delivery() {
        let sm = machine();
        let mut record = enrolled(&sm);
        let sent = t0();
        record.delivery.next_delivery = sent;
        let deadline = sm.record_sent(&mut record, Some(content(50)), sent).unwrap();

        let action = sm.resolve(&mut record, sent + Duration::seconds(10), false);
        let Action::Resolved { reward, streak_count, outcome, .. } = action else {
            panic!("expected resolved, got {action:?}");
        };
        assert_eq!(streak_count, 1);
        assert_eq!(outcome.response_latency_secs, Some(10));
        assert_eq!(reward.total, 50 + 30);
        assert_eq!(record.delivery.sent, None);
        assert_eq!(record.delivery.next_delivery, deadline);
        assert!((record.delivery.frequency - 1.1).abs() < 1e-12);
        assert!(record.availability_distribution[10] > 0.5);
    }

    #[test]
    fn late_resolve_is_ignored() {
        let sm = machine();
        let mut record = enrolled(&sm);
        record.delivery.next_delivery = t0();
        let deadline = sm.record_sent(&mut record, None, t0()).unwrap();

        let before = record.clone();
        let action = sm.resolve(&mut record, deadline, false);
        assert_eq!(
            action,
            Action::Ignored {
                reason: IgnoreReason::DeadlinePassed
            }
        );
        assert_eq!(record, before);

        let actions = sm.tick(&mut record, deadline);
        assert!(matches!(actions[0], Action::Timeout { consecutive_failures: 1, .. }));
        assert_eq!(
            sm.resolve(&mut record, deadline, false),
            Action::Ignored {
                reason: IgnoreReason::NothingOutstanding
            }
        );
    }

    #[test]
    fn resolve_before_send_time_counts_as_instant() {
        let sm = machine();
        let mut record = enrolled(&sm);
        record.delivery.next_delivery = t0();
        sm.record_sent(&mut record, None, t0()).unwrap();

        let action = sm.resolve(&mut record, t0() - Duration::minutes(5), false);
        let Action::Resolved { outcome, .. } = action else {
            panic!("expected resolved");
        };
        assert_eq!(outcome.response_latency_secs, Some(0));
    }

    #[test]
    fn skewed_clock_never_times_out() {
        let sm = machine();
        let mut record = enrolled(&sm);
        record.delivery.sent = Some(t0());
        record.delivery.next_delivery = t0() - Duration::hours(1);
        assert_eq!(
            EncounterStateMachine::phase(&record, t0() - Duration::minutes(1)),
            EncounterPhase::AwaitingResponse
        );
        assert!(sm.tick(&mut record, t0() - Duration::minutes(1)).is_empty());
    }

    #[test]
    fn timeout_cascade_warns_then_disables() {
        let sm = machine();
        let mut record = enrolled(&sm);
        let mut now = t0();

        for round in 1..=8u32 {
            record.delivery.next_delivery = now;
            let deadline = sm.record_sent(&mut record, None, now).unwrap();
            now = deadline;
            let actions = sm.tick(&mut record, now);

            let Action::Timeout { consecutive_failures, disable, .. } = &actions[0] else {
                panic!("round {round}: expected timeout, got {actions:?}");
            };
            assert_eq!(*consecutive_failures, round);
            assert_eq!(*disable, round == 8);

            let warned = actions.iter().any(|a| matches!(a, Action::Warn { .. }));
            assert_eq!(warned, (3..8).contains(&round), "round {round}");
        }

        assert!(record.disabled);
        assert!(!record.enrolled);
        assert!(sm.tick(&mut record, now + Duration::days(30)).is_empty());
        assert_eq!(
            sm.resolve(&mut record, now, false),
            Action::Ignored {
                reason: IgnoreReason::Disabled
            }
        );
    }

    #[test]
    fn defer_moves_target_without_a_miss() {
        let sm = machine();
        let mut record = enrolled(&sm);
        let now = t0() + Duration::minutes(1);
        let next = sm.defer(&mut record, now).unwrap();
        assert!(next > now);
        assert_eq!(record.delivery.consecutive_failures, 0);
        assert!(sm.tick(&mut record, now).is_empty());
    }

    #[test]
    fn delivery_failure_is_an_immediate_timeout() {
        let sm = machine();
        let mut record = enrolled(&sm);
        let now = t0() + Duration::minutes(1);

        let actions = sm.record_delivery_failure(&mut record, Some(content(20)), now);
        let Action::Timeout { missed_hours, content, .. } = &actions[0] else {
            panic!("expected timeout");
        };
        assert_eq!(missed_hours, &vec![10]);
        assert_eq!(content.as_ref().map(|c| c.base_points), Some(20));
        assert_eq!(record.delivery.consecutive_failures, 1);
        assert_eq!(record.delivery.sent, None);
        assert!(record.delivery.next_delivery > now);
    }

    #[test]
    fn unenroll_keeps_model_and_reenroll_resets_delivery() {
        let sm = machine();
        let mut record = enrolled(&sm);
        record.availability_distribution[9] = 0.9;
        record.delivery.consecutive_failures = 4;
        record.delivery.sent = Some(t0());

        sm.unenroll(&mut record);
        assert_eq!(EncounterStateMachine::phase(&record, t0()), EncounterPhase::Idle);
        assert!(sm.tick(&mut record, t0() + Duration::days(2)).is_empty());

        sm.enroll(&mut record, vec!["gratitude".into()], t0());
        assert_eq!(record.availability_distribution[9], 0.9);
        assert_eq!(record.delivery.consecutive_failures, 0);
        assert_eq!(record.delivery.sent, None);
    }

    #[test]
    fn legacy_and_fixed_modes_plan_differently() {
        let sm = machine();
        let mut record = enrolled(&sm);

        record.delivery_mode = DeliveryMode::Legacy;
        record.legacy_interval_hours = 6;
        assert_eq!(
            sm.plan_next(&record, t0()),
            Utc.with_ymd_and_hms(2025, 6, 2, 16, 0, 0).unwrap()
        );

        record.delivery_mode = DeliveryMode::Fixed;
        assert_eq!(
            sm.plan_next(&record, t0()),
            Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap()
        );
    }

    #[test]
    fn misses_stretch_the_adaptive_gap() {
        let sm = machine();
        let mut record = enrolled(&sm);
        let fresh = sm.plan_next(&record, t0());
        record.delivery.consecutive_failures = 3;
        assert!(sm.plan_next(&record, t0()) > fresh);
    }
}
