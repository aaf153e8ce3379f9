//! Poll every known user: dispatch due encounters, expire missed ones.
//!
//! The scheduler fires this job on a short heartbeat. [`PollPacer`] turns the
//! heartbeat into passes spaced by `lifecycle.poll_interval_secs` as read from
//! the engine on every beat, so a config reload retimes the loop without a
//! restart.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::engagement::engine::EngagementEngine;
use crate::engagement::state_machine::Action;
use crate::services::transport::Transport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub scanned: usize,
    pub sent: usize,
    pub delivery_failures: usize,
    pub timeouts: usize,
    pub disabled: usize,
    pub errors: usize,
}

impl PollSummary {
    fn count_actions(&mut self, actions: &[Action]) {
        for action in actions {
            if let Action::Timeout { disable, .. } = action {
                self.timeouts += 1;
                if *disable {
                    self.disabled += 1;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct PollPacer {
    last_pass: Mutex<Option<Instant>>,
}

impl PollPacer {
    /// True when at least `interval` has passed since the last pass that
    /// was let through; that pass is then recorded as `now`.
    pub fn should_run(&self, now: Instant, interval: Duration) -> bool {
        let mut last = match self.last_pass.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Heartbeat entry point. Returns the summary when a pass actually ran.
pub async fn run(
    engine: &EngagementEngine,
    transport: &dyn Transport,
    pacer: &PollPacer,
) -> Option<PollSummary> {
    let interval_secs = engine.get_config().await.lifecycle.poll_interval_secs.max(1);
    if !pacer.should_run(Instant::now(), Duration::from_secs(interval_secs)) {
        return None;
    }

    tracing::debug!(interval_secs, "delivery_poll: start");
    let summary = run_at(engine, transport, Utc::now()).await;
    if summary.sent + summary.timeouts + summary.errors > 0 {
        tracing::info!(
            scanned = summary.scanned,
            sent = summary.sent,
            delivery_failures = summary.delivery_failures,
            timeouts = summary.timeouts,
            disabled = summary.disabled,
            errors = summary.errors,
            "delivery_poll: done"
        );
    }
    Some(summary)
}

/// One pass over all users at `now`. A failure for one user never stops the pass.
pub async fn run_at(
    engine: &EngagementEngine,
    transport: &dyn Transport,
    now: DateTime<Utc>,
) -> PollSummary {
    let mut summary = PollSummary::default();

    let user_ids = match engine.user_ids() {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "delivery_poll: failed to list users");
            summary.errors += 1;
            return summary;
        }
    };

    for user_id in user_ids {
        summary.scanned += 1;

        let outcome = match engine.tick_user(&user_id, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "delivery_poll: tick failed");
                summary.errors += 1;
                continue;
            }
        };
        summary.count_actions(&outcome.actions);

        let Some(encounter) = outcome.outbound else {
            continue;
        };

        match transport.deliver(&encounter).await {
            Ok(()) => summary.sent += 1,
            Err(err) => {
                tracing::warn!(
                    user_id = %user_id,
                    transport = transport.name(),
                    error = %err,
                    "Delivery failed, treating as missed"
                );
                summary.delivery_failures += 1;
                match engine.delivery_failed(&user_id, now).await {
                    Ok(actions) => summary.count_actions(&actions),
                    Err(e) => {
                        tracing::error!(user_id = %user_id, error = %e, "delivery_poll: failure bookkeeping failed");
                        summary.errors += 1;
                    }
                }
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacer_spaces_passes_by_interval() {
        let pacer = PollPacer::default();
        let start = Instant::now();
        let interval = Duration::from_secs(30);

        assert!(pacer.should_run(start, interval));
        assert!(!pacer.should_run(start + Duration::from_secs(1), interval));
        assert!(!pacer.should_run(start + Duration::from_secs(29), interval));
        assert!(pacer.should_run(start + Duration::from_secs(30), interval));
        assert!(!pacer.should_run(start + Duration::from_secs(31), interval));
    }

    #[test]
    fn pacer_picks_up_a_shorter_interval_immediately() {
        let pacer = PollPacer::default();
        let start = Instant::now();

        assert!(pacer.should_run(start, Duration::from_secs(600)));
        assert!(!pacer.should_run(start + Duration::from_secs(5), Duration::from_secs(600)));
        assert!(pacer.should_run(start + Duration::from_secs(5), Duration::from_secs(5)));
    }
}
