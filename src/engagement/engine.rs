use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::engagement::config::EngagementConfig;
use crate::engagement::planner::{DeliveryMode, FixedTime, MAX_LEGACY_INTERVAL_HOURS, MIN_LEGACY_INTERVAL_HOURS};
use crate::engagement::record::EngagementRecord;
use crate::engagement::state_machine::{Action, EncounterPhase, EncounterStateMachine};
use crate::services::content::ContentProvider;
use crate::services::transport::OutboundEncounter;
use crate::store::operations::encounters::{EncounterLogEntry, EncounterStats};
use crate::store::{Store, StoreError};

const MAX_THEMES: usize = 10;
const MAX_OFFSET_MINUTES: i32 = 14 * 60;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no engagement record for user {0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
}

/// A record plus its derived phase, as handed to the HTTP layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    pub phase: EncounterPhase,
    pub record: EngagementRecord,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySettings {
    #[serde(default)]
    pub mode: Option<DeliveryMode>,
    #[serde(default)]
    pub legacy_interval_hours: Option<u32>,
    #[serde(default)]
    pub fixed_times: Option<Vec<String>>,
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

/// Result of one poll step for one user.
#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub actions: Vec<Action>,
    /// Set when an encounter was dispatched and must now go out.
    pub outbound: Option<OutboundEncounter>,
}

pub struct EngagementEngine {
    config: Arc<RwLock<EngagementConfig>>,
    store: Arc<Store>,
    content: Arc<dyn ContentProvider>,
    user_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl EngagementEngine {
    pub fn new(
        config: EngagementConfig,
        store: Arc<Store>,
        content: Arc<dyn ContentProvider>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            store,
            content,
            user_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate, persist as a new version, then swap in. Returns the version.
    pub async fn reload_config(&self, new_config: EngagementConfig) -> Result<u32, EngineError> {
        new_config.validate().map_err(EngineError::Validation)?;
        let version = self.store.save_engagement_config(&new_config)?;
        let mut cfg = self.config.write().await;
        *cfg = new_config;
        tracing::info!(version, "Engagement config reloaded");
        Ok(version)
    }

    pub async fn get_config(&self) -> EngagementConfig {
        self.config.read().await.clone()
    }

    pub fn content(&self) -> &dyn ContentProvider {
        self.content.as_ref()
    }

    async fn acquire_user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;

        // Only the map holds idle locks; drop them once the map grows.
        if locks.len() > 1000 {
            locks.retain(|_, v| Arc::strong_count(v) > 1);
        }

        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load and repair a record. `None` if the user was never seen.
    ///
    /// A repaired record is written back at once so the reset fields stick;
    /// callers must hold the user's lock.
    fn load_record(
        &self,
        user_id: &str,
        config: &EngagementConfig,
        now: DateTime<Utc>,
    ) -> Result<Option<EngagementRecord>, EngineError> {
        let Some(raw) = self.store.get_engagement_record_raw(user_id)? else {
            return Ok(None);
        };
        let (record, anomalies) = EngagementRecord::decode(user_id, &raw, config, now);
        for anomaly in &anomalies {
            tracing::warn!(
                user_id,
                field = anomaly.field,
                reason = %anomaly.reason,
                "Engagement record field reset to default"
            );
        }
        if !anomalies.is_empty() {
            self.store.put_engagement_record(&record)?;
            tracing::info!(user_id, repaired = anomalies.len(), "Repaired engagement record saved");
        }
        Ok(Some(record))
    }

    fn require_record(
        &self,
        user_id: &str,
        config: &EngagementConfig,
        now: DateTime<Utc>,
    ) -> Result<EngagementRecord, EngineError> {
        self.load_record(user_id, config, now)?
            .ok_or_else(|| EngineError::NotFound(user_id.to_string()))
    }

    fn validate_themes(&self, themes: &[String]) -> Result<Vec<String>, EngineError> {
        let mut cleaned: Vec<String> = themes
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        cleaned.sort();
        cleaned.dedup();

        if cleaned.is_empty() {
            return Err(EngineError::Validation("at least one theme is required".to_string()));
        }
        if cleaned.len() > MAX_THEMES {
            return Err(EngineError::Validation(format!("at most {MAX_THEMES} themes")));
        }
        if let Some(unknown) = cleaned.iter().find(|t| !self.content.has_theme(t)) {
            return Err(EngineError::Validation(format!("unknown theme: {unknown}")));
        }
        Ok(cleaned)
    }

    pub async fn snapshot(&self, user_id: &str, now: DateTime<Utc>) -> Result<UserSnapshot, EngineError> {
        let user_lock = self.acquire_user_lock(user_id).await;
        let _guard = user_lock.lock().await;
        let config = self.config.read().await.clone();
        let record = self.require_record(user_id, &config, now)?;
        Ok(UserSnapshot {
            phase: EncounterStateMachine::phase(&record, now),
            record,
        })
    }

    /// Creates the record on first enrollment; an existing model is kept.
    pub async fn enroll(
        &self,
        user_id: &str,
        themes: &[String],
        now: DateTime<Utc>,
    ) -> Result<UserSnapshot, EngineError> {
        let themes = self.validate_themes(themes)?;
        let user_lock = self.acquire_user_lock(user_id).await;
        let _guard = user_lock.lock().await;
        let config = self.config.read().await.clone();

        let mut record = self
            .load_record(user_id, &config, now)?
            .unwrap_or_else(|| EngagementRecord::new(user_id, &config, now));
        EncounterStateMachine::new(&config).enroll(&mut record, themes, now);
        self.store.put_engagement_record(&record)?;

        tracing::info!(user_id, next_delivery = %record.delivery.next_delivery, "User enrolled");
        Ok(UserSnapshot {
            phase: EncounterStateMachine::phase(&record, now),
            record,
        })
    }

    pub async fn unenroll(&self, user_id: &str, now: DateTime<Utc>) -> Result<UserSnapshot, EngineError> {
        let user_lock = self.acquire_user_lock(user_id).await;
        let _guard = user_lock.lock().await;
        let config = self.config.read().await.clone();

        let mut record = self.require_record(user_id, &config, now)?;
        EncounterStateMachine::new(&config).unenroll(&mut record);
        self.store.put_engagement_record(&record)?;

        tracing::info!(user_id, "User unenrolled");
        Ok(UserSnapshot {
            phase: EncounterStateMachine::phase(&record, now),
            record,
        })
    }

    /// Theme changes never touch the learned distribution.
    pub async fn update_themes(
        &self,
        user_id: &str,
        themes: &[String],
        now: DateTime<Utc>,
    ) -> Result<UserSnapshot, EngineError> {
        let themes = self.validate_themes(themes)?;
        let user_lock = self.acquire_user_lock(user_id).await;
        let _guard = user_lock.lock().await;
        let config = self.config.read().await.clone();

        let mut record = self.require_record(user_id, &config, now)?;
        record.themes = themes;
        self.store.put_engagement_record(&record)?;

        Ok(UserSnapshot {
            phase: EncounterStateMachine::phase(&record, now),
            record,
        })
    }

    /// Apply delivery settings. With nothing outstanding the next send is
    /// re-planned under the new settings.
    pub async fn set_delivery_settings(
        &self,
        user_id: &str,
        settings: DeliverySettings,
        now: DateTime<Utc>,
    ) -> Result<UserSnapshot, EngineError> {
        if let Some(hours) = settings.legacy_interval_hours {
            if !(MIN_LEGACY_INTERVAL_HOURS..=MAX_LEGACY_INTERVAL_HOURS).contains(&hours) {
                return Err(EngineError::Validation(format!(
                    "legacyIntervalHours must be in [{MIN_LEGACY_INTERVAL_HOURS}, {MAX_LEGACY_INTERVAL_HOURS}]"
                )));
            }
        }
        let fixed_times = match &settings.fixed_times {
            Some(times) => Some(
                FixedTime::parse_list(times)
                    .ok_or_else(|| {
                        EngineError::Validation("fixedTimes must be a non-empty list of HH:MM".to_string())
                    })?
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
            ),
            None => None,
        };
        if let Some(offset) = settings.utc_offset_minutes {
            if !(-MAX_OFFSET_MINUTES..=MAX_OFFSET_MINUTES).contains(&offset) {
                return Err(EngineError::Validation(format!(
                    "utcOffsetMinutes must be within ±{MAX_OFFSET_MINUTES}"
                )));
            }
        }

        let user_lock = self.acquire_user_lock(user_id).await;
        let _guard = user_lock.lock().await;
        let config = self.config.read().await.clone();

        let mut record = self.require_record(user_id, &config, now)?;
        if let Some(mode) = settings.mode {
            record.delivery_mode = mode;
        }
        if let Some(hours) = settings.legacy_interval_hours {
            record.legacy_interval_hours = hours;
        }
        if let Some(times) = fixed_times {
            record.fixed_times = times;
        }
        if let Some(offset) = settings.utc_offset_minutes {
            record.utc_offset_minutes = offset;
        }

        let machine = EncounterStateMachine::new(&config);
        if EncounterStateMachine::phase(&record, now) == EncounterPhase::PendingSend {
            record.delivery.next_delivery = machine.plan_next(&record, now);
        }
        self.store.put_engagement_record(&record)?;

        tracing::info!(
            user_id,
            mode = record.delivery_mode.as_str(),
            "Delivery settings updated"
        );
        Ok(UserSnapshot {
            phase: EncounterStateMachine::phase(&record, now),
            record,
        })
    }

    /// One poll step: detect due sends and expired deadlines.
    ///
    /// A due send is dispatched here (content chosen, deadline set) and
    /// returned as `outbound`; the caller delivers it and reports a failure
    /// through [`Self::delivery_failed`].
    pub async fn tick_user(&self, user_id: &str, now: DateTime<Utc>) -> Result<TickOutcome, EngineError> {
        let user_lock = self.acquire_user_lock(user_id).await;
        let _guard = user_lock.lock().await;
        let config = self.config.read().await.clone();

        let Some(mut record) = self.load_record(user_id, &config, now)? else {
            return Ok(TickOutcome::default());
        };
        let before = record.clone();
        let machine = EncounterStateMachine::new(&config);
        let actions = machine.tick(&mut record, now);
        let mut outbound = None;
        let mut finished = Vec::new();

        for action in &actions {
            match action {
                Action::Send { scheduled_for } => {
                    match self.content.select_content(user_id, &record.themes) {
                        Some(content) => {
                            if let Some(deadline) = machine.record_sent(&mut record, Some(content.clone()), now) {
                                tracing::debug!(
                                    user_id,
                                    scheduled_for = %scheduled_for,
                                    deadline = %deadline,
                                    "Encounter dispatched"
                                );
                                outbound = Some(OutboundEncounter {
                                    user_id: user_id.to_string(),
                                    content,
                                    sent_at: now,
                                    deadline,
                                });
                            }
                        }
                        None => {
                            let next = machine.defer(&mut record, now);
                            tracing::warn!(
                                user_id,
                                next_delivery = ?next,
                                "No content for enrolled themes, send deferred"
                            );
                        }
                    }
                }
                Action::Timeout { .. } => finished.extend(encounter_entry(user_id, action, false)),
                Action::Warn { consecutive_failures } => {
                    tracing::warn!(user_id, consecutive_failures, "User keeps missing encounters");
                }
                Action::Resolved { .. } | Action::Ignored { .. } => {}
            }
        }

        if record != before || !finished.is_empty() {
            self.store.commit_engagement(&record, &finished)?;
        }
        Ok(TickOutcome { actions, outbound })
    }

    /// The transport could not deliver: immediate pseudo-timeout.
    pub async fn delivery_failed(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<Action>, EngineError> {
        let user_lock = self.acquire_user_lock(user_id).await;
        let _guard = user_lock.lock().await;
        let config = self.config.read().await.clone();

        let mut record = self.require_record(user_id, &config, now)?;
        let actions = EncounterStateMachine::new(&config).record_delivery_failure(&mut record, None, now);
        let finished: Vec<_> = actions
            .iter()
            .filter_map(|action| encounter_entry(user_id, action, true))
            .collect();
        self.store.commit_engagement(&record, &finished)?;
        Ok(actions)
    }

    /// External response. A late or duplicate resolve yields `Action::Ignored`.
    pub async fn resolve(
        &self,
        user_id: &str,
        responded_at: DateTime<Utc>,
        is_public: bool,
    ) -> Result<Action, EngineError> {
        let user_lock = self.acquire_user_lock(user_id).await;
        let _guard = user_lock.lock().await;
        let config = self.config.read().await.clone();

        let mut record = self.require_record(user_id, &config, responded_at)?;
        let action = EncounterStateMachine::new(&config).resolve(&mut record, responded_at, is_public);

        match &action {
            Action::Resolved { reward, streak_count, .. } => {
                let finished: Vec<_> = encounter_entry(user_id, &action, false).into_iter().collect();
                self.store.commit_engagement(&record, &finished)?;
                tracing::info!(user_id, points = reward.total, streak = streak_count, "Encounter resolved");
            }
            Action::Ignored { reason } => {
                tracing::info!(user_id, reason = ?reason, "Resolve ignored");
            }
            _ => {}
        }
        Ok(action)
    }

    pub fn user_ids(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.store.list_engagement_user_ids()?)
    }

    pub fn recent_encounters(&self, user_id: &str, limit: usize) -> Result<Vec<EncounterLogEntry>, EngineError> {
        Ok(self.store.list_recent_encounters(user_id, limit)?)
    }

    pub fn encounter_stats(&self, user_id: &str) -> Result<EncounterStats, EngineError> {
        Ok(self.store.encounter_stats(user_id)?)
    }
}

/// Log entry for a finished encounter; `None` for actions that finish nothing.
fn encounter_entry(user_id: &str, action: &Action, delivery_failed: bool) -> Option<EncounterLogEntry> {
    let entry = match action {
        Action::Resolved {
            outcome,
            reward,
            is_public,
            content,
            ..
        } => EncounterLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            sent_at: outcome.sent_at,
            resolved_at: outcome.resolved_at,
            theme: content.as_ref().map(|c| c.theme.clone()),
            difficulty: content.as_ref().map(|c| c.difficulty),
            base_points: content.as_ref().map(|c| c.base_points),
            completed: true,
            expired: false,
            delivery_failed: false,
            response_latency_secs: outcome.response_latency_secs,
            speed_bonus: reward.speed_bonus,
            streak_bonus: reward.streak_bonus,
            public_bonus: reward.public_bonus,
            total_points: reward.total,
            was_public: *is_public,
        },
        Action::Timeout {
            outcome,
            content,
            consecutive_failures,
            disable,
            ..
        } => {
            tracing::info!(
                user_id,
                consecutive_failures,
                disable,
                delivery_failed,
                "Encounter expired"
            );
            EncounterLogEntry {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                sent_at: outcome.sent_at,
                resolved_at: outcome.resolved_at,
                theme: content.as_ref().map(|c| c.theme.clone()),
                difficulty: content.as_ref().map(|c| c.difficulty),
                base_points: content.as_ref().map(|c| c.base_points),
                completed: false,
                expired: true,
                delivery_failed,
                response_latency_secs: None,
                speed_bonus: 0,
                streak_bonus: 0,
                public_bonus: 0,
                total_points: 0,
                was_public: false,
            }
        }
        _ => return None,
    };
    Some(entry)
}
