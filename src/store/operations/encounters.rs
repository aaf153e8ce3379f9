use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engagement::reward::DifficultyTier;
use crate::store::keys;
use crate::store::{Store, StoreError};

/// One finished encounter, completed or expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncounterLogEntry {
    pub id: String,
    pub user_id: String,
    pub sent_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub difficulty: Option<DifficultyTier>,
    #[serde(default)]
    pub base_points: Option<u32>,
    pub completed: bool,
    pub expired: bool,
    #[serde(default)]
    pub delivery_failed: bool,
    #[serde(default)]
    pub response_latency_secs: Option<u64>,
    #[serde(default)]
    pub speed_bonus: u32,
    #[serde(default)]
    pub streak_bonus: u32,
    #[serde(default)]
    pub public_bonus: u32,
    #[serde(default)]
    pub total_points: u32,
    #[serde(default)]
    pub was_public: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncounterStats {
    pub total: u64,
    pub completed: u64,
    pub expired: u64,
    pub success_rate: f64,
    pub mean_latency_secs: Option<f64>,
    pub public_count: u64,
    pub total_points: u64,
}

impl EncounterLogEntry {
    pub(crate) fn storage_key(&self) -> Result<String, StoreError> {
        keys::encounter_key(&self.user_id, self.resolved_at.timestamp_millis(), &self.id)
    }
}

impl Store {
    pub fn append_encounter(&self, entry: &EncounterLogEntry) -> Result<(), StoreError> {
        let key = entry.storage_key()?;
        self.encounters
            .insert(key.as_bytes(), Self::serialize(entry)?)?;
        Ok(())
    }

    /// Newest first.
    pub fn list_recent_encounters(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<EncounterLogEntry>, StoreError> {
        let prefix = keys::encounter_prefix(user_id)?;
        let mut entries = Vec::new();
        for item in self.encounters.scan_prefix(prefix.as_bytes()) {
            if entries.len() >= limit {
                break;
            }
            let (_, raw) = item?;
            match Self::deserialize::<EncounterLogEntry>(&raw) {
                Ok(entry) => entries.push(entry),
                Err(error) => {
                    tracing::warn!(user_id, error = %error, "Skipping unreadable encounter entry");
                }
            }
        }
        Ok(entries)
    }

    pub fn encounter_stats(&self, user_id: &str) -> Result<EncounterStats, StoreError> {
        let prefix = keys::encounter_prefix(user_id)?;
        let mut stats = EncounterStats::default();
        let mut latency_sum = 0u64;
        let mut latency_count = 0u64;

        for item in self.encounters.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            let Ok(entry) = Self::deserialize::<EncounterLogEntry>(&raw) else {
                continue;
            };
            stats.total += 1;
            if entry.completed {
                stats.completed += 1;
                if let Some(latency) = entry.response_latency_secs {
                    latency_sum = latency_sum.saturating_add(latency);
                    latency_count += 1;
                }
            }
            if entry.expired {
                stats.expired += 1;
            }
            if entry.was_public {
                stats.public_count += 1;
            }
            stats.total_points += u64::from(entry.total_points);
        }

        if stats.total > 0 {
            stats.success_rate = stats.completed as f64 / stats.total as f64;
        }
        if latency_count > 0 {
            stats.mean_latency_secs = Some(latency_sum as f64 / latency_count as f64);
        }
        Ok(stats)
    }

    /// Remove entries resolved before `cutoff`. Returns how many were removed.
    pub fn prune_encounters_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut batch = sled::Batch::default();
        let mut removed = 0usize;

        for item in self.encounters.iter().keys() {
            let key = item?;
            match keys::encounter_key_timestamp_ms(&key) {
                Some(ts) if ts < cutoff_ms => {
                    batch.remove(key);
                    removed += 1;
                }
                Some(_) => {}
                None => tracing::warn!("Encounter key without timestamp, leaving in place"),
            }
        }

        self.encounters.apply_batch(batch)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    use super::*;

    fn entry(user: &str, id: &str, at: DateTime<Utc>, completed: bool) -> EncounterLogEntry {
        EncounterLogEntry {
            id: id.to_string(),
            user_id: user.to_string(),
            sent_at: at - Duration::minutes(5),
            resolved_at: at,
            theme: Some("focus".into()),
            difficulty: Some(DifficultyTier::Basic),
            base_points: Some(20),
            completed,
            expired: !completed,
            delivery_failed: false,
            response_latency_secs: completed.then_some(300),
            speed_bonus: 0,
            streak_bonus: 0,
            public_bonus: 0,
            total_points: if completed { 25 } else { 0 },
            was_public: false,
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn recent_is_newest_first_and_scoped_to_user() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db").to_str().unwrap()).unwrap();
        for i in 0..5 {
            store
                .append_encounter(&entry("alice", &format!("e{i}"), base() + Duration::hours(i), true))
                .unwrap();
        }
        store.append_encounter(&entry("bob", "b0", base(), true)).unwrap();

        let recent = store.list_recent_encounters("alice", 3).unwrap();
        let ids: Vec<_> = recent.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e4", "e3", "e2"]);
    }

    #[test]
    fn stats_aggregate_outcomes() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db").to_str().unwrap()).unwrap();
        store.append_encounter(&entry("alice", "a", base(), true)).unwrap();
        store
            .append_encounter(&entry("alice", "b", base() + Duration::hours(1), true))
            .unwrap();
        store
            .append_encounter(&entry("alice", "c", base() + Duration::hours(2), false))
            .unwrap();

        let stats = store.encounter_stats("alice").unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.expired, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(stats.mean_latency_secs, Some(300.0));
        assert_eq!(stats.total_points, 50);

        assert_eq!(store.encounter_stats("nobody").unwrap(), EncounterStats::default());
    }

    #[test]
    fn prune_removes_only_old_entries() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db").to_str().unwrap()).unwrap();
        store
            .append_encounter(&entry("alice", "old", base() - Duration::days(100), true))
            .unwrap();
        store.append_encounter(&entry("alice", "new", base(), true)).unwrap();

        let removed = store.prune_encounters_before(base() - Duration::days(90)).unwrap();
        assert_eq!(removed, 1);
        let left = store.list_recent_encounters("alice", 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "new");
    }
}
