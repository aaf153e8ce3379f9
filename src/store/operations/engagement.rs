use sled::transaction::TransactionError;
use sled::Transactional;

use crate::engagement::config::EngagementConfig;
use crate::engagement::record::EngagementRecord;
use crate::store::keys;
use crate::store::operations::encounters::EncounterLogEntry;
use crate::store::{Store, StoreError};

const ENGAGEMENT_CONFIG: &str = "engagement_config";

impl Store {
    /// Raw JSON so the caller can repair malformed fields instead of failing.
    pub fn get_engagement_record_raw(
        &self,
        user_id: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let key = keys::engagement_record_key(user_id)?;
        match self.engagement_records.get(key.as_bytes())? {
            Some(raw) => match Self::deserialize(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(error) => {
                    tracing::warn!(user_id, error = %error, "Engagement record is not valid JSON");
                    Ok(Some(serde_json::Value::Null))
                }
            },
            None => Ok(None),
        }
    }

    pub fn put_engagement_record(&self, record: &EngagementRecord) -> Result<(), StoreError> {
        let key = keys::engagement_record_key(&record.user_id)?;
        self.engagement_records
            .insert(key.as_bytes(), Self::serialize(record)?)?;
        Ok(())
    }

    /// Saves the record together with the encounters it just finished. Both
    /// trees change or neither does, so a failed save cannot leave a log
    /// entry behind for an encounter the stored record still has open.
    pub fn commit_engagement(
        &self,
        record: &EngagementRecord,
        finished: &[EncounterLogEntry],
    ) -> Result<(), StoreError> {
        let record_key = keys::engagement_record_key(&record.user_id)?.into_bytes();
        let record_bytes = Self::serialize(record)?;
        let entries = finished
            .iter()
            .map(|entry| Ok((entry.storage_key()?.into_bytes(), Self::serialize(entry)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        (&self.engagement_records, &self.encounters)
            .transaction(|(records, log)| {
                records.insert(record_key.as_slice(), record_bytes.as_slice())?;
                for (key, bytes) in &entries {
                    log.insert(key.as_slice(), bytes.as_slice())?;
                }
                Ok(())
            })
            .map_err(|e: TransactionError<()>| match e {
                TransactionError::Abort(()) => {
                    StoreError::Sled(sled::Error::Unsupported("transaction aborted".into()))
                }
                TransactionError::Storage(se) => StoreError::Sled(se),
            })?;
        Ok(())
    }

    pub fn engagement_record_exists(&self, user_id: &str) -> Result<bool, StoreError> {
        let key = keys::engagement_record_key(user_id)?;
        Ok(self.engagement_records.contains_key(key.as_bytes())?)
    }

    pub fn list_engagement_user_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for item in self.engagement_records.iter().keys() {
            let key = item?;
            match std::str::from_utf8(&key) {
                Ok(id) => ids.push(id.to_string()),
                Err(_) => tracing::warn!("Skipping non-UTF-8 engagement record key"),
            }
        }
        Ok(ids)
    }

    pub fn get_engagement_config(&self) -> Result<Option<EngagementConfig>, StoreError> {
        let key = keys::config_latest_key(ENGAGEMENT_CONFIG)?;
        match self.config_versions.get(key.as_bytes())? {
            Some(raw) => Ok(Some(Self::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Stores the config as the new latest and keeps a numbered copy.
    /// Returns the version number assigned.
    pub fn save_engagement_config(&self, config: &EngagementConfig) -> Result<u32, StoreError> {
        let prefix = format!("{ENGAGEMENT_CONFIG}:");
        let latest = keys::config_latest_key(ENGAGEMENT_CONFIG)?;
        let existing = self
            .config_versions
            .scan_prefix(prefix.as_bytes())
            .keys()
            .filter_map(Result::ok)
            .filter(|k| k.as_ref() != latest.as_bytes())
            .count();
        let version = u32::try_from(existing + 1)
            .map_err(|_| StoreError::Validation("too many config versions".to_string()))?;

        let bytes = Self::serialize(config)?;
        let mut batch = sled::Batch::default();
        batch.insert(keys::config_version_key(ENGAGEMENT_CONFIG, version)?.as_bytes(), bytes.clone());
        batch.insert(latest.as_bytes(), bytes);
        self.config_versions.apply_batch(batch)?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::tempdir;

    use super::*;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db").to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn record_round_trip_and_listing() {
        let (_dir, store) = store();
        let cfg = EngagementConfig::default();
        let record = EngagementRecord::new("alice", &cfg, Utc::now());
        store.put_engagement_record(&record).unwrap();

        let raw = store.get_engagement_record_raw("alice").unwrap().unwrap();
        assert_eq!(raw["user_id"], "alice");
        assert!(store.engagement_record_exists("alice").unwrap());
        assert!(store.get_engagement_record_raw("bob").unwrap().is_none());
        assert_eq!(store.list_engagement_user_ids().unwrap(), vec!["alice".to_string()]);
    }

    #[test]
    fn commit_writes_record_and_log_together() {
        let (_dir, store) = store();
        let cfg = EngagementConfig::default();
        let now = Utc::now();
        let mut record = EngagementRecord::new("alice", &cfg, now);
        record.delivery.consecutive_failures = 1;

        let entry = EncounterLogEntry {
            id: "e1".to_string(),
            user_id: "alice".to_string(),
            sent_at: now - chrono::Duration::hours(2),
            resolved_at: now,
            theme: Some("focus".to_string()),
            difficulty: None,
            base_points: None,
            completed: false,
            expired: true,
            delivery_failed: false,
            response_latency_secs: None,
            speed_bonus: 0,
            streak_bonus: 0,
            public_bonus: 0,
            total_points: 0,
            was_public: false,
        };
        store.commit_engagement(&record, &[entry.clone()]).unwrap();

        let raw = store.get_engagement_record_raw("alice").unwrap().unwrap();
        assert_eq!(raw["consecutive_failures"], 1);
        assert_eq!(store.list_recent_encounters("alice", 10).unwrap(), vec![entry]);

        // Nothing finished: only the record moves.
        record.delivery.consecutive_failures = 2;
        store.commit_engagement(&record, &[]).unwrap();
        let raw = store.get_engagement_record_raw("alice").unwrap().unwrap();
        assert_eq!(raw["consecutive_failures"], 2);
        assert_eq!(store.list_recent_encounters("alice", 10).unwrap().len(), 1);
    }

    #[test]
    fn commit_rejects_invalid_user_id_without_writing() {
        let (_dir, store) = store();
        let record = EngagementRecord::new("a:b", &EngagementConfig::default(), Utc::now());
        assert!(store.commit_engagement(&record, &[]).is_err());
        assert!(store.list_engagement_user_ids().unwrap().is_empty());
    }

    #[test]
    fn corrupt_bytes_surface_as_null() {
        let (_dir, store) = store();
        store.engagement_records.insert("alice", b"{not json".to_vec()).unwrap();
        assert_eq!(
            store.get_engagement_record_raw("alice").unwrap(),
            Some(serde_json::Value::Null)
        );
    }

    #[test]
    fn config_versions_accumulate() {
        let (_dir, store) = store();
        assert!(store.get_engagement_config().unwrap().is_none());

        let mut cfg = EngagementConfig::default();
        assert_eq!(store.save_engagement_config(&cfg).unwrap(), 1);
        cfg.lifecycle.disable_threshold = 5;
        assert_eq!(store.save_engagement_config(&cfg).unwrap(), 2);

        let loaded = store.get_engagement_config().unwrap().unwrap();
        assert_eq!(loaded.lifecycle.disable_threshold, 5);
    }
}
