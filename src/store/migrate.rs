use crate::engagement::config::EngagementConfig;
use crate::engagement::record::EngagementRecord;
use crate::store::{Store, StoreError};

const VERSION_KEY: &str = "_meta:version";

type MigrationFn = fn(&Store) -> Result<(), StoreError>;

fn migrations() -> Vec<(&'static str, MigrationFn)> {
    vec![
        ("001_initial", m001_initial),
        ("002_normalize_engagement_records", m002_normalize_engagement_records),
    ]
}

/// Apply every migration newer than the stored version.
///
/// Each migration must be idempotent: a crash between `func()` and
/// `set_version()` replays it on the next start. Versions only move forward.
pub fn run(store: &Store) -> Result<(), StoreError> {
    let current = get_current_version(store)?;
    let all = migrations();

    for (index, (name, func)) in all.iter().enumerate() {
        let version = (index + 1) as u32;
        if version > current {
            tracing::info!(version, name, "Running migration");
            func(store)?;
            set_version(store, version)?;
            tracing::info!(version, name, "Migration complete");
        } else {
            tracing::debug!(version, name, "Migration already applied, skipping");
        }
    }

    Ok(())
}

pub fn get_current_version(store: &Store) -> Result<u32, StoreError> {
    match store.config_versions.get(VERSION_KEY.as_bytes())? {
        Some(raw) => {
            let bytes: [u8; 4] = raw.as_ref().try_into().map_err(|_| StoreError::Migration {
                version: 0,
                message: format!("version marker has {} bytes, expected 4", raw.len()),
            })?;
            Ok(u32::from_be_bytes(bytes))
        }
        None => Ok(0),
    }
}

pub fn set_version(store: &Store, version: u32) -> Result<(), StoreError> {
    let current = get_current_version(store)?;
    if version < current {
        return Err(StoreError::Migration {
            version,
            message: format!("Refuse to downgrade from {} to {}", current, version),
        });
    }

    store
        .config_versions
        .insert(VERSION_KEY.as_bytes(), &version.to_be_bytes())?;
    Ok(())
}

fn m001_initial(_store: &Store) -> Result<(), StoreError> {
    Ok(())
}

/// Rewrite imported records into the canonical shape, repairing malformed
/// fields with defaults. Records that are already canonical are left as is.
fn m002_normalize_engagement_records(store: &Store) -> Result<(), StoreError> {
    let config = EngagementConfig::default();
    let now = chrono::Utc::now();
    let mut repaired = 0usize;

    for item in store.engagement_records.iter() {
        let (key, value) = item?;
        let user_id = String::from_utf8_lossy(&key).into_owned();
        let raw: serde_json::Value = match Store::deserialize(&value) {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = %error, "Unreadable engagement record, resetting");
                serde_json::Value::Null
            }
        };

        let (record, anomalies) = EngagementRecord::decode(&user_id, &raw, &config, now);
        let canonical = record.to_value()?;
        if canonical != raw {
            for anomaly in &anomalies {
                tracing::warn!(
                    user_id = %user_id,
                    field = anomaly.field,
                    reason = %anomaly.reason,
                    "Engagement record field reset during migration"
                );
            }
            store.engagement_records.insert(key, Store::serialize(&canonical)?)?;
            repaired += 1;
        }
    }

    tracing::info!(repaired, "Engagement records normalized");
    Ok(())
}
