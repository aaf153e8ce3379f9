use crate::store::StoreError;

const MAX_ID_LEN: usize = 128;

/// Ids end up inside `:`-separated composite keys, so they must not carry
/// the separator themselves.
fn validate_id(kind: &str, id: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::Validation(format!("{kind} must not be empty")));
    }
    if id.len() > MAX_ID_LEN {
        return Err(StoreError::Validation(format!(
            "{kind} longer than {MAX_ID_LEN} bytes"
        )));
    }
    if id.contains(':') || id.chars().any(char::is_control) {
        return Err(StoreError::Validation(format!(
            "{kind} contains a reserved character"
        )));
    }
    Ok(())
}

fn reverse_ts(timestamp_ms: i64) -> u64 {
    u64::MAX - timestamp_ms.max(0) as u64
}

pub fn engagement_record_key(user_id: &str) -> Result<String, StoreError> {
    validate_id("user_id", user_id)?;
    Ok(user_id.to_string())
}

/// Newest first within a user: `user:{reverse_ts:020}:id`.
pub fn encounter_key(
    user_id: &str,
    timestamp_ms: i64,
    encounter_id: &str,
) -> Result<String, StoreError> {
    validate_id("user_id", user_id)?;
    validate_id("encounter_id", encounter_id)?;
    Ok(format!(
        "{}:{:020}:{}",
        user_id,
        reverse_ts(timestamp_ms),
        encounter_id
    ))
}

pub fn encounter_prefix(user_id: &str) -> Result<String, StoreError> {
    validate_id("user_id", user_id)?;
    Ok(format!("{}:", user_id))
}

/// Reverse timestamp embedded in an encounter key, if it has one.
pub fn encounter_key_timestamp_ms(key: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(key).ok()?;
    let mut parts = text.splitn(3, ':');
    let _user = parts.next()?;
    let reversed: u64 = parts.next()?.parse().ok()?;
    i64::try_from(u64::MAX - reversed).ok()
}

pub fn config_version_key(config_type: &str, version: u32) -> Result<String, StoreError> {
    validate_id("config_type", config_type)?;
    Ok(format!("{}:{:010}", config_type, version))
}

pub fn config_latest_key(config_type: &str) -> Result<String, StoreError> {
    validate_id("config_type", config_type)?;
    Ok(format!("{}:latest", config_type))
}
