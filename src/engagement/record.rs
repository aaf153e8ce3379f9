//! The persisted per-user record.
//!
//! Field names match the on-disk JSON shape: `availability_distribution`,
//! `next_delivery`, `sent`, `consecutive_failures` and `frequency` sit at the
//! top level. Loading is tolerant: a malformed field is reset to its default
//! and reported as a [`RecordAnomaly`] instead of failing the whole record.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::availability::{AvailabilityModel, Buckets};
use super::clock::LocalClock;
use super::config::EngagementConfig;
use super::planner::{DeliveryMode, FixedTime, MAX_LEGACY_INTERVAL_HOURS, MIN_LEGACY_INTERVAL_HOURS};
use crate::services::content::Content;

const MAX_OFFSET_MINUTES: i32 = 14 * 60;

/// `next_delivery` is the send target while `sent` is `None` and the
/// response deadline once `sent` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryState {
    pub next_delivery: DateTime<Utc>,
    pub sent: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub frequency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementRecord {
    pub user_id: String,
    pub enrolled: bool,
    pub disabled: bool,
    pub themes: Vec<String>,
    pub availability_distribution: Buckets,
    #[serde(flatten)]
    pub delivery: DeliveryState,
    pub streak_count: u32,
    pub delivery_mode: DeliveryMode,
    pub legacy_interval_hours: u32,
    pub fixed_times: Vec<String>,
    pub utc_offset_minutes: i32,
    pub current_encounter: Option<Content>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordAnomaly {
    pub field: &'static str,
    pub reason: String,
}

impl RecordAnomaly {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl EngagementRecord {
    /// A never-enrolled user: uniform prior, default rate, first send after
    /// the initial delay.
    pub fn new(user_id: &str, config: &EngagementConfig, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            enrolled: false,
            disabled: false,
            themes: Vec::new(),
            availability_distribution: AvailabilityModel::new(&config.availability).into_buckets(),
            delivery: DeliveryState {
                next_delivery: initial_delivery(config, now),
                sent: None,
                consecutive_failures: 0,
                frequency: config.frequency.default_frequency,
            },
            streak_count: 0,
            delivery_mode: DeliveryMode::Adaptive,
            legacy_interval_hours: config.planner.default_legacy_interval_hours,
            fixed_times: config.planner.default_fixed_times.clone(),
            utc_offset_minutes: 0,
            current_encounter: None,
        }
    }

    pub fn model(&self, config: &EngagementConfig) -> AvailabilityModel {
        AvailabilityModel::from_buckets(self.availability_distribution, &config.availability)
    }

    pub fn store_model(&mut self, model: AvailabilityModel) {
        self.availability_distribution = model.into_buckets();
    }

    pub fn clock(&self) -> LocalClock {
        LocalClock::from_offset_minutes(self.utc_offset_minutes)
    }

    /// Parsed `fixed_times`, or the configured defaults if the stored list is
    /// unusable.
    pub fn fixed_schedule(&self, config: &EngagementConfig) -> Vec<FixedTime> {
        FixedTime::parse_list(&self.fixed_times)
            .or_else(|| FixedTime::parse_list(&config.planner.default_fixed_times))
            .unwrap_or_default()
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Rebuild a record from stored JSON, repairing what it can.
    ///
    /// Core delivery fields that are missing count as anomalies; the
    /// optional extras silently take their defaults when absent.
    pub fn decode(
        user_id: &str,
        raw: &Value,
        config: &EngagementConfig,
        now: DateTime<Utc>,
    ) -> (Self, Vec<RecordAnomaly>) {
        let mut record = Self::new(user_id, config, now);
        // An unusable target is due right away, so the next tick acts on it.
        record.delivery.next_delivery = now;
        let mut anomalies = Vec::new();

        let Some(obj) = raw.as_object() else {
            anomalies.push(RecordAnomaly::new("record", "not a JSON object"));
            return (record, anomalies);
        };

        let mut reader = FieldReader {
            obj,
            anomalies: &mut anomalies,
        };

        if let Some(enrolled) = reader.optional::<bool>("enrolled") {
            record.enrolled = enrolled;
        }
        if let Some(disabled) = reader.optional::<bool>("disabled") {
            record.disabled = disabled;
        }
        if let Some(themes) = reader.optional::<Vec<String>>("themes") {
            record.themes = themes;
        }

        if let Some(raw) = reader.required::<Vec<f64>>("availability_distribution") {
            match AvailabilityModel::sanitize(&raw, &config.availability) {
                Some(buckets) => record.availability_distribution = buckets,
                None => reader.flag(
                    "availability_distribution",
                    format!("expected {} values within bounds, got {}", super::clock::HOURS_PER_DAY, raw.len()),
                ),
            }
        }

        let next_delivery = reader.timestamp("next_delivery", true);
        let sent = if reader.obj.get("sent").map_or(true, Value::is_null) {
            None
        } else {
            reader.timestamp("sent", false)
        };
        match (next_delivery, sent) {
            (Some(next), sent) => {
                record.delivery.next_delivery = next;
                record.delivery.sent = sent;
            }
            // Without a deadline an outstanding encounter cannot be judged.
            (None, Some(_)) => reader.flag("sent", "dropped because next_delivery is unusable"),
            (None, None) => {}
        }

        if let Some(failures) = reader.required::<u32>("consecutive_failures") {
            record.delivery.consecutive_failures = failures;
        }

        if let Some(frequency) = reader.required::<f64>("frequency") {
            let f = &config.frequency;
            if frequency.is_finite() && (f.min_frequency..=f.max_frequency).contains(&frequency) {
                record.delivery.frequency = frequency;
            } else {
                reader.flag("frequency", format!("{frequency} outside [{}, {}]", f.min_frequency, f.max_frequency));
            }
        }

        if let Some(streak) = reader.optional::<u32>("streak_count") {
            record.streak_count = streak;
        }
        if let Some(mode) = reader.optional::<DeliveryMode>("delivery_mode") {
            record.delivery_mode = mode;
        }
        if let Some(interval) = reader.optional::<u32>("legacy_interval_hours") {
            if (MIN_LEGACY_INTERVAL_HOURS..=MAX_LEGACY_INTERVAL_HOURS).contains(&interval) {
                record.legacy_interval_hours = interval;
            } else {
                reader.flag("legacy_interval_hours", format!("{interval} outside [1, 24]"));
            }
        }
        if let Some(times) = reader.optional::<Vec<String>>("fixed_times") {
            if FixedTime::parse_list(&times).is_some() {
                record.fixed_times = times;
            } else {
                reader.flag("fixed_times", "expected a non-empty list of HH:MM");
            }
        }
        if let Some(offset) = reader.optional::<i32>("utc_offset_minutes") {
            if (-MAX_OFFSET_MINUTES..=MAX_OFFSET_MINUTES).contains(&offset) {
                record.utc_offset_minutes = offset;
            } else {
                reader.flag("utc_offset_minutes", format!("{offset} outside ±{MAX_OFFSET_MINUTES}"));
            }
        }
        if let Some(content) = reader.optional::<Option<Content>>("current_encounter") {
            record.current_encounter = content;
        }

        if record.disabled && record.enrolled {
            reader.flag("enrolled", "disabled records cannot be enrolled");
            record.enrolled = false;
        }

        (record, anomalies)
    }
}

/// First send after `initial_delay_secs`. A delay that cannot be represented
/// sends right away rather than never.
pub fn initial_delivery(config: &EngagementConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    i64::try_from(config.lifecycle.initial_delay_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(now)
}

struct FieldReader<'a> {
    obj: &'a Map<String, Value>,
    anomalies: &'a mut Vec<RecordAnomaly>,
}

impl FieldReader<'_> {
    fn flag(&mut self, field: &'static str, reason: impl Into<String>) {
        self.anomalies.push(RecordAnomaly::new(field, reason));
    }

    fn parse<T: DeserializeOwned>(&mut self, field: &'static str, missing_is_anomaly: bool) -> Option<T> {
        let Some(value) = self.obj.get(field) else {
            if missing_is_anomaly {
                self.flag(field, "missing");
            }
            return None;
        };
        match T::deserialize(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                self.flag(field, e.to_string());
                None
            }
        }
    }

    fn required<T: DeserializeOwned>(&mut self, field: &'static str) -> Option<T> {
        self.parse(field, true)
    }

    fn optional<T: DeserializeOwned>(&mut self, field: &'static str) -> Option<T> {
        self.parse(field, false)
    }

    /// RFC 3339, or a naive ISO-8601 string taken as UTC.
    fn timestamp(&mut self, field: &'static str, missing_is_anomaly: bool) -> Option<DateTime<Utc>> {
        let raw: String = self.parse(field, missing_is_anomaly)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Some(ts.with_timezone(&Utc));
        }
        match NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f") {
            Ok(naive) => Some(naive.and_utc()),
            Err(_) => {
                self.flag(field, format!("unparseable timestamp {raw:?}"));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap()
    }

    fn cfg() -> EngagementConfig {
        EngagementConfig::default()
    }

    #[test]
    fn round_trips_through_json() {
        let mut record = EngagementRecord::new("u1", &cfg(), now());
        record.enrolled = true;
        record.themes = vec!["focus".into()];
        record.delivery.sent = Some(now());
        record.availability_distribution[3] = 0.25;

        let value = record.to_value().unwrap();
        assert_eq!(value["availability_distribution"].as_array().unwrap().len(), 24);
        assert!(value["next_delivery"].is_string());

        let (decoded, anomalies) = EngagementRecord::decode("u1", &value, &cfg(), now());
        assert!(anomalies.is_empty(), "{anomalies:?}");
        assert_eq!(decoded, record);
    }

    #[test]
    fn legacy_shape_loads_with_defaults() {
        let raw = json!({
            "availability_distribution": vec![0.5; 24],
            "next_delivery": "2025-06-02T12:00:00.123456",
            "sent": null,
            "consecutive_failures": 2,
            "frequency": 1.5
        });
        let (record, anomalies) = EngagementRecord::decode("u1", &raw, &cfg(), now());
        assert!(anomalies.is_empty(), "{anomalies:?}");
        assert_eq!(record.delivery.consecutive_failures, 2);
        assert_eq!(record.delivery.frequency, 1.5);
        assert_eq!(record.delivery_mode, DeliveryMode::Adaptive);
        assert_eq!(
            record.delivery.next_delivery.timestamp(),
            Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn malformed_fields_reset_and_are_reported() {
        let raw = json!({
            "availability_distribution": vec![0.5; 20],
            "next_delivery": "2025-06-02T12:00:00Z",
            "sent": "yesterday-ish",
            "consecutive_failures": -3,
            "frequency": 42.0
        });
        let (record, anomalies) = EngagementRecord::decode("u1", &raw, &cfg(), now());

        assert_eq!(record.availability_distribution, [0.5; 24]);
        assert_eq!(record.delivery.sent, None);
        assert_eq!(record.delivery.consecutive_failures, 0);
        assert_eq!(record.delivery.frequency, 1.0);

        let fields: Vec<_> = anomalies.iter().map(|a| a.field).collect();
        for f in ["availability_distribution", "sent", "consecutive_failures", "frequency"] {
            assert!(fields.contains(&f), "missing anomaly for {f}: {fields:?}");
        }
    }

    #[test]
    fn missing_deadline_drops_outstanding_encounter() {
        let raw = json!({
            "availability_distribution": vec![0.5; 24],
            "sent": "2025-06-02T09:00:00Z",
            "consecutive_failures": 0,
            "frequency": 1.0
        });
        let (record, anomalies) = EngagementRecord::decode("u1", &raw, &cfg(), now());
        assert_eq!(record.delivery.sent, None);
        assert!(anomalies.iter().any(|a| a.field == "next_delivery"));
        assert!(anomalies.iter().any(|a| a.field == "sent"));
    }

    #[test]
    fn non_object_yields_fresh_record() {
        let (record, anomalies) = EngagementRecord::decode("u1", &json!([1, 2]), &cfg(), now());
        assert_eq!(anomalies.len(), 1);
        assert!(!record.enrolled);
        assert_eq!(record.delivery.next_delivery, now());
    }

    #[test]
    fn garbage_next_delivery_becomes_due_now() {
        let raw = json!({
            "enrolled": true,
            "themes": ["focus"],
            "availability_distribution": vec![0.5; 24],
            "next_delivery": "garbage",
            "sent": null,
            "consecutive_failures": 0,
            "frequency": 1.0
        });
        let (record, anomalies) = EngagementRecord::decode("u1", &raw, &cfg(), now());
        assert!(anomalies.iter().any(|a| a.field == "next_delivery"));
        assert!(record.enrolled);
        assert_eq!(record.delivery.next_delivery, now());
    }

    #[test]
    fn oversized_initial_delay_sends_immediately() {
        let mut config = cfg();
        config.lifecycle.initial_delay_secs = u64::MAX;
        assert_eq!(initial_delivery(&config, now()), now());

        config.lifecycle.initial_delay_secs = 100_000_000_000_000;
        assert_eq!(initial_delivery(&config, now()), now());
        assert_eq!(EngagementRecord::new("u1", &config, now()).delivery.next_delivery, now());
    }

    #[test]
    fn bad_fixed_times_fall_back() {
        let mut record = EngagementRecord::new("u1", &cfg(), now());
        record.fixed_times = vec!["25:99".into()];
        let schedule = record.fixed_schedule(&cfg());
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule[0].to_string(), "09:00");
    }
}
