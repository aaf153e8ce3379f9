use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

#[derive(Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub enable_file_logs: bool,
    pub log_dir: String,
    pub sled_path: String,
    pub cors_origin: String,
    pub content_catalog_path: Option<String>,
    pub worker: WorkerConfig,
    pub engagement: EngagementEnvConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub is_leader: bool,
    pub encounter_retention_days: u32,
    pub job_timeout_secs: u64,
}

/// Environment overrides for the tunable engagement constants.
#[derive(Debug, Clone)]
pub struct EngagementEnvConfig {
    pub learning_rate: f64,
    pub penalty_rate: f64,
    pub fast_response_secs: u64,
    pub disable_threshold: u32,
    pub warn_threshold: u32,
    pub poll_interval_secs: u64,
}

#[derive(Clone)]
pub struct TransportConfig {
    /// Log-only delivery when unset.
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    pub timeout_secs: u64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("log_level", &self.log_level)
            .field("log_json", &self.log_json)
            .field("enable_file_logs", &self.enable_file_logs)
            .field("log_dir", &self.log_dir)
            .field("sled_path", &self.sled_path)
            .field("cors_origin", &self.cors_origin)
            .field("content_catalog_path", &self.content_catalog_path)
            .field("worker", &self.worker)
            .field("engagement", &self.engagement)
            .field("transport", &self.transport)
            .finish()
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("webhook_url", &self.webhook_url)
            .field(
                "webhook_token",
                &self.webhook_token.as_ref().map(|_| "***REDACTED***"),
            )
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: env_or_parse("HOST", IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))),
            port: env_or_parse("PORT", 3000_u16),
            log_level: env_or("RUST_LOG", "info"),
            log_json: env_or_bool("LOG_JSON", false),
            enable_file_logs: env_or_bool("ENABLE_FILE_LOGS", false),
            log_dir: env_or("LOG_DIR", "./logs"),
            sled_path: env_or("SLED_PATH", "./data/engagement.sled"),
            cors_origin: env_or("CORS_ORIGIN", "http://localhost:5173"),
            content_catalog_path: env_opt("CONTENT_CATALOG_PATH"),
            worker: WorkerConfig {
                is_leader: env_or_bool("WORKER_LEADER", true),
                encounter_retention_days: env_or_parse("ENCOUNTER_RETENTION_DAYS", 90_u32),
                job_timeout_secs: env_or_parse("WORKER_JOB_TIMEOUT_SECS", 300_u64),
            },
            engagement: EngagementEnvConfig {
                learning_rate: env_or_parse("ENGAGEMENT_LEARNING_RATE", 0.20_f64),
                penalty_rate: env_or_parse("ENGAGEMENT_PENALTY_RATE", 0.10_f64),
                fast_response_secs: env_or_parse("ENGAGEMENT_FAST_RESPONSE_SECS", 120_u64),
                disable_threshold: env_or_parse("ENGAGEMENT_DISABLE_THRESHOLD", 8_u32),
                warn_threshold: env_or_parse("ENGAGEMENT_WARN_THRESHOLD", 3_u32),
                poll_interval_secs: env_or_parse("POLL_INTERVAL_SECS", 30_u64),
            },
            transport: TransportConfig {
                webhook_url: env_opt("TRANSPORT_WEBHOOK_URL"),
                webhook_token: env_opt("TRANSPORT_WEBHOOK_TOKEN"),
                timeout_secs: env_or_parse("TRANSPORT_TIMEOUT_SECS", 10_u64),
            },
        }
    }
}

pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// `None` when unset or blank.
pub fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_or_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(
                    key,
                    value = %raw,
                    "Failed to parse env var, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

pub fn env_or_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}
