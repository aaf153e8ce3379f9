pub const ENGAGEMENT_RECORDS: &str = "engagement_records";
pub const ENCOUNTERS: &str = "encounters";
pub const CONFIG_VERSIONS: &str = "config_versions";
