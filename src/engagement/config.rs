use serde::{Deserialize, Serialize};

/// One week: the planner never looks or falls back further than this.
pub const MAX_PLANNING_HORIZON_HOURS: u32 = 168;
pub const MAX_WINDOW_HOURS: u32 = 720;
pub const MAX_INITIAL_DELAY_SECS: u64 = 86_400;
pub const MAX_POLL_INTERVAL_SECS: u64 = 3_600;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityConfig {
    pub learning_rate: f64,
    pub floor: f64,
    pub ceil: f64,
    /// Uninformative prior for a fresh model
    pub initial_probability: f64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.20,
            floor: 0.1,
            ceil: 1.0,
            initial_probability: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PenaltyConfig {
    /// Rate for the probability-weighted penalty on hours skipped before a response
    pub penalty_rate: f64,
    /// Longest send→resolution window replayed into the model
    #[serde(default = "default_max_window_hours")]
    pub max_window_hours: u32,
}

fn default_max_window_hours() -> u32 {
    336
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            penalty_rate: 0.10,
            max_window_hours: default_max_window_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencyConfig {
    pub default_frequency: f64,
    pub min_frequency: f64,
    pub max_frequency: f64,
    pub fast_success_multiplier: f64,
    pub normal_success_multiplier: f64,
    pub timeout_multiplier: f64,
    /// Responses strictly faster than this count as fast
    pub fast_response_threshold_secs: u64,
    /// Hours added to the adaptive gap per consecutive miss
    #[serde(default = "default_miss_backoff_hours")]
    pub miss_backoff_hours: f64,
}

fn default_miss_backoff_hours() -> f64 {
    4.0
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            default_frequency: 1.0,
            min_frequency: 0.33,
            max_frequency: 6.0,
            fast_success_multiplier: 1.10,
            normal_success_multiplier: 1.05,
            timeout_multiplier: 0.90,
            fast_response_threshold_secs: 120,
            miss_backoff_hours: default_miss_backoff_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerConfig {
    pub lookahead_hours: u32,
    pub fallback_hours: u32,
    pub default_legacy_interval_hours: u32,
    pub default_fixed_times: Vec<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            lookahead_hours: 168,
            fallback_hours: 24,
            default_legacy_interval_hours: 4,
            default_fixed_times: vec!["09:00".into(), "14:00".into(), "19:00".into()],
        }
    }
}

/// A step of a bonus table: `bonus` applies once the input crosses `threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BonusStep {
    pub threshold: u64,
    pub bonus: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardConfig {
    pub extreme_multiplier: f64,
    pub public_multiplier: f64,
    /// Latency ceilings in seconds, ascending. First ceiling not exceeded wins.
    pub speed_bonus_steps: Vec<BonusStep>,
    /// Minimum streak lengths, ascending. Highest reached step wins.
    pub streak_bonus_steps: Vec<BonusStep>,
    /// Base points when the delivered content is unknown
    pub default_base_points: u32,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            extreme_multiplier: 0.8,
            public_multiplier: 2.5,
            speed_bonus_steps: vec![
                BonusStep { threshold: 15, bonus: 30 },
                BonusStep { threshold: 30, bonus: 20 },
                BonusStep { threshold: 60, bonus: 15 },
                BonusStep { threshold: 120, bonus: 10 },
                BonusStep { threshold: 300, bonus: 5 },
            ],
            streak_bonus_steps: vec![
                BonusStep { threshold: 3, bonus: 10 },
                BonusStep { threshold: 5, bonus: 25 },
                BonusStep { threshold: 10, bonus: 50 },
                BonusStep { threshold: 20, bonus: 100 },
            ],
            default_base_points: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleConfig {
    pub disable_threshold: u32,
    pub warn_threshold: u32,
    pub initial_delay_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            disable_threshold: 8,
            warn_threshold: 3,
            initial_delay_secs: 30,
            poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementConfig {
    #[serde(default)]
    pub availability: AvailabilityConfig,
    #[serde(default)]
    pub penalty: PenaltyConfig,
    #[serde(default)]
    pub frequency: FrequencyConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub reward: RewardConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl EngagementConfig {
    pub fn from_env(env_config: &crate::config::EngagementEnvConfig) -> Self {
        let mut config = Self::default();
        config.availability.learning_rate = env_config.learning_rate;
        config.penalty.penalty_rate = env_config.penalty_rate;
        config.frequency.fast_response_threshold_secs = env_config.fast_response_secs;
        config.lifecycle.disable_threshold = env_config.disable_threshold;
        config.lifecycle.warn_threshold = env_config.warn_threshold;
        config.lifecycle.poll_interval_secs = env_config.poll_interval_secs;
        config
    }

    pub fn validate(&self) -> Result<(), String> {
        let a = &self.availability;
        if !(a.learning_rate > 0.0 && a.learning_rate <= 1.0) {
            return Err("availability.learning_rate must be in (0,1]".to_string());
        }
        if !(0.0..=1.0).contains(&a.floor) || !(0.0..=1.0).contains(&a.ceil) {
            return Err("availability.floor and availability.ceil must be in [0,1]".to_string());
        }
        if a.floor >= a.ceil {
            return Err("availability.floor must be < availability.ceil".to_string());
        }
        if !(a.floor..=a.ceil).contains(&a.initial_probability) {
            return Err("availability.initial_probability must be in [floor,ceil]".to_string());
        }

        if !(0.0..=1.0).contains(&self.penalty.penalty_rate) {
            return Err("penalty.penalty_rate must be in [0,1]".to_string());
        }
        if !(1..=MAX_WINDOW_HOURS).contains(&self.penalty.max_window_hours) {
            return Err(format!("penalty.max_window_hours must be in [1,{MAX_WINDOW_HOURS}]"));
        }

        let f = &self.frequency;
        if !(f.min_frequency > 0.0 && f.min_frequency < f.max_frequency) {
            return Err("frequency.min_frequency must be > 0 and < max_frequency".to_string());
        }
        if !(f.min_frequency..=f.max_frequency).contains(&f.default_frequency) {
            return Err("frequency.default_frequency must be in [min,max]".to_string());
        }
        if [f.fast_success_multiplier, f.normal_success_multiplier, f.timeout_multiplier]
            .iter()
            .any(|m| !(m.is_finite() && *m > 0.0))
        {
            return Err("frequency multipliers must be finite and > 0".to_string());
        }
        if !(0.0..=24.0).contains(&f.miss_backoff_hours) {
            return Err("frequency.miss_backoff_hours must be in [0,24]".to_string());
        }

        let p = &self.planner;
        if !(1..=MAX_PLANNING_HORIZON_HOURS).contains(&p.lookahead_hours)
            || !(1..=MAX_PLANNING_HORIZON_HOURS).contains(&p.fallback_hours)
        {
            return Err(format!(
                "planner.lookahead_hours and planner.fallback_hours must be in [1,{MAX_PLANNING_HORIZON_HOURS}]"
            ));
        }
        if !(1..=24).contains(&p.default_legacy_interval_hours) {
            return Err("planner.default_legacy_interval_hours must be in [1,24]".to_string());
        }
        if p.default_fixed_times.is_empty()
            || p
                .default_fixed_times
                .iter()
                .any(|t| t.parse::<super::planner::FixedTime>().is_err())
        {
            return Err("planner.default_fixed_times must be non-empty HH:MM values".to_string());
        }

        let r = &self.reward;
        if r.extreme_multiplier < 0.0 || r.public_multiplier < 0.0 {
            return Err("reward multipliers must be >= 0".to_string());
        }
        if !is_ascending(&r.speed_bonus_steps) || !is_ascending(&r.streak_bonus_steps) {
            return Err("reward bonus steps must have ascending thresholds".to_string());
        }

        let l = &self.lifecycle;
        if l.disable_threshold == 0 {
            return Err("lifecycle.disable_threshold must be > 0".to_string());
        }
        if l.warn_threshold == 0 || l.warn_threshold > l.disable_threshold {
            return Err("lifecycle.warn_threshold must be in [1,disable_threshold]".to_string());
        }
        if l.initial_delay_secs > MAX_INITIAL_DELAY_SECS {
            return Err(format!("lifecycle.initial_delay_secs must be <= {MAX_INITIAL_DELAY_SECS}"));
        }
        if !(1..=MAX_POLL_INTERVAL_SECS).contains(&l.poll_interval_secs) {
            return Err(format!("lifecycle.poll_interval_secs must be in [1,{MAX_POLL_INTERVAL_SECS}]"));
        }

        Ok(())
    }
}

fn is_ascending(steps: &[BonusStep]) -> bool {
    steps.windows(2).all(|w| w[0].threshold < w[1].threshold)
}
