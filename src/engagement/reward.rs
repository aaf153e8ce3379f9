use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{BonusStep, RewardConfig};

const TIER_BASIC_MAX: u32 = 45;
const TIER_LIGHT_MAX: u32 = 75;
const TIER_MODERATE_MAX: u32 = 110;
const TIER_DEEP_MAX: u32 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyTier {
    Basic,
    Light,
    Moderate,
    Deep,
    Extreme,
}

impl DifficultyTier {
    /// `< 45` basic, `< 75` light, `< 110` moderate, `< 150` deep, else extreme.
    pub fn from_base_points(points: u32) -> Self {
        if points >= TIER_DEEP_MAX {
            Self::Extreme
        } else if points >= TIER_MODERATE_MAX {
            Self::Deep
        } else if points >= TIER_LIGHT_MAX {
            Self::Moderate
        } else if points >= TIER_BASIC_MAX {
            Self::Light
        } else {
            Self::Basic
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Light => "light",
            Self::Moderate => "moderate",
            Self::Deep => "deep",
            Self::Extreme => "extreme",
        }
    }

    /// Only `extreme` is discounted.
    pub fn multiplier(self, config: &RewardConfig) -> f64 {
        match self {
            Self::Extreme => config.extreme_multiplier,
            _ => 1.0,
        }
    }
}

impl fmt::Display for DifficultyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DifficultyTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "light" => Ok(Self::Light),
            "moderate" => Ok(Self::Moderate),
            "deep" => Ok(Self::Deep),
            "extreme" => Ok(Self::Extreme),
            other => Err(format!("unknown difficulty tier: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewardContext {
    pub base_points: u32,
    pub difficulty_tier: DifficultyTier,
    pub streak_count: u32,
    pub response_latency: Duration,
    pub is_public: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardBreakdown {
    pub base_points: u32,
    pub speed_bonus: u32,
    pub streak_bonus: u32,
    pub public_bonus: u32,
    pub total: u32,
}

#[derive(Debug, Clone)]
pub struct RewardCalculator {
    config: RewardConfig,
}

impl RewardCalculator {
    pub fn new(config: &RewardConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Base × tier multiplier, plus speed and streak bonuses; the public
    /// multiplier applies to that whole sum.
    pub fn breakdown(&self, context: &RewardContext) -> RewardBreakdown {
        let multiplier = context.difficulty_tier.multiplier(&self.config);
        let base_points = (f64::from(context.base_points) * multiplier).max(0.0) as u32;

        // Never more than the prompt itself is worth.
        let speed_bonus = self.speed_bonus(context.response_latency).min(base_points);
        let streak_bonus = self.streak_bonus(context.streak_count);

        let subtotal = base_points
            .saturating_add(speed_bonus)
            .saturating_add(streak_bonus);
        let total = if context.is_public {
            (f64::from(subtotal) * self.config.public_multiplier).max(0.0) as u32
        } else {
            subtotal
        };

        RewardBreakdown {
            base_points,
            speed_bonus,
            streak_bonus,
            public_bonus: total.saturating_sub(subtotal),
            total,
        }
    }

    pub fn speed_bonus(&self, latency: Duration) -> u32 {
        let secs = latency.as_secs();
        self.config
            .speed_bonus_steps
            .iter()
            .find(|step| secs <= step.threshold)
            .map_or(0, |step| step.bonus)
    }

    pub fn streak_bonus(&self, streak_count: u32) -> u32 {
        highest_reached(&self.config.streak_bonus_steps, u64::from(streak_count))
    }
}

fn highest_reached(steps: &[BonusStep], value: u64) -> u32 {
    steps
        .iter()
        .rev()
        .find(|step| value >= step.threshold)
        .map_or(0, |step| step.bonus)
}
