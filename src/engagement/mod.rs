//! Adaptive engagement scheduling: learns when each user is reachable,
//! decides when to prompt them next and scores what comes back.

pub mod availability;
pub mod clock;
pub mod config;
pub mod engine;
pub mod frequency;
pub mod penalty;
pub mod planner;
pub mod record;
pub mod reward;
pub mod state_machine;
