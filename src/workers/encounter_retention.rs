use chrono::{Duration, Utc};

use crate::store::Store;

pub async fn run(store: &Store, retention_days: u32) {
    tracing::debug!("encounter_retention: start");
    let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
    match store.prune_encounters_before(cutoff) {
        Ok(count) => tracing::info!(pruned = count, %cutoff, "encounter_retention: done"),
        Err(e) => tracing::error!(error = %e, "encounter_retention failed"),
    }
}
