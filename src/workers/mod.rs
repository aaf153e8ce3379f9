pub mod delivery_poll;
pub mod encounter_retention;
pub mod store_flush;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::engagement::engine::EngagementEngine;
use crate::services::transport::Transport;
use crate::store::Store;

/// How often the scheduler wakes the delivery poll. The pass itself is
/// paced by the engine's `poll_interval_secs`.
pub const POLL_HEARTBEAT: Duration = Duration::from_secs(1);

/// Drain period before scheduler shutdown to let in-flight tasks complete.
#[cfg(test)]
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);
#[cfg(not(test))]
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerName {
    DeliveryPoll,
    EncounterRetention,
    StoreFlush,
}

impl WorkerName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeliveryPoll => "delivery_poll",
            Self::EncounterRetention => "encounter_retention",
            Self::StoreFlush => "store_flush",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSchedule {
    Cron(&'static str),
    Every(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: WorkerName,
    pub schedule: JobSchedule,
    pub enabled: bool,
}

pub struct WorkerManager {
    store: Arc<Store>,
    engine: Arc<EngagementEngine>,
    transport: Arc<dyn Transport>,
    shutdown_rx: broadcast::Receiver<()>,
    config: WorkerConfig,
}

impl WorkerManager {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<EngagementEngine>,
        transport: Arc<dyn Transport>,
        shutdown_rx: broadcast::Receiver<()>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            transport,
            shutdown_rx,
            config: config.clone(),
        }
    }

    /// Single source of truth for all planned jobs and their schedules.
    pub fn planned_jobs(&self) -> Vec<JobSpec> {
        if !self.config.is_leader {
            return Vec::new();
        }

        vec![
            JobSpec {
                name: WorkerName::DeliveryPoll,
                schedule: JobSchedule::Every(POLL_HEARTBEAT),
                enabled: true,
            },
            JobSpec {
                name: WorkerName::EncounterRetention,
                schedule: JobSchedule::Cron("0 15 3 * * *"),
                // 0 keeps the log forever
                enabled: self.config.encounter_retention_days > 0,
            },
            JobSpec {
                name: WorkerName::StoreFlush,
                schedule: JobSchedule::Cron("0 */5 * * * *"),
                enabled: true,
            },
        ]
    }

    /// Start the worker scheduler. Returns an error if the scheduler cannot be created or started.
    pub async fn start(mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if !self.config.is_leader {
            tracing::info!("Worker leader disabled; skipping worker startup");
            return Ok(());
        }

        let mut scheduler = JobScheduler::new().await?;

        self.register_jobs(&scheduler).await;

        scheduler.start().await?;

        tracing::info!("Worker manager started");
        let _ = self.shutdown_rx.recv().await;

        tracing::info!(
            "Worker manager shutting down, draining for {}s",
            DRAIN_TIMEOUT.as_secs()
        );
        tokio::time::sleep(DRAIN_TIMEOUT).await;
        let _ = scheduler.shutdown().await;
        Ok(())
    }

    async fn register_jobs(&self, scheduler: &JobScheduler) {
        let timeout = Duration::from_secs(self.config.job_timeout_secs.max(1));

        for spec in self.planned_jobs() {
            if !spec.enabled {
                tracing::info!(name = spec.name.as_str(), "Skipping disabled worker");
                continue;
            }

            let store = self.store.clone();
            let name_str = spec.name.as_str();

            match spec.name {
                WorkerName::DeliveryPoll => {
                    let engine = self.engine.clone();
                    let transport = self.transport.clone();
                    let pacer = Arc::new(delivery_poll::PollPacer::default());
                    add_job(scheduler, spec.schedule, name_str, timeout, move || {
                        let engine = engine.clone();
                        let transport = transport.clone();
                        let pacer = pacer.clone();
                        async move {
                            delivery_poll::run(&engine, transport.as_ref(), &pacer).await;
                        }
                    })
                    .await;
                }
                WorkerName::EncounterRetention => {
                    let retention_days = self.config.encounter_retention_days;
                    add_job(scheduler, spec.schedule, name_str, timeout, move || {
                        let store = store.clone();
                        async move {
                            encounter_retention::run(&store, retention_days).await;
                        }
                    })
                    .await;
                }
                WorkerName::StoreFlush => {
                    add_job(scheduler, spec.schedule, name_str, timeout, move || {
                        let store = store.clone();
                        async move {
                            store_flush::run(&store).await;
                        }
                    })
                    .await;
                }
            }
            tracing::info!(name = name_str, schedule = ?spec.schedule, "Registered worker");
        }
    }
}

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Wrap a job body with an overlap guard and a timeout.
fn guarded<Fut, F>(
    name: &'static str,
    timeout: Duration,
    mut run: F,
) -> impl FnMut(Uuid, JobScheduler) -> JobFuture + Send + Sync + 'static
where
    F: FnMut() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(false));

    move |_uuid: Uuid, _lock: JobScheduler| -> JobFuture {
        let guard = running.clone();

        if guard
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!(
                worker = name,
                "Skipping worker invocation: previous run still in progress"
            );
            return Box::pin(async {});
        }

        let fut = run();
        Box::pin(async move {
            if tokio::time::timeout(timeout, fut).await.is_err() {
                tracing::error!(
                    worker = name,
                    timeout_secs = timeout.as_secs(),
                    "Worker timed out"
                );
            }
            guard.store(false, Ordering::SeqCst);
        })
    }
}

async fn add_job<Fut, F>(
    scheduler: &JobScheduler,
    schedule: JobSchedule,
    name: &'static str,
    timeout: Duration,
    run: F,
) where
    F: FnMut() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let job = match schedule {
        JobSchedule::Cron(cron) => Job::new_async(cron, guarded(name, timeout, run)),
        JobSchedule::Every(every) => Job::new_repeated_async(every, guarded(name, timeout, run)),
    };

    match job {
        Ok(job) => {
            if let Err(err) = scheduler.add(job).await {
                tracing::error!(error = %err, ?schedule, worker = name, "Failed to add worker job");
            }
        }
        Err(err) => {
            tracing::error!(error = %err, ?schedule, worker = name, "Failed to create worker job")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::broadcast;

    use crate::config::Config;
    use crate::engagement::config::EngagementConfig;
    use crate::engagement::engine::EngagementEngine;
    use crate::services::content::StaticContentProvider;
    use crate::services::transport::LogTransport;
    use crate::store::Store;

    use super::*;

    fn manager(dir: &tempfile::TempDir, config: &WorkerConfig) -> WorkerManager {
        let store =
            Arc::new(Store::open(dir.path().join("worker_test.sled").to_str().unwrap()).unwrap());
        let engine = Arc::new(EngagementEngine::new(
            EngagementConfig::default(),
            store.clone(),
            Arc::new(StaticContentProvider::builtin()),
        ));
        let (tx, _) = broadcast::channel(2);
        WorkerManager::new(store, engine, Arc::new(LogTransport), tx.subscribe(), config)
    }

    #[tokio::test]
    async fn leader_switch_controls_job_registration() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut worker_cfg = Config::from_env().worker;
        worker_cfg.is_leader = false;

        assert!(manager(&tmp, &worker_cfg).planned_jobs().is_empty());
    }

    #[tokio::test]
    async fn non_leader_start_returns_immediately() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut worker_cfg = Config::from_env().worker;
        worker_cfg.is_leader = false;

        manager(&tmp, &worker_cfg)
            .start()
            .await
            .expect("non-leader start should succeed");
    }

    #[tokio::test]
    async fn poll_job_runs_on_heartbeat() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut worker_cfg = Config::from_env().worker;
        worker_cfg.is_leader = true;
        worker_cfg.encounter_retention_days = 0;

        let jobs = manager(&tmp, &worker_cfg).planned_jobs();
        let poll = jobs
            .iter()
            .find(|j| j.name == WorkerName::DeliveryPoll)
            .unwrap();
        assert_eq!(poll.schedule, JobSchedule::Every(POLL_HEARTBEAT));
        assert!(poll.enabled);

        let retention = jobs
            .iter()
            .find(|j| j.name == WorkerName::EncounterRetention)
            .unwrap();
        assert!(!retention.enabled);
    }

    #[test]
    fn all_worker_names_have_str() {
        for name in [
            WorkerName::DeliveryPoll,
            WorkerName::EncounterRetention,
            WorkerName::StoreFlush,
        ] {
            assert!(!name.as_str().is_empty(), "{:?} has empty str", name);
        }
    }
}
