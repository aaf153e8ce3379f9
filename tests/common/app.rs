use std::sync::Arc;

use axum::Router;
use tempfile::TempDir;
use tokio::sync::broadcast;

use engagement_scheduler::config::{Config, EngagementEnvConfig, TransportConfig, WorkerConfig};
use engagement_scheduler::engagement::config::EngagementConfig;
use engagement_scheduler::engagement::engine::EngagementEngine;
use engagement_scheduler::routes::build_router;
use engagement_scheduler::services::content::StaticContentProvider;
use engagement_scheduler::services::transport::{LogTransport, Transport};
use engagement_scheduler::state::AppState;
use engagement_scheduler::store::Store;

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub store: Arc<Store>,
    pub engine: Arc<EngagementEngine>,
    pub config: Config,
    _temp_dir: TempDir,
}

/// Config built directly so parallel tests never race on env vars.
pub fn test_config(sled_path: String) -> Config {
    Config {
        host: std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
        port: 3000,
        log_level: "info".to_string(),
        log_json: false,
        enable_file_logs: false,
        log_dir: "./logs".to_string(),
        sled_path,
        cors_origin: "http://localhost:5173".to_string(),
        content_catalog_path: None,
        worker: WorkerConfig {
            is_leader: false,
            encounter_retention_days: 90,
            job_timeout_secs: 300,
        },
        engagement: EngagementEnvConfig {
            learning_rate: 0.20,
            penalty_rate: 0.10,
            fast_response_secs: 120,
            disable_threshold: 8,
            warn_threshold: 3,
            poll_interval_secs: 30,
        },
        transport: TransportConfig {
            webhook_url: None,
            webhook_token: None,
            timeout_secs: 10,
        },
    }
}

pub async fn spawn_test_app_with_transport(transport: Arc<dyn Transport>) -> TestApp {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let sled_path = temp_dir.path().join("engagement-test.sled");
    let config = test_config(sled_path.to_string_lossy().to_string());

    let store = Arc::new(Store::open(&config.sled_path).expect("open store"));
    store.run_migrations().expect("run migrations");

    let engine = Arc::new(EngagementEngine::new(
        EngagementConfig::from_env(&config.engagement),
        store.clone(),
        Arc::new(StaticContentProvider::builtin()),
    ));
    let (shutdown_tx, _) = broadcast::channel::<()>(8);

    let state = AppState::new(
        store.clone(),
        engine.clone(),
        transport,
        &config,
        shutdown_tx,
    );
    let app = build_router(state.clone());

    TestApp {
        app,
        state,
        store,
        engine,
        config,
        _temp_dir: temp_dir,
    }
}

pub async fn spawn_test_app() -> TestApp {
    spawn_test_app_with_transport(Arc::new(LogTransport)).await
}
