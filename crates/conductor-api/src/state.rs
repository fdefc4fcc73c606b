//! Application state wiring the engine together.
//!
//! The core engine and definition service are generic over the store and
//! collaborator traits; AppState pins them to the SQLite store and the
//! in-process adapters from `conductor-infra`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use conductor_core::event::EventBus;
use conductor_core::service::definition::DefinitionService;
use conductor_core::workflow::engine::WorkflowEngine;
use conductor_infra::adapter::{BusEventPublisher, BusTaskGateway, LoggingCallProxy};
use conductor_infra::config::{default_data_dir, load_engine_config};
use conductor_infra::crypto::hash::Sha256BodyHasher;
use conductor_infra::sqlite::SqliteWorkflowStore;
use conductor_infra::sqlite::pool::{DatabasePool, database_url};
use conductor_types::config::EngineConfig;
use conductor_types::event::IntegrationEvent;

pub type ConcreteEngine = WorkflowEngine<SqliteWorkflowStore>;
pub type ConcreteDefinitionService = DefinitionService<SqliteWorkflowStore>;

/// Shared state for every CLI command.
#[derive(Clone)]
pub struct AppState {
    pub engine: ConcreteEngine,
    pub definitions: Arc<ConcreteDefinitionService>,
    /// Events the engine sends to the rest of the platform.
    pub outbound: EventBus<IntegrationEvent>,
    pub tasks: Arc<BusTaskGateway>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Resolve the data directory and wire the engine over it.
    ///
    /// One-shot commands exit as soon as they return, so they run
    /// compensation inline; only `serve` keeps it in the background.
    pub async fn init(long_running: bool) -> anyhow::Result<Self> {
        Self::init_at(&default_data_dir(), long_running).await
    }

    pub async fn init_at(data_dir: &Path, long_running: bool) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let mut config = load_engine_config(data_dir).await;
        if !long_running {
            config.compensation.background = false;
        }

        let db_url = format!("{}?mode=rwc", database_url(data_dir));
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("Failed to open database at {db_url}"))?;
        let store = Arc::new(SqliteWorkflowStore::new(db_pool.clone()));

        let outbound = EventBus::new(config.event_bus_capacity);
        let tasks = Arc::new(BusTaskGateway::new(outbound.clone()));

        let engine = WorkflowEngine::standard(
            store.clone(),
            Arc::new(LoggingCallProxy::new()),
            tasks.clone(),
            Arc::new(BusEventPublisher::new(outbound.clone())),
            Arc::new(Sha256BodyHasher::new()),
            config.clone(),
        );

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");

        Ok(Self {
            engine,
            definitions: Arc::new(DefinitionService::new(store)),
            outbound,
            tasks,
            config,
            data_dir: data_dir.to_path_buf(),
            db_pool,
        })
    }
}
