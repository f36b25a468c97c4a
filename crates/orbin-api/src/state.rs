//! Application state wiring the engine to its SQLite repositories.
//!
//! AppState holds the concrete instances used by both CLI and REST API. The
//! engine is generic over its repository traits; AppState pins it to the
//! infra implementations.

use std::path::PathBuf;
use std::sync::Arc;

use orbin_core::engine::ExecutionEngine;
use orbin_core::event::EventBus;
use orbin_core::trigger::TriggerIngestor;
use orbin_core::worker::HandlerRegistry;
use orbin_infra::config::{data_dir, load_engine_config};
use orbin_infra::handlers::register_builtin_handlers;
use orbin_infra::sqlite::organization::SqliteOrganizationRepository;
use orbin_infra::sqlite::pool::{DatabasePool, default_database_url};
use orbin_infra::sqlite::workflow::SqliteWorkflowRepository;
use orbin_infra::workflow::webhook_handler::WebhookRegistry;
use orbin_types::config::EngineConfig;

pub type Engine = ExecutionEngine<SqliteWorkflowRepository, SqliteOrganizationRepository>;

pub type Ingestor = TriggerIngestor<SqliteWorkflowRepository, SqliteOrganizationRepository>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub ingestor: Ingestor,
    pub webhooks: WebhookRegistry,
    pub handlers: Arc<HandlerRegistry>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Resolve the data directory, load `config.toml`, open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_pool = DatabasePool::new(&default_database_url()).await?;

        Ok(Self::from_parts(db_pool, config, data_dir))
    }

    pub fn from_parts(db_pool: DatabasePool, config: EngineConfig, data_dir: PathBuf) -> Self {
        let event_bus = EventBus::new(config.event_bus_capacity);
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(SqliteWorkflowRepository::new(db_pool.clone())),
            Arc::new(SqliteOrganizationRepository::new(db_pool.clone())),
            event_bus,
            config,
        ));

        let handlers = Arc::new(HandlerRegistry::new());
        register_builtin_handlers(&handlers);

        Self {
            ingestor: TriggerIngestor::new(Arc::clone(&engine)),
            engine,
            webhooks: WebhookRegistry::new(),
            handlers,
            data_dir,
            db_pool,
        }
    }

    /// Rebuild the webhook path table from saved definitions.
    pub async fn sync_webhooks(&self) -> anyhow::Result<usize> {
        let defs = self.engine.list_workflows(None).await?;
        Ok(self.webhooks.sync(&defs))
    }
}
