use crate::db::{models::User, users};
use crate::server::exec::ProcessRunner;
use crate::server::notify::NotificationDispatcher;
use crate::server::process_table::ProcTable;
use crate::server::range::store::PgRangeStore;
use crate::server::range::RangeController;
use crate::server::settings::Settings;
use crate::server::template::inventory::HypervisorInventory;
use crate::server::template::registry::BuildRegistry;
use crate::server::template::TemplateService;
use crate::server::workspace::Workspace;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

/// Resolves the owner named by the trusted proxy header
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>>;
}

pub struct PgUserDirectory {
    pool: PgPool,
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        users::find_by_username(&self.pool, username).await
    }
}

/// Full state for HTTP server
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserDirectory>,
    pub ranges: Arc<RangeController>,
    pub templates: Arc<TemplateService>,
}

impl AppState {
    /// Run database migrations
    async fn run_migrations(pool: &PgPool) -> Result<()> {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .context("Failed to run migrations")?;
        tracing::info!("Migrations completed successfully");
        Ok(())
    }

    /// Initialize full state for HTTP server
    pub async fn new_for_server(settings: &Settings) -> Result<Self> {
        tracing::info!("Initializing AppState for HTTP server");

        let db_pool = PgPoolOptions::new()
            .max_connections(settings.database.max_connections)
            .connect(&settings.database.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        tracing::info!("Successfully connected to PostgreSQL");

        Self::run_migrations(&db_pool).await?;

        let workspace = Workspace::new(&settings.paths.install_dir);
        let runner = Arc::new(ProcessRunner::new(settings.executor.max_capture_bytes));
        let processes = Arc::new(ProcTable::default());
        let inventory = Arc::new(
            HypervisorInventory::new(settings.hypervisor.clone())
                .context("Failed to initialize hypervisor inventory")?,
        );

        let ranges = RangeController::new(
            Arc::new(PgRangeStore::new(db_pool.clone())),
            runner.clone(),
            processes.clone(),
            Arc::new(NotificationDispatcher::default()),
            workspace.clone(),
            settings.hypervisor.clone(),
            settings.license.enterprise,
        );

        let templates = TemplateService::new(
            workspace.clone(),
            Arc::new(BuildRegistry::new()),
            runner,
            inventory,
            processes,
            settings.hypervisor.clone(),
            &settings.builds,
        );
        tracing::info!(
            install_dir = %workspace.install_dir().display(),
            max_parallelism = settings.builds.max_parallelism,
            "Initialized range and template services"
        );

        Ok(Self {
            users: Arc::new(PgUserDirectory { pool: db_pool }),
            ranges: Arc::new(ranges),
            templates: Arc::new(templates),
        })
    }
}
