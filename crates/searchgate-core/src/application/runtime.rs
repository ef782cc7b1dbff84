//! Assembled runtime

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::domain::locking::LeaseManager;
use crate::domain::queue::IndexingQueueService;
use crate::domain::scheduler::{IndexingScheduler, SchedulerSettings};
use crate::domain::search::{
    EntitySearcher, IndexCatalog, SearchBackend, SearcherSettings, StrategyRegistry,
};
use crate::error::{Error, Result};
use crate::infrastructure::backend::HttpSearchBackend;
use crate::infrastructure::indexer::BackendEntityIndexer;
use crate::infrastructure::sql::{SqlPolicyStore, SqlTableSource};
use crate::storage::{Database, DatabaseConfig};

fn config_error(e: anyhow::Error) -> Error {
    Error::ConfigError(format!("{:#}", e))
}

/// Every service of a running instance, built from one configuration
#[derive(Clone)]
pub struct Searchgate {
    config: Config,
    database: Database,
    backend: Arc<dyn SearchBackend>,
    catalog: IndexCatalog,
    queue: IndexingQueueService,
    leases: LeaseManager,
    scheduler: IndexingScheduler,
    searcher: EntitySearcher,
}

impl fmt::Debug for Searchgate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Searchgate")
            .field("database", &self.database.path())
            .field("backend", &self.backend.kind())
            .field("catalog", &self.catalog)
            .finish()
    }
}

impl Searchgate {
    /// Open the configured database and backend client
    pub async fn open(config: Config) -> Result<Self> {
        config.validate().map_err(config_error)?;

        let path = config.database_path().map_err(config_error)?;
        let database = Database::new(
            DatabaseConfig::with_path(path).max_connections(config.database.max_connections),
        )
        .await
        .map_err(|e| Error::Other(format!("{:#}", e)))?;

        let backend = Arc::new(HttpSearchBackend::from_config(&config.search)?);

        Self::assemble(config, database, backend)
    }

    /// Build the services over an already opened database and backend
    pub fn assemble(
        config: Config,
        database: Database,
        backend: Arc<dyn SearchBackend>,
    ) -> Result<Self> {
        let pool = database.pool().clone();
        let catalog = IndexCatalog::new(
            &config.search.index_prefix,
            config.sources.iter().map(|s| s.entity_type.clone()),
        );
        let tables = Arc::new(SqlTableSource::new(pool.clone(), &config.sources)?);
        let policies = Arc::new(SqlPolicyStore::new(pool.clone(), &config.sources)?);
        let settings = SearcherSettings::from(&config.search);

        let indexer = BackendEntityIndexer::new(backend.clone(), tables.clone(), catalog.clone())
            .with_retry(settings.retry);
        let queue = IndexingQueueService::new(pool.clone(), Arc::new(indexer))
            .with_source(tables)
            .with_claim_ttl(Duration::from_secs(config.queue.claim_ttl_secs));

        let leases = LeaseManager::with_defaults(pool);
        let scheduler = IndexingScheduler::new(
            queue.clone(),
            leases.clone(),
            SchedulerSettings::from(&config.queue),
        );

        let strategies = StrategyRegistry::builtin().with_default(&config.search.default_strategy)?;
        let searcher = EntitySearcher::new(backend.clone(), policies, catalog.clone())
            .with_strategies(strategies)
            .with_settings(settings);

        info!(
            backend = %backend.kind(),
            entity_types = catalog.entity_types().len(),
            "Searchgate services ready"
        );

        Ok(Self {
            config,
            database,
            backend,
            catalog,
            queue,
            leases,
            scheduler,
            searcher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn backend(&self) -> &Arc<dyn SearchBackend> {
        &self.backend
    }

    pub fn catalog(&self) -> &IndexCatalog {
        &self.catalog
    }

    pub fn queue(&self) -> &IndexingQueueService {
        &self.queue
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn scheduler(&self) -> &IndexingScheduler {
        &self.scheduler
    }

    pub fn searcher(&self) -> &EntitySearcher {
        &self.searcher
    }

    pub async fn close(&self) {
        self.database.close().await;
    }
}
