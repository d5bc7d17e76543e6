use std::sync::Arc;

use chrono::Utc;
use resultstore::{InMemoryResultStore, ResultCache, ResultStore};
use sqlscript::DialectRegistry;
use tracing::info;

use crate::background_jobs::{JobRunner, JobRunnerOpts};
use crate::config::{ConfigSetting, CoreConfig, DialectExtensions};
use crate::database::Database;
use crate::errors::{ExecError, Result};
use crate::executor::SqlExecutor;
use crate::handle::AsyncQueryHandle;
use crate::options::Principal;
use crate::query::{InMemoryQueryStore, QueryId, QueryStore};
use crate::result::{QueryResult, QueryStatus};

/// State shared by every executor and background task of an engine.
#[derive(Debug)]
pub(crate) struct EngineState {
    pub config: Arc<CoreConfig>,
    pub dialects: DialectRegistry,
    /// Results of synchronous executions.
    pub cache: ResultCache<QueryResult>,
    pub queries: Arc<dyn QueryStore>,
    /// Serialized results of background executions.
    pub results: Arc<dyn ResultStore>,
    pub jobs: JobRunner,
}

/// Entry point for running SQL against registered databases.
///
/// Cheap to clone. Must be created from within a tokio runtime since it starts
/// the background worker pool.
#[derive(Debug, Clone)]
pub struct Engine {
    state: Arc<EngineState>,
}

impl Engine {
    /// Create an engine keeping query records and results in memory.
    pub fn new(config: CoreConfig) -> Result<Self> {
        Self::with_stores(
            config,
            Arc::new(InMemoryQueryStore::new()),
            Arc::new(InMemoryResultStore::new()),
        )
    }

    pub fn with_stores(
        config: CoreConfig,
        queries: Arc<dyn QueryStore>,
        results: Arc<dyn ResultStore>,
    ) -> Result<Self> {
        let dialects = DialectRegistry::new()
            .with_extensions(&config.dialect_extensions)
            .map_err(|e| ExecError::InvalidSetting {
                name: DialectExtensions::NAME.to_string(),
                reason: e.to_string(),
            })?;

        let jobs = JobRunner::new(JobRunnerOpts {
            workers: config.worker_pool_size,
            ..Default::default()
        });
        info!(workers = config.worker_pool_size, "sql engine started");

        Ok(Engine {
            state: Arc::new(EngineState {
                config: Arc::new(config),
                dialects,
                cache: ResultCache::new(),
                queries,
                results,
                jobs,
            }),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.state.config
    }

    pub fn query_store(&self) -> &Arc<dyn QueryStore> {
        &self.state.queries
    }

    pub fn result_store(&self) -> &Arc<dyn ResultStore> {
        &self.state.results
    }

    /// Executor running scripts on `database` as `principal`.
    pub fn executor(&self, database: Arc<dyn Database>, principal: Principal) -> SqlExecutor {
        SqlExecutor::new(self.state.clone(), database, principal)
    }

    /// Handle to a previously submitted background query. Unknown ids give
    /// a handle reporting `Failed`.
    pub async fn handle(&self, query_id: QueryId, database: Arc<dyn Database>) -> AsyncQueryHandle {
        let (status, started_at) = match self.state.queries.get(query_id).await {
            Some(record) => (record.status, record.start_time),
            None => (QueryStatus::Failed, Utc::now()),
        };
        AsyncQueryHandle::tracked(
            query_id,
            status,
            started_at,
            self.state.queries.clone(),
            self.state.results.clone(),
            database,
        )
    }

    /// Stop accepting background queries and wait for running ones.
    pub async fn shutdown(&self) -> Result<()> {
        self.state.jobs.close().await
    }
}
