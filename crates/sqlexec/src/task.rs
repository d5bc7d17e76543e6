//! Background execution of a queued query.
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::background_jobs::BgJob;
use crate::database::Database;
use crate::engine::EngineState;
use crate::errors::{ExecError, Result};
use crate::executor::{PreparedScript, RunOutcome, StatementRunner, database_error, elapsed_ms};
use crate::payload;
use crate::query::{CANCEL_QUERY_KEY, ERRORS_KEY, QueryId, QueryRecord, QueryUpdate};
use crate::result::{QueryResult, QueryStatus, StatementResult};

/// A prepared script waiting for a worker.
#[derive(Debug)]
pub struct QueryTask {
    state: Arc<EngineState>,
    database: Arc<dyn Database>,
    query_id: QueryId,
    prepared: PreparedScript,
    principal_id: Option<String>,
    queued_at: Instant,
}

impl QueryTask {
    pub(crate) fn new(
        state: Arc<EngineState>,
        database: Arc<dyn Database>,
        query_id: QueryId,
        prepared: PreparedScript,
        principal_id: Option<String>,
    ) -> Self {
        QueryTask {
            state,
            database,
            query_id,
            prepared,
            principal_id,
            queued_at: Instant::now(),
        }
    }

    async fn run(
        &self,
        query: &QueryRecord,
        results: &mut Vec<StatementResult>,
    ) -> Result<RunOutcome> {
        let spec = self.database.engine_spec();
        let mut conn = self
            .database
            .get_raw_connection(query.catalog.as_deref(), query.schema.as_deref())
            .await
            .map_err(|e| database_error(self.database.as_ref(), e))?;
        let mut cursor = conn
            .cursor()
            .map_err(|e| database_error(self.database.as_ref(), e))?;

        let token = spec
            .get_cancel_query_id(cursor.as_mut(), query)
            .await
            .map_err(|e| database_error(self.database.as_ref(), e))?;
        if let Some(token) = token {
            self.state
                .queries
                .update(query.id, QueryUpdate::default().with_extra(CANCEL_QUERY_KEY, token))
                .await;
        }

        let runner = StatementRunner {
            database: self.database.as_ref(),
            engine_spec: spec.as_ref(),
            queries: self.state.queries.as_ref(),
            config: &self.state.config,
            query,
            tracked: true,
        };
        let outcome = runner.run(cursor.as_mut(), &self.prepared.statements, results).await?;

        if outcome == RunOutcome::Completed && self.prepared.has_mutation {
            conn.commit()
                .await
                .map_err(|e| database_error(self.database.as_ref(), e))?;
        }
        Ok(outcome)
    }

    async fn is_stopped(&self) -> bool {
        self.state
            .queries
            .get(self.query_id)
            .await
            .is_some_and(|record| record.is_stopped())
    }

    async fn fail(&self, err: &ExecError) {
        if self.is_stopped().await {
            info!(query_id = self.query_id, error = %err, "stopped query ended with an error");
            return;
        }
        warn!(query_id = self.query_id, error = %err, "background query failed");
        self.state
            .queries
            .update(
                self.query_id,
                QueryUpdate::status(err.query_status())
                    .with_error(err.to_string())
                    .with_results_key(None)
                    .with_end_time(Utc::now())
                    .with_extra(ERRORS_KEY, serde_json::to_value(err.error_infos()).unwrap_or_default()),
            )
            .await;
    }

    /// Serialize, compress and store the result, then point the record at it.
    async fn store(&self, result: QueryResult) -> Result<()> {
        let config = &self.state.config;
        let encoded = payload::encode(&result, config.results_use_msgpack)?;
        if let Some(max) = config.payload_max_bytes() {
            if encoded.len() > max {
                return Err(ExecError::ResultsBackend(format!(
                    "Result too large: {} bytes exceeds the maximum of {max} bytes",
                    encoded.len()
                )));
            }
        }
        let compressed = resultstore::compress(&encoded)?;

        let key = Uuid::new_v4().to_string();
        let stored = self
            .state
            .results
            .set(&key, Bytes::from(compressed), Some(config.results_default_timeout))
            .await;
        if !stored {
            error!(query_id = self.query_id, %key, "failed to write results to the results backend");
            return Err(ExecError::ResultsBackend(
                "Results backend failure: unable to store query results".to_string(),
            ));
        }

        // A stop request during the last statement wins over the result.
        if self.is_stopped().await {
            info!(query_id = self.query_id, "query stopped before results were stored");
            self.state.results.delete(&key).await;
            return Ok(());
        }

        self.state
            .queries
            .update(
                self.query_id,
                QueryUpdate::status(QueryStatus::Success)
                    .with_results_key(Some(key))
                    .with_rows(result.total_rows())
                    .with_progress(100)
                    .with_end_time(Utc::now()),
            )
            .await;
        Ok(())
    }
}

#[async_trait]
impl BgJob for QueryTask {
    fn name(&self) -> String {
        format!("query_{}", self.query_id)
    }

    async fn start(&self) -> Result<()> {
        let queries = &self.state.queries;
        let Some(query) = queries.get(self.query_id).await else {
            warn!(query_id = self.query_id, "query record missing, skipping");
            return Ok(());
        };
        if query.is_stopped() {
            info!(query_id = self.query_id, "query cancelled before it started");
            return Ok(());
        }

        // A cancel landing between the read above and here must win.
        let claimed = queries
            .update_if(self.query_id, QueryStatus::Pending, QueryUpdate::status(QueryStatus::Running))
            .await;
        if !claimed {
            info!(query_id = self.query_id, "query left pending before it started, skipping");
            return Ok(());
        }
        info!(
            query_id = self.query_id,
            principal = ?self.principal_id,
            waited_ms = elapsed_ms(self.queued_at),
            "running background query"
        );

        let limit = self.state.config.async_time_limit;
        let start = Instant::now();
        let mut statements = Vec::new();
        let outcome = match tokio::time::timeout(limit, self.run(&query, &mut statements)).await {
            Ok(res) => res,
            Err(_) => Err(ExecError::timeout(limit.as_secs())),
        };

        match outcome {
            Ok(RunOutcome::Stopped) => {
                info!(query_id = self.query_id, "background query stopped");
            }
            Ok(RunOutcome::Completed) => {
                let result = QueryResult::success(statements, Some(self.query_id), elapsed_ms(start));
                if let Err(err) = self.store(result).await {
                    self.fail(&err).await;
                }
            }
            Err(err) => self.fail(&err).await,
        }
        Ok(())
    }
}
