//! Handles to queries running in the background.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use resultstore::{ResultStore, decompress};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::errors::{DriverError, ExecError};
use crate::executor::database_error;
use crate::payload;
use crate::query::{CANCEL_QUERY_KEY, EARLY_CANCEL_KEY, QueryId, QueryRecord, QueryStore, QueryUpdate};
use crate::result::{QueryResult, QueryStatus};

#[derive(Debug, Clone)]
enum HandleState {
    /// Answered without queueing, from the cache or a dry run.
    Completed(Arc<QueryResult>),
    Tracked {
        query_id: QueryId,
        queries: Arc<dyn QueryStore>,
        results: Arc<dyn ResultStore>,
        database: Arc<dyn Database>,
    },
}

/// Status, result and cancellation of a query submitted for background
/// execution.
///
/// All operations read the query record, so a handle may be recreated from a
/// query id by any process sharing the stores.
#[derive(Debug, Clone)]
pub struct AsyncQueryHandle {
    status: QueryStatus,
    started_at: DateTime<Utc>,
    state: HandleState,
}

impl AsyncQueryHandle {
    pub(crate) fn completed(result: QueryResult) -> Self {
        AsyncQueryHandle {
            status: result.status,
            started_at: Utc::now(),
            state: HandleState::Completed(Arc::new(result)),
        }
    }

    pub fn tracked(
        query_id: QueryId,
        status: QueryStatus,
        started_at: DateTime<Utc>,
        queries: Arc<dyn QueryStore>,
        results: Arc<dyn ResultStore>,
        database: Arc<dyn Database>,
    ) -> Self {
        AsyncQueryHandle {
            status,
            started_at,
            state: HandleState::Tracked {
                query_id,
                queries,
                results,
                database,
            },
        }
    }

    /// Id of the tracked query, `None` for completed handles.
    pub fn query_id(&self) -> Option<QueryId> {
        match &self.state {
            HandleState::Completed(result) => result.query_id,
            HandleState::Tracked { query_id, .. } => Some(*query_id),
        }
    }

    /// Status when the handle was created. Use [`Self::get_status`] for the
    /// current one.
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// When the query was submitted.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn get_status(&self) -> QueryStatus {
        match &self.state {
            HandleState::Completed(result) => result.status,
            HandleState::Tracked {
                query_id, queries, ..
            } => queries
                .get(*query_id)
                .await
                .map(|record| record.status)
                .unwrap_or(QueryStatus::Failed),
        }
    }

    pub async fn get_result(&self) -> QueryResult {
        let (query_id, queries, results) = match &self.state {
            HandleState::Completed(result) => return (**result).clone(),
            HandleState::Tracked {
                query_id,
                queries,
                results,
                ..
            } => (*query_id, queries, results),
        };

        let Some(query) = queries.get(query_id).await else {
            return QueryResult::failure(QueryStatus::Failed, "Query not found")
                .with_query_id(Some(query_id));
        };

        if query.status != QueryStatus::Success {
            return QueryResult {
                status: query.status,
                statements: Vec::new(),
                query_id: Some(query_id),
                total_execution_time_ms: 0.0,
                error_message: query.error_message,
                is_cached: false,
            };
        }

        let blob = match &query.results_key {
            Some(key) => results.get(key).await,
            None => None,
        };
        let Some(blob) = blob else {
            warn!(query_id, key = ?query.results_key, "results missing from the results backend");
            return QueryResult::failure(QueryStatus::Failed, "Results not available")
                .with_query_id(Some(query_id));
        };

        let decoded = decompress(&blob)
            .map_err(ExecError::from)
            .and_then(|data| payload::decode(&data));
        match decoded {
            Ok(mut result) => {
                result.query_id = Some(query_id);
                result.is_cached = true;
                result
            }
            Err(err) => {
                QueryResult::failure(QueryStatus::Failed, format!("Error loading results: {err}"))
                    .with_query_id(Some(query_id))
            }
        }
    }

    /// Request cancellation.
    ///
    /// Marks the query stopped so the worker skips remaining statements, then
    /// tries to abort the running statement on the engine. Returns whether the
    /// query is known to be cancelled.
    pub async fn cancel(&self) -> bool {
        let (query_id, queries, database) = match &self.state {
            HandleState::Completed(_) => return false,
            HandleState::Tracked {
                query_id,
                queries,
                database,
                ..
            } => (*query_id, queries, database),
        };

        let Some(mut query) = queries.get(query_id).await else {
            return false;
        };
        if query.status.is_terminal() && query.status != QueryStatus::Stopped {
            debug!(query_id, status = %query.status, "query already finished, nothing to cancel");
            return false;
        }

        let was_pending = query.status == QueryStatus::Pending
            && queries
                .update_if(query_id, QueryStatus::Pending, QueryUpdate::status(QueryStatus::Stopped))
                .await;
        if !was_pending {
            queries
                .update(query_id, QueryUpdate::status(QueryStatus::Stopped))
                .await;
            // A worker may have claimed the query since the first read and
            // written its cancel token.
            if let Some(current) = queries.get(query_id).await {
                query = current;
            }
        }
        query.status = QueryStatus::Stopped;

        let cancelled =
            Self::cancel_on_engine(database.as_ref(), queries.as_ref(), &mut query, was_pending)
                .await;
        info!(query_id, cancelled, "query cancel requested");
        cancelled
    }

    async fn cancel_on_engine(
        database: &dyn Database,
        queries: &dyn QueryStore,
        query: &mut QueryRecord,
        was_pending: bool,
    ) -> bool {
        let spec = database.engine_spec();
        if spec.has_implicit_cancel() {
            return true;
        }

        if was_pending {
            query.extra.insert(EARLY_CANCEL_KEY.to_string(), true.into());
        }
        spec.prepare_cancel_query(query);
        if query.extra_flag(EARLY_CANCEL_KEY) {
            queries
                .update(query.id, QueryUpdate::default().with_extra(EARLY_CANCEL_KEY, true))
                .await;
            return true;
        }

        let Some(token) = query.extra_str(CANCEL_QUERY_KEY).map(|t| t.to_string()) else {
            return false;
        };

        let record: &QueryRecord = query;
        let attempt = async {
            let mut conn = database
                .get_raw_connection(record.catalog.as_deref(), record.schema.as_deref())
                .await?;
            let mut cursor = conn.cursor()?;
            Ok::<_, DriverError>(spec.cancel_query(cursor.as_mut(), record, &token).await)
        };
        match attempt.await {
            Ok(cancelled) => cancelled,
            Err(err) => {
                let err = database_error(database, err);
                warn!(query_id = record.id, error = %err, "failed to cancel query on the engine");
                false
            }
        }
    }

    /// Poll until the query finishes, then return its result.
    pub async fn wait(&self, poll_interval: Duration) -> QueryResult {
        while !self.get_status().await.is_terminal() {
            tokio::time::sleep(poll_interval).await;
        }
        self.get_result().await
    }
}
