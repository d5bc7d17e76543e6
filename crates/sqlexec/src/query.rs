//! Query records tracking the lifecycle of each executed script.
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::result::QueryStatus;

pub type QueryId = u64;

/// Extra key holding the engine cancel token.
pub const CANCEL_QUERY_KEY: &str = "cancel_query";
/// Extra key set when a query is cancelled before it started running.
pub const EARLY_CANCEL_KEY: &str = "early_cancel_query";
/// Extra key holding a human readable progress message.
pub const PROGRESS_KEY: &str = "progress";
/// Extra key holding structured errors of a failed query.
pub const ERRORS_KEY: &str = "errors";

/// Audit and lifecycle record of one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: QueryId,
    /// Client supplied correlation id.
    pub client_id: String,
    pub database_id: i64,
    pub user_id: Option<String>,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    /// SQL as submitted, after template rendering.
    pub sql: String,
    pub executed_sql: Option<String>,
    pub limit: Option<u64>,
    pub status: QueryStatus,
    pub progress: u8,
    pub rows: u64,
    pub results_key: Option<String>,
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub extra: Map<String, Value>,
}

impl QueryRecord {
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn extra_flag(&self, key: &str) -> bool {
        self.extra.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Stopped, or cancelled before a worker picked it up.
    pub fn is_stopped(&self) -> bool {
        self.status == QueryStatus::Stopped || self.extra_flag(EARLY_CANCEL_KEY)
    }
}

/// Fields for a record about to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQuery {
    pub client_id: String,
    pub database_id: i64,
    pub user_id: Option<String>,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub sql: String,
    pub executed_sql: Option<String>,
    pub limit: Option<u64>,
    pub status: QueryStatus,
}

/// Partial update of a record. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryUpdate {
    pub status: Option<QueryStatus>,
    pub progress: Option<u8>,
    pub rows: Option<u64>,
    pub executed_sql: Option<String>,
    /// `Some(None)` clears the key.
    pub results_key: Option<Option<String>>,
    pub error_message: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    pub extra: Vec<(String, Value)>,
}

impl QueryUpdate {
    pub fn status(status: QueryStatus) -> Self {
        QueryUpdate {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn with_executed_sql(mut self, sql: impl Into<String>) -> Self {
        self.executed_sql = Some(sql.into());
        self
    }

    pub fn with_results_key(mut self, key: Option<String>) -> Self {
        self.results_key = Some(key);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    /// Apply the update to a record.
    pub fn apply(self, record: &mut QueryRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(progress) = self.progress {
            record.progress = progress;
        }
        if let Some(rows) = self.rows {
            record.rows = rows;
        }
        if let Some(sql) = self.executed_sql {
            record.executed_sql = Some(sql);
        }
        if let Some(key) = self.results_key {
            record.results_key = key;
        }
        if let Some(message) = self.error_message {
            record.error_message = Some(message);
        }
        if let Some(end_time) = self.end_time {
            record.end_time = Some(end_time);
        }
        for (key, value) in self.extra {
            record.extra.insert(key, value);
        }
    }
}

/// Storage of query records shared by request handlers, workers and
/// cancellation callers.
///
/// Updates are field level and last writer wins, except through
/// [`QueryStore::update_if`]. Readers may see stale data.
#[async_trait]
pub trait QueryStore: Debug + Send + Sync {
    async fn create(&self, query: NewQuery) -> QueryRecord;

    async fn get(&self, id: QueryId) -> Option<QueryRecord>;

    /// Update a record, returning false if it doesn't exist.
    async fn update(&self, id: QueryId, update: QueryUpdate) -> bool;

    /// Update a record only while its status is still `expected`. The check
    /// and the write happen atomically. Returns false if the record is
    /// missing or its status moved on.
    async fn update_if(&self, id: QueryId, expected: QueryStatus, update: QueryUpdate) -> bool;
}

fn log_transition(id: QueryId, record: &QueryRecord, update: &QueryUpdate) {
    if let Some(status) = update.status {
        if status != record.status {
            info!(query_id = id, from = %record.status, to = %status, "query status changed");
        }
    }
}

/// Query store living in process memory. Records are lost on restart and
/// only shared between executors of the same process.
///
/// Nothing is evicted on its own; call [`InMemoryQueryStore::purge_finished`]
/// periodically to bound memory.
#[derive(Debug)]
pub struct InMemoryQueryStore {
    next_id: AtomicU64,
    records: DashMap<QueryId, QueryRecord>,
}

impl InMemoryQueryStore {
    pub fn new() -> Self {
        InMemoryQueryStore {
            next_id: AtomicU64::new(1),
            records: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove finished records whose end time is older than `older_than`.
    /// Pending and running records are always kept. Returns the number of
    /// records removed.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = Utc::now() - age;
        let before = self.records.len();
        self.records.retain(|_, record| {
            !(record.status.is_terminal() && record.end_time.is_some_and(|end| end <= cutoff))
        });
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            info!(removed, "purged finished query records");
        }
        removed
    }
}

impl Default for InMemoryQueryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryStore for InMemoryQueryStore {
    async fn create(&self, query: NewQuery) -> QueryRecord {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = QueryRecord {
            id,
            client_id: query.client_id,
            database_id: query.database_id,
            user_id: query.user_id,
            catalog: query.catalog,
            schema: query.schema,
            sql: query.sql,
            executed_sql: query.executed_sql,
            limit: query.limit,
            status: query.status,
            progress: 0,
            rows: 0,
            results_key: None,
            error_message: None,
            start_time: Utc::now(),
            end_time: None,
            extra: Map::new(),
        };
        info!(query_id = id, status = %record.status, "created query record");
        self.records.insert(id, record.clone());
        record
    }

    async fn get(&self, id: QueryId) -> Option<QueryRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    async fn update(&self, id: QueryId, update: QueryUpdate) -> bool {
        match self.records.get_mut(&id) {
            Some(mut record) => {
                log_transition(id, &record, &update);
                update.apply(&mut record);
                true
            }
            None => false,
        }
    }

    async fn update_if(&self, id: QueryId, expected: QueryStatus, update: QueryUpdate) -> bool {
        match self.records.get_mut(&id) {
            Some(mut record) if record.status == expected => {
                log_transition(id, &record, &update);
                update.apply(&mut record);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_query() -> NewQuery {
        NewQuery {
            client_id: "abc".to_string(),
            database_id: 1,
            user_id: None,
            catalog: None,
            schema: Some("public".to_string()),
            sql: "SELECT 1".to_string(),
            executed_sql: None,
            limit: None,
            status: QueryStatus::Pending,
        }
    }

    #[tokio::test]
    async fn create_and_update() {
        let store = InMemoryQueryStore::new();
        let first = store.create(new_query()).await;
        let second = store.create(new_query()).await;
        assert_ne!(first.id, second.id);

        let updated = store
            .update(
                first.id,
                QueryUpdate::status(QueryStatus::Running)
                    .with_progress(50)
                    .with_extra(CANCEL_QUERY_KEY, "token-1"),
            )
            .await;
        assert!(updated);

        let record = store.get(first.id).await.unwrap();
        assert_eq!(QueryStatus::Running, record.status);
        assert_eq!(50, record.progress);
        assert_eq!(Some("token-1"), record.extra_str(CANCEL_QUERY_KEY));
        assert!(!record.extra_flag(EARLY_CANCEL_KEY));

        assert!(!store.update(999, QueryUpdate::status(QueryStatus::Failed)).await);
    }

    #[tokio::test]
    async fn field_level_updates_keep_other_fields() {
        let store = InMemoryQueryStore::new();
        let record = store.create(new_query()).await;

        store
            .update(record.id, QueryUpdate::status(QueryStatus::Stopped))
            .await;
        store
            .update(record.id, QueryUpdate::default().with_progress(100))
            .await;
        store
            .update(record.id, QueryUpdate::default().with_results_key(Some("k".to_string())))
            .await;
        store
            .update(record.id, QueryUpdate::default().with_results_key(None))
            .await;

        let record = store.get(record.id).await.unwrap();
        assert_eq!(QueryStatus::Stopped, record.status);
        assert_eq!(100, record.progress);
        assert_eq!(None, record.results_key);
    }

    #[tokio::test]
    async fn conditional_updates() {
        let store = InMemoryQueryStore::new();
        let record = store.create(new_query()).await;

        assert!(
            store
                .update_if(record.id, QueryStatus::Pending, QueryUpdate::status(QueryStatus::Running))
                .await
        );
        assert!(
            !store
                .update_if(record.id, QueryStatus::Pending, QueryUpdate::status(QueryStatus::Running))
                .await
        );

        let stopped = store.create(new_query()).await;
        store
            .update(stopped.id, QueryUpdate::status(QueryStatus::Stopped).with_extra(EARLY_CANCEL_KEY, true))
            .await;
        assert!(
            !store
                .update_if(stopped.id, QueryStatus::Pending, QueryUpdate::status(QueryStatus::Running))
                .await
        );
        let stopped = store.get(stopped.id).await.unwrap();
        assert_eq!(QueryStatus::Stopped, stopped.status);
        assert!(stopped.is_stopped());

        assert!(
            !store
                .update_if(999, QueryStatus::Pending, QueryUpdate::status(QueryStatus::Running))
                .await
        );
    }

    #[tokio::test]
    async fn purge_keeps_unfinished_records() {
        let store = InMemoryQueryStore::new();
        let pending = store.create(new_query()).await;
        let running = store.create(new_query()).await;
        let finished = store.create(new_query()).await;
        let recent = store.create(new_query()).await;

        let long_ago = Utc::now() - chrono::Duration::hours(2);
        store
            .update(running.id, QueryUpdate::status(QueryStatus::Running).with_end_time(long_ago))
            .await;
        store
            .update(finished.id, QueryUpdate::status(QueryStatus::Success).with_end_time(long_ago))
            .await;
        store
            .update(recent.id, QueryUpdate::status(QueryStatus::Failed).with_end_time(Utc::now()))
            .await;

        assert_eq!(1, store.purge_finished(Duration::from_secs(3600)));
        assert_eq!(3, store.len());
        assert!(store.get(finished.id).await.is_none());
        for id in [pending.id, running.id, recent.id] {
            assert!(store.get(id).await.is_some(), "id: {id}");
        }

        assert_eq!(1, store.purge_finished(Duration::ZERO));
        assert_eq!(2, store.len());
    }
}
