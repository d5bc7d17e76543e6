mod setup;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use resultstore::InMemoryResultStore;
use sqlexec::query::{CANCEL_QUERY_KEY, EARLY_CANCEL_KEY, ERRORS_KEY, NewQuery, QueryId, QueryUpdate};
use sqlexec::{
    AsyncQueryHandle, CoreConfig, Engine, InMemoryQueryStore, Principal, QueryOptions, QueryRecord,
    QueryStatus, QueryStore,
};

use crate::setup::{FakeDatabase, POLL_INTERVAL, Response, engine, users_rows};

fn engine_with(config: CoreConfig) -> Engine {
    logutil::init_test();
    Engine::new(config).unwrap()
}

async fn wait_for(handle: &AsyncQueryHandle, engine: &Engine, cond: impl Fn(&sqlexec::QueryRecord) -> bool) {
    let id = handle.query_id().unwrap();
    for _ in 0..500 {
        if let Some(record) = engine.query_store().get(id).await {
            if cond(&record) {
                return;
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("condition not reached for query {id}");
}

#[tokio::test]
async fn background_results_round_trip() {
    let test_cases = [true, false];

    for use_arrow in test_cases {
        let mut config = CoreConfig::new();
        config.results_use_msgpack = use_arrow;
        let engine = engine_with(config);
        let db = Arc::new(FakeDatabase::new("mydb").respond("FROM users", users_rows()));
        let exec = engine.executor(db.clone(), Principal::default());

        let sync = exec
            .execute("SELECT * FROM users", QueryOptions::default().with_force_refresh())
            .await
            .unwrap();

        let submitted = Utc::now();
        let handle = exec
            .execute_async("SELECT * FROM users", QueryOptions::default().with_force_refresh())
            .await
            .unwrap();
        let id = handle.query_id().unwrap();
        assert_eq!(QueryStatus::Pending, handle.status());
        assert!(handle.started_at() >= submitted);

        let res = handle.wait(POLL_INTERVAL).await;
        assert_eq!(QueryStatus::Success, res.status, "arrow: {use_arrow}");
        assert!(res.is_cached);
        assert_eq!(Some(id), res.query_id);
        assert_eq!(1, res.statements.len());
        assert_eq!(sync.statements[0].data, res.statements[0].data, "arrow: {use_arrow}");

        let record = engine.query_store().get(id).await.unwrap();
        assert_eq!(QueryStatus::Success, record.status);
        assert_eq!(record.start_time, handle.started_at());
        assert_eq!(2, record.rows);
        assert_eq!(100, record.progress);
        assert!(record.results_key.is_some());
        assert_eq!(
            Some("Running statement 1 out of 1"),
            record.extra_str("progress")
        );

        engine.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn background_mutation() {
    let engine = engine();
    let db = Arc::new(
        FakeDatabase::new("mydb")
            .with_dml()
            .respond("INSERT INTO log", Response::Count(3)),
    );
    let exec = engine.executor(db.clone(), Principal::default());

    for _ in 0..2 {
        let handle = exec
            .execute_async("INSERT INTO log VALUES (1), (2), (3)", QueryOptions::default())
            .await
            .unwrap();
        assert!(handle.query_id().is_some());

        let res = handle.wait(POLL_INTERVAL).await;
        assert_eq!(QueryStatus::Success, res.status);
        assert_eq!(3, res.statements[0].row_count);
        assert!(res.statements[0].data.is_none());
    }
    assert_eq!(2, db.executed().len());
    assert_eq!(2, db.commits());
}

#[tokio::test]
async fn cached_and_dry_runs_complete_immediately() {
    let engine = engine();
    let db = Arc::new(FakeDatabase::new("mydb").respond("FROM users", users_rows()));
    let exec = engine.executor(db.clone(), Principal::default());

    exec.execute("SELECT * FROM users", QueryOptions::default()).await.unwrap();

    let before = Utc::now();
    let handle = exec
        .execute_async("SELECT * FROM users", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(None, handle.query_id());
    assert_eq!(QueryStatus::Success, handle.status());
    assert!(handle.started_at() >= before && handle.started_at() <= Utc::now());
    assert_eq!(QueryStatus::Success, handle.get_status().await);
    let res = handle.get_result().await;
    assert!(res.is_cached);
    assert_eq!(None, res.query_id);
    assert!(!handle.cancel().await);

    let handle = exec
        .execute_async("SELECT id FROM users", QueryOptions::default().with_dry_run())
        .await
        .unwrap();
    assert_eq!(QueryStatus::Success, handle.status());
    let res = handle.get_result().await;
    assert_eq!(QueryStatus::Success, res.status);
    assert_eq!("SELECT id FROM users", res.statements[0].executed_sql);

    assert_eq!(1, db.executed().len());
}

#[tokio::test]
async fn empty_script_in_background() {
    let engine = engine();
    let db = Arc::new(FakeDatabase::new("mydb"));
    let exec = engine.executor(db.clone(), Principal::default());

    let handle = exec
        .execute_async("-- nothing to see", QueryOptions::default())
        .await
        .unwrap();
    let res = handle.wait(POLL_INTERVAL).await;
    assert_eq!(QueryStatus::Success, res.status);
    assert!(res.statements.is_empty());
}

#[tokio::test]
async fn cancel_pending_query() {
    let mut config = CoreConfig::new();
    config.worker_pool_size = 1;
    let engine = engine_with(config);
    let db = Arc::new(
        FakeDatabase::new("mydb")
            .respond("pg_sleep", Response::Delay(Duration::from_millis(300)))
            .respond("FROM users", users_rows()),
    );
    let exec = engine.executor(db.clone(), Principal::default());

    let busy = exec
        .execute_async("SELECT pg_sleep(1)", QueryOptions::default())
        .await
        .unwrap();
    wait_for(&busy, &engine, |record| record.status == QueryStatus::Running).await;

    let queued = exec
        .execute_async("SELECT * FROM users", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(QueryStatus::Pending, queued.get_status().await);
    assert!(queued.cancel().await);

    let record = engine.query_store().get(queued.query_id().unwrap()).await.unwrap();
    assert_eq!(QueryStatus::Stopped, record.status);
    assert!(record.extra_flag(EARLY_CANCEL_KEY));

    assert_eq!(QueryStatus::Success, busy.wait(POLL_INTERVAL).await.status);
    engine.shutdown().await.unwrap();

    assert_eq!(vec!["SELECT pg_sleep(1)"], db.executed());
    let res = queued.get_result().await;
    assert_eq!(QueryStatus::Stopped, res.status);
    assert!(res.statements.is_empty());
}

#[tokio::test]
async fn cancel_running_query() {
    let engine = engine();
    let db = Arc::new(
        FakeDatabase::new("mydb")
            .with_cancel_tokens()
            .respond("pg_sleep", Response::Delay(Duration::from_millis(500))),
    );
    let exec = engine.executor(db.clone(), Principal::default());

    let handle = exec
        .execute_async("SELECT pg_sleep(1); SELECT 2", QueryOptions::default())
        .await
        .unwrap();
    let id = handle.query_id().unwrap();
    wait_for(&handle, &engine, |record| record.extra_str(CANCEL_QUERY_KEY).is_some()).await;

    assert!(handle.cancel().await);
    assert_eq!(vec![format!("pid-{id}")], db.cancelled());

    let res = handle.wait(POLL_INTERVAL).await;
    assert_eq!(QueryStatus::Stopped, res.status);

    engine.shutdown().await.unwrap();
    assert_eq!(vec!["SELECT pg_sleep(1)"], db.executed());
    assert_eq!(QueryStatus::Stopped, handle.get_status().await);
}

/// Query store that stops every query right before a worker claims it.
#[derive(Debug, Default)]
struct CancelOnClaim {
    inner: InMemoryQueryStore,
}

#[async_trait]
impl QueryStore for CancelOnClaim {
    async fn create(&self, query: NewQuery) -> QueryRecord {
        self.inner.create(query).await
    }

    async fn get(&self, id: QueryId) -> Option<QueryRecord> {
        self.inner.get(id).await
    }

    async fn update(&self, id: QueryId, update: QueryUpdate) -> bool {
        self.inner.update(id, update).await
    }

    async fn update_if(&self, id: QueryId, expected: QueryStatus, update: QueryUpdate) -> bool {
        self.inner
            .update(
                id,
                QueryUpdate::status(QueryStatus::Stopped).with_extra(EARLY_CANCEL_KEY, true),
            )
            .await;
        self.inner.update_if(id, expected, update).await
    }
}

#[tokio::test]
async fn cancel_racing_worker_start() {
    logutil::init_test();
    let engine = Engine::with_stores(
        CoreConfig::new(),
        Arc::new(CancelOnClaim::default()),
        Arc::new(InMemoryResultStore::new()),
    )
    .unwrap();
    let db = Arc::new(
        FakeDatabase::new("mydb")
            .with_dml()
            .respond("DELETE FROM users", Response::Count(2)),
    );
    let exec = engine.executor(db.clone(), Principal::default());

    let handle = exec
        .execute_async("DELETE FROM users", QueryOptions::default())
        .await
        .unwrap();
    engine.shutdown().await.unwrap();

    let record = engine.query_store().get(handle.query_id().unwrap()).await.unwrap();
    assert_eq!(QueryStatus::Stopped, record.status);
    assert_eq!(QueryStatus::Stopped, handle.get_status().await);
    assert!(db.executed().is_empty());
    assert_eq!(0, db.commits());
}

#[tokio::test]
async fn cancel_finished_query() {
    let engine = engine();
    let db = Arc::new(FakeDatabase::new("mydb"));
    let exec = engine.executor(db.clone(), Principal::default());

    let handle = exec.execute_async("SELECT 1", QueryOptions::default()).await.unwrap();
    assert_eq!(QueryStatus::Success, handle.wait(POLL_INTERVAL).await.status);
    assert!(!handle.cancel().await);
    assert_eq!(QueryStatus::Success, handle.get_status().await);
}

#[tokio::test]
async fn missing_query() {
    let engine = engine();
    let db = Arc::new(FakeDatabase::new("mydb"));

    let handle = engine.handle(999, db).await;
    assert_eq!(QueryStatus::Failed, handle.status());
    assert_eq!(QueryStatus::Failed, handle.get_status().await);
    let res = handle.get_result().await;
    assert_eq!(QueryStatus::Failed, res.status);
    assert_eq!(Some("Query not found"), res.error_message.as_deref());
    assert!(!handle.cancel().await);
}

#[tokio::test]
async fn handles_recreated_from_ids() {
    let engine = engine();
    let db = Arc::new(FakeDatabase::new("mydb").respond("FROM users", users_rows()));
    let exec = engine.executor(db.clone(), Principal::default());

    let handle = exec
        .execute_async("SELECT * FROM users", QueryOptions::default())
        .await
        .unwrap();
    handle.wait(POLL_INTERVAL).await;

    let other = engine.handle(handle.query_id().unwrap(), db).await;
    assert_eq!(QueryStatus::Success, other.status());
    assert_eq!(handle.started_at(), other.started_at());
    let res = other.get_result().await;
    assert_eq!(QueryStatus::Success, res.status);
    assert_eq!(2, res.statements[0].row_count);
}

#[tokio::test]
async fn results_backend_failure() {
    logutil::init_test();
    let engine = Engine::with_stores(
        CoreConfig::new(),
        Arc::new(InMemoryQueryStore::new()),
        Arc::new(InMemoryResultStore::new().with_max_blob_size(1)),
    )
    .unwrap();
    let db = Arc::new(FakeDatabase::new("mydb").respond("FROM users", users_rows()));
    let exec = engine.executor(db.clone(), Principal::default());

    let handle = exec
        .execute_async("SELECT * FROM users", QueryOptions::default())
        .await
        .unwrap();
    let res = handle.wait(POLL_INTERVAL).await;
    assert_eq!(QueryStatus::Failed, res.status);
    assert_eq!(
        Some("Results backend failure: unable to store query results"),
        res.error_message.as_deref()
    );

    let record = engine.query_store().get(handle.query_id().unwrap()).await.unwrap();
    assert_eq!(None, record.results_key);
    assert_eq!(
        "RESULTS_BACKEND_ERROR",
        record.extra[ERRORS_KEY][0]["error_type"]
    );
}

#[tokio::test]
async fn payload_too_large() {
    let mut config = CoreConfig::new();
    config.payload_max_mb = Some(0.0001);
    let engine = engine_with(config);
    let rows = (0..200)
        .map(|i| vec![sqlexec::ScalarValue::Int64(i), sqlexec::ScalarValue::from(format!("user {i}"))])
        .collect();
    let db = Arc::new(FakeDatabase::new("mydb").respond(
        "FROM users",
        Response::Rows(
            vec![
                sqlexec::Column::new("id", sqlexec::ColumnType::Int64),
                sqlexec::Column::new("name", sqlexec::ColumnType::Utf8),
            ],
            rows,
        ),
    ));
    let exec = engine.executor(db.clone(), Principal::default());

    let handle = exec
        .execute_async("SELECT * FROM users", QueryOptions::default())
        .await
        .unwrap();
    let res = handle.wait(POLL_INTERVAL).await;
    assert_eq!(QueryStatus::Failed, res.status);
    let message = res.error_message.unwrap();
    assert!(message.starts_with("Result too large"), "message: {message}");
}

#[tokio::test]
async fn background_failures() {
    let mut config = CoreConfig::new();
    config.async_time_limit = Duration::from_millis(200);
    let engine = engine_with(config);
    let db = Arc::new(
        FakeDatabase::new("mydb")
            .respond("pg_sleep", Response::Delay(Duration::from_secs(5)))
            .respond("broken", Response::Error("relation \"broken\" does not exist".to_string())),
    );
    let exec = engine.executor(db.clone(), Principal::default());

    let test_cases = [
        ("SELECT pg_sleep(10)", QueryStatus::TimedOut),
        ("SELECT 1; SELECT * FROM broken", QueryStatus::Failed),
    ];
    for (sql, expected) in test_cases {
        let handle = exec.execute_async(sql, QueryOptions::default()).await.unwrap();
        let res = handle.wait(POLL_INTERVAL).await;
        assert_eq!(expected, res.status, "sql: {sql}");
        assert!(res.error_message.is_some(), "sql: {sql}");

        let record = engine.query_store().get(handle.query_id().unwrap()).await.unwrap();
        assert_eq!(expected, record.status, "sql: {sql}");
        assert!(record.end_time.is_some(), "sql: {sql}");
    }
}
