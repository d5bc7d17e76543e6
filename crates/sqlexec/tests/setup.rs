use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlexec::{
    Column, ColumnType, Connection, CoreConfig, Cursor, Database, DriverError, Engine, EngineSpec,
    QueryRecord, RlsMethod, Row, ScalarValue,
};
use sqlscript::{LimitMethod, Table};

#[allow(dead_code)]
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What the fake database answers when a statement contains a needle.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum Response {
    Rows(Vec<Column>, Vec<Row>),
    Count(u64),
    Error(String),
    /// Sleep before answering with no rows.
    Delay(Duration),
}

#[derive(Debug, Default)]
struct Shared {
    responses: Mutex<Vec<(String, Response)>>,
    executed: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
    commits: Mutex<usize>,
}

impl Shared {
    fn respond(&self, sql: &str) -> Response {
        self.responses
            .lock()
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, resp)| resp.clone())
            .unwrap_or(Response::Count(0))
    }
}

#[derive(Debug, Clone)]
pub struct FakeEngine {
    pub name: String,
    pub rls_method: RlsMethod,
    pub cancel_tokens: bool,
    pub multiple_as_one: bool,
    shared: Arc<Shared>,
}

#[async_trait]
impl EngineSpec for FakeEngine {
    fn engine(&self) -> &str {
        &self.name
    }

    fn limit_method(&self) -> LimitMethod {
        LimitMethod::Append
    }

    fn rls_method(&self) -> RlsMethod {
        self.rls_method
    }

    fn run_multiple_statements_as_one(&self) -> bool {
        self.multiple_as_one
    }

    async fn get_cancel_query_id(
        &self,
        _cursor: &mut dyn Cursor,
        query: &QueryRecord,
    ) -> Result<Option<String>, DriverError> {
        Ok(self.cancel_tokens.then(|| format!("pid-{}", query.id)))
    }

    async fn cancel_query(&self, _cursor: &mut dyn Cursor, _query: &QueryRecord, token: &str) -> bool {
        self.shared.cancelled.lock().push(token.to_string());
        true
    }
}

#[derive(Debug)]
pub struct FakeDatabase {
    pub id: i64,
    pub name: String,
    pub allow_dml: bool,
    pub columns: HashMap<String, Vec<String>>,
    spec: Arc<FakeEngine>,
    shared: Arc<Shared>,
}

#[allow(dead_code)]
impl FakeDatabase {
    pub fn new(name: &str) -> Self {
        Self::with_engine(name, "postgresql", RlsMethod::Predicate)
    }

    pub fn with_engine(name: &str, engine: &str, rls_method: RlsMethod) -> Self {
        let shared = Arc::new(Shared::default());
        FakeDatabase {
            id: 1,
            name: name.to_string(),
            allow_dml: false,
            columns: HashMap::new(),
            spec: Arc::new(FakeEngine {
                name: engine.to_string(),
                rls_method,
                cancel_tokens: false,
                multiple_as_one: false,
                shared: shared.clone(),
            }),
            shared,
        }
    }

    pub fn with_dml(mut self) -> Self {
        self.allow_dml = true;
        self
    }

    pub fn with_cancel_tokens(mut self) -> Self {
        Arc::make_mut(&mut self.spec).cancel_tokens = true;
        self
    }

    pub fn with_multiple_as_one(mut self) -> Self {
        Arc::make_mut(&mut self.spec).multiple_as_one = true;
        self
    }

    pub fn with_columns(mut self, table: &str, columns: &[&str]) -> Self {
        self.columns
            .insert(table.to_string(), columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Answer statements containing `needle` with `response`. Earlier
    /// registrations win.
    pub fn respond(self, needle: &str, response: Response) -> Self {
        self.shared.responses.lock().push((needle.to_string(), response));
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.shared.executed.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.shared.cancelled.lock().clone()
    }

    pub fn commits(&self) -> usize {
        *self.shared.commits.lock()
    }
}

#[async_trait]
impl Database for FakeDatabase {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn engine_spec(&self) -> Arc<dyn EngineSpec> {
        self.spec.clone()
    }

    fn allow_dml(&self) -> bool {
        self.allow_dml
    }

    async fn get_default_schema(&self, _catalog: Option<&str>) -> Result<Option<String>, DriverError> {
        Ok(Some("public".to_string()))
    }

    async fn get_raw_connection(
        &self,
        _catalog: Option<&str>,
        _schema: Option<&str>,
    ) -> Result<Box<dyn Connection>, DriverError> {
        Ok(Box::new(FakeConnection {
            shared: self.shared.clone(),
        }))
    }

    async fn get_columns(&self, table: &Table) -> Result<Vec<String>, DriverError> {
        let name = table.parts().last().unwrap_or_default();
        self.columns
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::new(format!("no such table: {table}")))
    }
}

struct FakeConnection {
    shared: Arc<Shared>,
}

#[async_trait]
impl Connection for FakeConnection {
    fn cursor(&mut self) -> Result<Box<dyn Cursor>, DriverError> {
        Ok(Box::new(FakeCursor {
            shared: self.shared.clone(),
            current: None,
            rowcount: 0,
        }))
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        *self.shared.commits.lock() += 1;
        Ok(())
    }
}

struct FakeCursor {
    shared: Arc<Shared>,
    current: Option<(Vec<Column>, Vec<Row>)>,
    rowcount: u64,
}

#[async_trait]
impl Cursor for FakeCursor {
    async fn execute(&mut self, sql: &str) -> Result<(), DriverError> {
        self.shared.executed.lock().push(sql.to_string());
        self.current = None;
        self.rowcount = 0;
        match self.shared.respond(sql) {
            Response::Rows(columns, rows) => {
                self.rowcount = rows.len() as u64;
                self.current = Some((columns, rows));
            }
            Response::Count(count) => self.rowcount = count,
            Response::Error(message) => return Err(DriverError::new(message)),
            Response::Delay(delay) => tokio::time::sleep(delay).await,
        }
        Ok(())
    }

    fn description(&self) -> Option<Vec<Column>> {
        self.current.as_ref().map(|(columns, _)| columns.clone())
    }

    async fn fetch_all(&mut self) -> Result<Vec<Row>, DriverError> {
        Ok(self.current.take().map(|(_, rows)| rows).unwrap_or_default())
    }

    fn rowcount(&self) -> u64 {
        self.rowcount
    }
}

/// Two users with ids and names.
#[allow(dead_code)]
pub fn users_rows() -> Response {
    Response::Rows(
        vec![
            Column::new("id", ColumnType::Int64),
            Column::new("name", ColumnType::Utf8),
        ],
        vec![
            vec![ScalarValue::Int64(1), ScalarValue::from("alice")],
            vec![ScalarValue::Int64(2), ScalarValue::from("bob")],
        ],
    )
}

#[allow(dead_code)]
pub fn engine() -> Engine {
    logutil::init_test();
    let mut config = CoreConfig::new();
    config.worker_pool_size = 2;
    Engine::new(config).unwrap()
}
