//! Contracts for databases and the engine adapters that drive them.
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use access::ClsAction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlscript::{LimitMethod, Table};

use crate::errors::{DriverError, ErrorInfo, ErrorLevel};
use crate::query::QueryRecord;
use crate::result::{Column, Row};

/// How row level security predicates are injected into a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RlsMethod {
    /// Add predicates to the `WHERE` (or join `ON`) clause.
    Predicate,
    /// Replace each table with `(SELECT * FROM t WHERE ...) AS t`.
    Subquery,
}

/// A cursor on an open connection.
#[async_trait]
pub trait Cursor: Send {
    async fn execute(&mut self, sql: &str) -> Result<(), DriverError>;

    /// Columns of the last executed statement, `None` if it returns no rows.
    fn description(&self) -> Option<Vec<Column>>;

    async fn fetch_all(&mut self) -> Result<Vec<Row>, DriverError>;

    /// Rows affected by the last executed statement.
    fn rowcount(&self) -> u64;
}

/// An open database connection. Closed when dropped.
#[async_trait]
pub trait Connection: Send {
    fn cursor(&mut self) -> Result<Box<dyn Cursor>, DriverError>;

    async fn commit(&mut self) -> Result<(), DriverError>;
}

/// Per engine behavior used when transforming and running statements.
#[async_trait]
pub trait EngineSpec: Debug + Send + Sync {
    /// Engine identifier, also used as the dialect name.
    fn engine(&self) -> &str;

    fn limit_method(&self) -> LimitMethod {
        LimitMethod::Wrap
    }

    fn rls_method(&self) -> RlsMethod {
        RlsMethod::Subquery
    }

    fn allows_sql_comments(&self) -> bool {
        true
    }

    /// Send the whole script to the database as a single block.
    fn run_multiple_statements_as_one(&self) -> bool {
        false
    }

    /// The engine cancels queries itself when their connection goes away.
    fn has_implicit_cancel(&self) -> bool {
        false
    }

    /// Function applied to a column for a column level security action.
    /// `None` means the column is replaced with `NULL`.
    fn cls_function(&self, action: ClsAction) -> Option<&str> {
        match action {
            ClsAction::Hash => Some("HASH"),
            ClsAction::Mask => Some("MASK"),
            ClsAction::Nullify | ClsAction::Hide => None,
        }
    }

    /// Called before a cancel attempt. May flag the record for early
    /// cancellation.
    fn prepare_cancel_query(&self, _query: &mut QueryRecord) {}

    /// Token identifying the running statement, used to cancel it later.
    async fn get_cancel_query_id(
        &self,
        _cursor: &mut dyn Cursor,
        _query: &QueryRecord,
    ) -> Result<Option<String>, DriverError> {
        Ok(None)
    }

    /// Ask the engine to abort the statement identified by `token`.
    async fn cancel_query(&self, _cursor: &mut dyn Cursor, _query: &QueryRecord, _token: &str) -> bool {
        false
    }

    async fn execute(&self, cursor: &mut dyn Cursor, sql: &str) -> Result<(), DriverError> {
        cursor.execute(sql).await
    }

    /// Execute on behalf of a tracked query.
    async fn execute_with_cursor(
        &self,
        cursor: &mut dyn Cursor,
        sql: &str,
        _query: &QueryRecord,
    ) -> Result<(), DriverError> {
        self.execute(cursor, sql).await
    }

    async fn fetch_data(&self, cursor: &mut dyn Cursor) -> Result<Vec<Row>, DriverError> {
        cursor.fetch_all().await
    }

    /// Refine a driver error message into structured errors.
    fn extract_errors(&self, message: &str, _database: &str) -> Vec<ErrorInfo> {
        vec![ErrorInfo::new(message, "GENERIC_DB_ENGINE_ERROR", ErrorLevel::Error)]
    }
}

/// A database registered with the platform.
#[async_trait]
pub trait Database: Debug + Send + Sync {
    fn id(&self) -> i64;

    fn name(&self) -> &str;

    fn engine_spec(&self) -> Arc<dyn EngineSpec>;

    fn allow_dml(&self) -> bool;

    /// Cache timeout for results of this database.
    fn cache_timeout(&self) -> Option<Duration> {
        None
    }

    async fn get_default_catalog(&self) -> Result<Option<String>, DriverError> {
        Ok(None)
    }

    async fn get_default_schema(&self, _catalog: Option<&str>) -> Result<Option<String>, DriverError> {
        Ok(None)
    }

    /// Open a connection pinned to a catalog and schema.
    async fn get_raw_connection(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
    ) -> Result<Box<dyn Connection>, DriverError>;

    /// Column names of a table, used to expand `*` when columns are hidden.
    async fn get_columns(&self, table: &Table) -> Result<Vec<String>, DriverError> {
        Err(DriverError::new(format!("column metadata unavailable for {table}")))
    }

    /// Database specific rewrite applied to each statement right before it
    /// runs.
    fn mutate_sql_based_on_config(&self, sql: &str, _is_split: bool) -> String {
        sql.to_string()
    }
}
