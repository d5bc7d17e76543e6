//! Result values produced by query execution.
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::query::QueryId;

/// A single cell returned by a cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Boolean(v) => write!(f, "{v}"),
            ScalarValue::Int64(v) => write!(f, "{v}"),
            ScalarValue::Float64(v) => write!(f, "{v}"),
            ScalarValue::Utf8(v) => write!(f, "{v}"),
            ScalarValue::Date(v) => write!(f, "{v}"),
            ScalarValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Boolean(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Int64(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Float64(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Utf8(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Utf8(value)
    }
}

impl<T: Into<ScalarValue>> From<Option<T>> for ScalarValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ScalarValue::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Int64,
    Float64,
    Utf8,
    Date,
    Timestamp,
}

impl ColumnType {
    /// Check if a value can be stored in a column of this type.
    pub fn accepts(&self, value: &ScalarValue) -> bool {
        matches!(
            (self, value),
            (_, ScalarValue::Null)
                | (ColumnType::Boolean, ScalarValue::Boolean(_))
                | (ColumnType::Int64, ScalarValue::Int64(_))
                | (ColumnType::Float64, ScalarValue::Float64(_))
                | (ColumnType::Utf8, ScalarValue::Utf8(_))
                | (ColumnType::Date, ScalarValue::Date(_))
                | (ColumnType::Timestamp, ScalarValue::Timestamp(_))
        )
    }
}

/// Column description reported by a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Column {
            name: name.into(),
            column_type,
        }
    }
}

pub type Row = Vec<ScalarValue>;

/// Rows returned by one statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        ResultSet { columns, rows }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Outcome of a single statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    pub original_sql: String,
    /// SQL sent to the database after transformations.
    pub executed_sql: String,
    /// `None` for statements that don't return rows.
    pub data: Option<ResultSet>,
    pub row_count: u64,
    pub execution_time_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Running,
    Success,
    Failed,
    TimedOut,
    Stopped,
}

impl QueryStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Pending => "pending",
            QueryStatus::Running => "running",
            QueryStatus::Success => "success",
            QueryStatus::Failed => "failed",
            QueryStatus::TimedOut => "timed_out",
            QueryStatus::Stopped => "stopped",
        }
    }

    /// No further status changes are expected.
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, QueryStatus::Pending | QueryStatus::Running)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a whole script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub status: QueryStatus,
    pub statements: Vec<StatementResult>,
    pub query_id: Option<QueryId>,
    pub total_execution_time_ms: f64,
    pub error_message: Option<String>,
    pub is_cached: bool,
}

impl QueryResult {
    pub fn success(
        statements: Vec<StatementResult>,
        query_id: Option<QueryId>,
        total_execution_time_ms: f64,
    ) -> Self {
        QueryResult {
            status: QueryStatus::Success,
            statements,
            query_id,
            total_execution_time_ms,
            error_message: None,
            is_cached: false,
        }
    }

    pub fn failure(status: QueryStatus, error_message: impl Into<String>) -> Self {
        QueryResult {
            status,
            statements: Vec::new(),
            query_id: None,
            total_execution_time_ms: 0.0,
            error_message: Some(error_message.into()),
            is_cached: false,
        }
    }

    pub fn with_query_id(mut self, query_id: Option<QueryId>) -> Self {
        self.query_id = query_id;
        self
    }

    /// Sum of row counts over all statements.
    pub fn total_rows(&self) -> u64 {
        self.statements.iter().map(|s| s.row_count).sum()
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }
}
