//! SQL execution.
//!
//! Scripts are rendered, parsed, rewritten for the caller's access rules,
//! checked, and then run either synchronously with a result cache or on a
//! background worker pool that stores serialized results.
pub mod config;
pub mod database;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod handle;
pub mod options;
pub mod payload;
pub mod query;
pub mod result;
pub mod transform;

mod background_jobs;
mod task;
mod template;

pub use config::CoreConfig;
pub use database::{Connection, Cursor, Database, EngineSpec, RlsMethod};
pub use engine::Engine;
pub use errors::{DriverError, ErrorInfo, ErrorLevel, ExecError, Result};
pub use executor::{PreparedScript, PreparedStatement, SqlExecutor};
pub use handle::AsyncQueryHandle;
pub use options::{CacheOptions, Principal, QueryOptions};
pub use query::{InMemoryQueryStore, NewQuery, QueryId, QueryRecord, QueryStore, QueryUpdate};
pub use result::{Column, ColumnType, QueryResult, QueryStatus, ResultSet, Row, ScalarValue, StatementResult};
