//! Dialect-aware SQL script model.
//!
//! Scripts are split into statements, each statement is parsed into an AST
//! (or kept as text for the KQL dialect), and the statement exposes the tables
//! it references, whether it mutates data, and any session settings it sets.
pub mod dialect;
pub mod errors;
pub mod kql;
pub mod script;
pub mod statement;
pub mod table;

mod extract;
mod format;
mod split;

pub use dialect::{Backend, Dialect, DialectRegistry, SqlBackend};
pub use errors::{ParseError, Result, ScriptError};
pub use extract::CteScope;
pub use kql::KqlStatement;
pub use script::{Script, Statement};
pub use statement::{CtasMethod, LimitMethod, SettingValue, SqlStatement, parse_expr, sanitize_clause};
pub use table::Table;

pub mod export {
    pub use sqlparser;
}
