//! Hierarchical data access rules.
//!
//! Rules allow or deny access to a database, catalog, schema or table, and
//! allowed entries may attach row level predicates and column level actions.
pub mod errors;
pub mod eval;
pub mod rules;

pub use errors::{AccessError, Result};
pub use eval::{AccessCheck, AllowedEntry, RlsPredicate, RuleSet, TableAccess};
pub use rules::{AccessRule, ClsAction, RlsRule, RuleEntry};
