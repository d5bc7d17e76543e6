//! AST walks: referenced tables, CTE scoping, mutations, settings and
//! function calls.
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

use sqlparser::ast::{
    Expr, Ident, ObjectName, Query, ShowCreateObject, Statement, TableFactor, Value, Visit, Visitor,
    visit_expressions, visit_statements,
};

use crate::statement::SettingValue;
use crate::table::Table;

/// CTE names bound by one query.
#[derive(Debug)]
struct CteFrame {
    names: Vec<String>,
    bodies: Vec<*const Query>,
    recursive: bool,
    /// Number of leading CTEs visible at the current point of the walk.
    visible: usize,
}

/// Tracks which CTE names are in scope while walking an AST.
///
/// Each query pushes a frame. A CTE is only visible inside the bodies of CTEs
/// declared after it (or its own body when the `WITH` is recursive) and in the
/// main body of its query.
#[derive(Debug, Default)]
pub struct CteScope {
    frames: Vec<CteFrame>,
}

impl CteScope {
    pub fn enter_query(&mut self, query: &Query) {
        if let Some(frame) = self.frames.last_mut() {
            if let Some(idx) = frame.bodies.iter().position(|b| std::ptr::eq(*b, query)) {
                frame.visible = if frame.recursive { idx + 1 } else { idx };
            }
        }

        let (names, bodies, recursive) = match &query.with {
            Some(with) => (
                with.cte_tables
                    .iter()
                    .map(|cte| normalize_ident(&cte.alias.name))
                    .collect(),
                with.cte_tables
                    .iter()
                    .map(|cte| cte.query.as_ref() as *const Query)
                    .collect(),
                with.recursive,
            ),
            None => (Vec::new(), Vec::new(), false),
        };
        let visible = names.len();

        self.frames.push(CteFrame {
            names,
            bodies,
            recursive,
            visible,
        });
    }

    pub fn exit_query(&mut self, query: &Query) {
        self.frames.pop();
        if let Some(frame) = self.frames.last_mut() {
            if let Some(idx) = frame.bodies.iter().position(|b| std::ptr::eq(*b, query)) {
                frame.visible = idx + 1;
            }
        }
    }

    /// Check if an unqualified relation name refers to a CTE in scope.
    pub fn is_cte(&self, name: &ObjectName) -> bool {
        if name.0.len() != 1 {
            return false;
        }
        let name = normalize_ident(&name.0[0]);
        self.frames
            .iter()
            .any(|frame| frame.names[..frame.visible.min(frame.names.len())].contains(&name))
    }
}

fn normalize_ident(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

#[derive(Debug, Default)]
struct TableCollector {
    scope: CteScope,
    skip_next_relation: bool,
    tables: BTreeSet<Table>,
}

impl Visitor for TableCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        self.scope.enter_query(query);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        self.scope.exit_query(query);
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<()> {
        // Table valued functions share the relation node with tables.
        if let TableFactor::Table { args: Some(_), .. } = factor {
            self.skip_next_relation = true;
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<()> {
        if std::mem::take(&mut self.skip_next_relation) {
            return ControlFlow::Continue(());
        }
        if self.scope.is_cte(relation) {
            return ControlFlow::Continue(());
        }
        if let Some(table) = Table::from_object_name(relation) {
            self.tables.insert(table);
        }
        ControlFlow::Continue(())
    }
}

/// Collect the tables referenced by a statement, excluding CTE names.
pub(crate) fn extract_tables(statement: &Statement) -> BTreeSet<Table> {
    match statement {
        // SHOW statements don't have regular sources. Only the ones naming a
        // table contribute.
        Statement::ShowColumns { show_options, .. } => show_options
            .show_in
            .as_ref()
            .and_then(|show_in| show_in.parent_name.as_ref())
            .and_then(Table::from_object_name)
            .into_iter()
            .collect(),
        Statement::ShowCreate { obj_type, obj_name } => match obj_type {
            ShowCreateObject::Table | ShowCreateObject::View => {
                Table::from_object_name(obj_name).into_iter().collect()
            }
            _ => BTreeSet::new(),
        },
        other if other.to_string().starts_with("SHOW ") => BTreeSet::new(),
        other => {
            let mut collector = TableCollector::default();
            let _ = other.visit(&mut collector);
            collector.tables
        }
    }
}

/// Leading keywords of statements that change persistent state.
const MUTATING_KEYWORDS: &[&str] = &[
    "ALTER", "CREATE", "DELETE", "DROP", "INSERT", "LOAD", "MERGE", "RENAME", "REPLACE",
    "TRUNCATE", "UPDATE", "UPSERT",
];

/// Statement kinds that change persistent state on their own.
fn is_mutating_kind(statement: &Statement) -> bool {
    match statement {
        Statement::Insert(_)
        | Statement::Update { .. }
        | Statement::Delete(_)
        | Statement::Merge { .. }
        | Statement::Truncate { .. }
        | Statement::CopyIntoSnowflake { .. }
        | Statement::Msck { .. }
        | Statement::CreateView { .. }
        | Statement::CreateTable(_)
        | Statement::CreateIndex(_)
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::AlterTable { .. }
        | Statement::AlterView { .. }
        | Statement::Drop { .. } => true,
        // COPY ... TO only reads.
        Statement::Copy { to, .. } => !*to,
        Statement::Query(_) | Statement::Explain { .. } => false,
        other => {
            let sql = other.to_string();
            let keyword = sql.split_whitespace().next().unwrap_or_default().to_uppercase();
            MUTATING_KEYWORDS.contains(&keyword.as_str())
        }
    }
}

/// Check if executing the statement can change persistent state.
///
/// `EXPLAIN ANALYZE` runs its inner statement, plain `EXPLAIN` does not.
/// Queries are searched for data-modifying statements nested in CTEs.
pub(crate) fn is_mutating(statement: &Statement) -> bool {
    match statement {
        Statement::Explain {
            analyze, statement, ..
        } => *analyze && is_mutating(statement),
        other => visit_statements(other, |s| {
            if is_mutating_kind(s) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .is_break(),
    }
}

fn setting_value(expr: &Expr) -> String {
    match expr {
        Expr::Value(Value::SingleQuotedString(s) | Value::DoubleQuotedString(s)) => s.clone(),
        Expr::Identifier(ident) => ident.value.clone(),
        other => other.to_string(),
    }
}

/// Collect `SET name = value` pairs.
pub(crate) fn extract_settings(statement: &Statement) -> BTreeMap<String, SettingValue> {
    let mut settings = BTreeMap::new();
    let _ = visit_statements(statement, |s| {
        match s {
            Statement::SetVariable {
                variables, value, ..
            } => {
                if variables.len() == 1 {
                    let joined = value.iter().map(setting_value).collect::<Vec<_>>().join(", ");
                    settings.insert(variables[0].to_string(), SettingValue::Text(joined));
                } else {
                    for (name, value) in variables.iter().zip(value.iter()) {
                        settings.insert(name.to_string(), SettingValue::Text(setting_value(value)));
                    }
                }
            }
            Statement::SetTimeZone { value, .. } => {
                settings.insert("time zone".to_string(), SettingValue::Text(setting_value(value)));
            }
            _ => (),
        }
        ControlFlow::<()>::Continue(())
    });
    settings
}

/// Upper-cased names of every function called in the statement.
pub(crate) fn function_names(statement: &Statement) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let _ = visit_expressions(statement, |expr| {
        if let Expr::Function(func) = expr {
            if let Some(last) = func.name.0.last() {
                names.insert(last.value.to_uppercase());
            }
        }
        ControlFlow::<()>::Continue(())
    });
    names
}

#[cfg(test)]
mod tests {
    use sqlparser::dialect::PostgreSqlDialect;
    use sqlparser::parser::Parser;

    use super::*;

    fn parse(sql: &str) -> Statement {
        Parser::parse_sql(&PostgreSqlDialect {}, sql).unwrap().remove(0)
    }

    fn tables(sql: &str) -> Vec<String> {
        extract_tables(&parse(sql)).into_iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn extract_tables_basic() {
        let test_cases: [(&str, &[&str]); 10] = [
            ("SELECT * FROM users", &["users"]),
            ("SELECT * FROM public.users u JOIN orders o ON u.id = o.uid", &["orders", "public.users"]),
            ("WITH q1 AS (SELECT * FROM src) SELECT * FROM q1", &["src"]),
            ("SELECT * FROM (SELECT * FROM inner_t) AS sub", &["inner_t"]),
            ("SELECT * FROM a WHERE id IN (SELECT id FROM b)", &["a", "b"]),
            ("INSERT INTO log SELECT * FROM events", &["events", "log"]),
            ("UPDATE t SET a = 1 WHERE b IN (SELECT b FROM s)", &["s", "t"]),
            ("SELECT * FROM generate_series(1, 10)", &[]),
            ("SELECT 1", &[]),
            ("SHOW COLUMNS FROM users", &["users"]),
        ];

        for (sql, expected) in test_cases {
            assert_eq!(expected.to_vec(), tables(sql), "sql: {sql}");
        }
    }

    #[test]
    fn cte_does_not_shadow_itself() {
        // The body of a non-recursive CTE sees the real table.
        assert_eq!(vec!["secret"], tables("WITH secret AS (SELECT * FROM secret) SELECT * FROM secret"));
        // A later CTE sees an earlier one.
        assert_eq!(
            vec!["src"],
            tables("WITH a AS (SELECT * FROM src), b AS (SELECT * FROM a) SELECT * FROM b")
        );
        // An earlier CTE does not see a later one.
        assert_eq!(
            vec!["b"],
            tables("WITH a AS (SELECT * FROM b), b AS (SELECT 1) SELECT * FROM a")
        );
    }

    #[test]
    fn cte_scope_ends_with_query() {
        assert_eq!(
            vec!["q"],
            tables("SELECT * FROM (WITH q AS (SELECT 1) SELECT * FROM q) AS x JOIN q ON true")
        );
    }

    #[test]
    fn recursive_cte() {
        assert_eq!(
            vec!["edges"],
            tables(
                "WITH RECURSIVE walk AS (SELECT * FROM edges UNION ALL SELECT e.* FROM edges e JOIN walk w ON e.src = w.dst) SELECT * FROM walk"
            )
        );
    }

    #[test]
    fn mutations() {
        let test_cases = [
            ("SELECT 1", false),
            ("INSERT INTO t VALUES (1)", true),
            ("UPDATE t SET a = 1", true),
            ("DELETE FROM t", true),
            ("CREATE TABLE t (a INT)", true),
            ("DROP TABLE t", true),
            ("TRUNCATE t", true),
            ("ALTER TABLE t ADD COLUMN b INT", true),
            ("EXPLAIN SELECT 1", false),
            ("EXPLAIN INSERT INTO t VALUES (1)", false),
            ("EXPLAIN ANALYZE INSERT INTO t VALUES (1)", true),
            ("EXPLAIN ANALYZE SELECT 1", false),
            ("SET search_path TO app", false),
            ("SHOW search_path", false),
        ];

        for (sql, expected) in test_cases {
            assert_eq!(expected, is_mutating(&parse(sql)), "sql: {sql}");
        }
    }

    #[test]
    fn settings() {
        let settings = extract_settings(&parse("SET search_path TO app"));
        assert_eq!(Some(&SettingValue::Text("app".to_string())), settings.get("search_path"));

        let settings = extract_settings(&parse("SET statement_timeout = '5s'"));
        assert_eq!(Some(&SettingValue::Text("5s".to_string())), settings.get("statement_timeout"));

        assert!(extract_settings(&parse("SELECT 1")).is_empty());
    }

    #[test]
    fn functions() {
        let names = function_names(&parse("SELECT version(), upper(name) FROM t WHERE pg_sleep(1) IS NULL"));
        let expected: BTreeSet<String> = ["VERSION", "UPPER", "PG_SLEEP"].into_iter().map(String::from).collect();
        assert_eq!(expected, names);
    }
}
