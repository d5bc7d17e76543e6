use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::dialect::{Backend, Dialect};
use crate::errors::Result;
use crate::kql::{self, KqlStatement};
use crate::split::split_sql;
use crate::statement::{LimitMethod, SettingValue, SqlStatement};
use crate::table::Table;

/// A statement in any supported dialect.
#[derive(Debug, Clone)]
pub enum Statement {
    Sql(SqlStatement),
    Kql(KqlStatement),
}

impl Statement {
    /// Parse text holding exactly one statement.
    pub fn parse(text: &str, dialect: &Dialect) -> Result<Self> {
        match dialect.backend() {
            Backend::Kql => Ok(Statement::Kql(KqlStatement::parse(text, dialect.name())?)),
            Backend::Sql(_) => Ok(Statement::Sql(SqlStatement::parse(text, dialect)?)),
        }
    }

    pub fn as_sql(&self) -> Option<&SqlStatement> {
        match self {
            Statement::Sql(stmt) => Some(stmt),
            Statement::Kql(_) => None,
        }
    }

    pub fn as_sql_mut(&mut self) -> Option<&mut SqlStatement> {
        match self {
            Statement::Sql(stmt) => Some(stmt),
            Statement::Kql(_) => None,
        }
    }

    /// Source text of the statement.
    pub fn source(&self) -> &str {
        match self {
            Statement::Sql(stmt) => stmt.sql(),
            Statement::Kql(stmt) => stmt.kql(),
        }
    }

    /// Text sent to the database, with or without comments.
    pub fn render(&self, comments: bool) -> String {
        match self {
            Statement::Sql(stmt) => stmt.render(comments),
            Statement::Kql(stmt) => stmt.format(),
        }
    }

    pub fn format(&self, comments: bool) -> String {
        match self {
            Statement::Sql(stmt) => stmt.format(comments),
            Statement::Kql(stmt) => stmt.format(),
        }
    }

    /// Referenced tables. Always empty for KQL, which logs a warning.
    pub fn tables(&self) -> BTreeSet<Table> {
        match self {
            Statement::Sql(stmt) => stmt.tables().clone(),
            Statement::Kql(stmt) => {
                stmt.warn_no_table_extraction();
                BTreeSet::new()
            }
        }
    }

    pub fn is_mutating(&self) -> bool {
        match self {
            Statement::Sql(stmt) => stmt.is_mutating(),
            Statement::Kql(stmt) => stmt.is_mutating(),
        }
    }

    pub fn is_select(&self) -> bool {
        match self {
            Statement::Sql(stmt) => stmt.is_select(),
            Statement::Kql(stmt) => stmt.is_select(),
        }
    }

    pub fn settings(&self) -> BTreeMap<String, SettingValue> {
        match self {
            Statement::Sql(stmt) => stmt.settings(),
            Statement::Kql(stmt) => stmt.settings(),
        }
    }

    pub fn check_functions_present<S: AsRef<str>>(&self, functions: &[S]) -> bool {
        match self {
            Statement::Sql(stmt) => stmt.check_functions_present(functions),
            Statement::Kql(stmt) => stmt.check_functions_present(),
        }
    }

    pub fn get_limit_value(&self) -> Option<u64> {
        match self {
            Statement::Sql(stmt) => stmt.get_limit_value(),
            Statement::Kql(stmt) => stmt.get_limit_value(),
        }
    }

    pub fn set_limit_value(&mut self, limit: u64, method: LimitMethod) -> Result<()> {
        match self {
            Statement::Sql(stmt) => stmt.set_limit_value(limit, method),
            Statement::Kql(stmt) => stmt.set_limit_value(limit, method),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Sql(stmt) => write!(f, "{stmt}"),
            Statement::Kql(stmt) => write!(f, "{}", stmt.kql()),
        }
    }
}

/// An ordered list of statements in one dialect.
#[derive(Debug, Clone)]
pub struct Script {
    dialect: Dialect,
    statements: Vec<Statement>,
}

impl Script {
    /// Split and parse a script.
    ///
    /// Empty scripts and scripts holding only comments have no statements.
    pub fn parse(script: &str, dialect: &Dialect) -> Result<Self> {
        let statements = match dialect.backend() {
            Backend::Kql => kql::split(script)
                .iter()
                .map(|stmt| Statement::Kql(KqlStatement::new(stmt, dialect.name())))
                .collect(),
            Backend::Sql(backend) => split_sql(script, backend, dialect.name())?
                .into_iter()
                .map(|split| Statement::Sql(SqlStatement::from_split(split, dialect)))
                .collect(),
        };

        Ok(Script {
            dialect: dialect.clone(),
            statements,
        })
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn statements_mut(&mut self) -> &mut [Statement] {
        &mut self.statements
    }

    pub fn into_statements(self) -> Vec<Statement> {
        self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Pretty-print all statements, separated by semicolons.
    pub fn format(&self, comments: bool) -> String {
        self.statements
            .iter()
            .map(|stmt| stmt.format(comments))
            .collect::<Vec<_>>()
            .join(";\n")
    }

    /// Render all statements on one line each, separated by semicolons.
    pub fn render(&self, comments: bool) -> String {
        self.statements
            .iter()
            .map(|stmt| stmt.render(comments))
            .collect::<Vec<_>>()
            .join(";\n")
    }

    /// Settings of all statements. Later statements override earlier ones.
    pub fn settings(&self) -> BTreeMap<String, SettingValue> {
        let mut settings = BTreeMap::new();
        for stmt in &self.statements {
            settings.extend(stmt.settings());
        }
        settings
    }

    pub fn has_mutation(&self) -> bool {
        self.statements.iter().any(Statement::is_mutating)
    }

    pub fn check_functions_present<S: AsRef<str>>(&self, functions: &[S]) -> bool {
        self.statements
            .iter()
            .any(|stmt| stmt.check_functions_present(functions))
    }

    /// Upper-cased names from `functions` called anywhere in the script.
    pub fn functions_present<S: AsRef<str>>(&self, functions: &[S]) -> BTreeSet<String> {
        self.statements
            .iter()
            .filter_map(Statement::as_sql)
            .flat_map(|stmt| stmt.functions_present(functions).collect::<Vec<_>>())
            .collect()
    }

    /// Tables referenced by any statement.
    pub fn tables(&self) -> BTreeSet<Table> {
        self.statements.iter().flat_map(|stmt| stmt.tables()).collect()
    }

    /// A script can be turned into `CREATE TABLE AS` if its last statement is
    /// a query.
    pub fn is_valid_ctas(&self) -> bool {
        self.statements.last().is_some_and(Statement::is_select)
    }

    /// A script can be turned into `CREATE VIEW AS` if it's a single query.
    pub fn is_valid_cvas(&self) -> bool {
        self.statements.len() == 1 && self.statements[0].is_select()
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg() -> Dialect {
        Dialect::from_name("postgresql")
    }

    #[test]
    fn parse_script() {
        let script = Script::parse(
            "SET search_path TO app; INSERT INTO log VALUES (1); SELECT count(*) FROM log",
            &pg(),
        )
        .unwrap();
        assert_eq!(3, script.len());
        assert!(script.has_mutation());
        assert!(script.is_valid_ctas());
        assert!(!script.is_valid_cvas());
        assert_eq!(
            Some(&SettingValue::Text("app".to_string())),
            script.settings().get("search_path")
        );
        let tables: Vec<_> = script.tables().into_iter().map(|t| t.to_string()).collect();
        assert_eq!(vec!["log"], tables);
    }

    #[test]
    fn later_settings_win() {
        let script = Script::parse("SET a = 1; SET b = 2; SET a = 3", &pg()).unwrap();
        let settings = script.settings();
        assert_eq!(Some(&SettingValue::Text("3".to_string())), settings.get("a"));
        assert_eq!(Some(&SettingValue::Text("2".to_string())), settings.get("b"));
    }

    #[test]
    fn empty_scripts() {
        for text in ["", "   ", "-- only a comment", "/* block */;"] {
            let script = Script::parse(text, &pg()).unwrap();
            assert!(script.is_empty(), "text: {text}");
            assert!(!script.has_mutation());
        }
    }

    #[test]
    fn kql_script() {
        let dialect = Dialect::from_name("kustokql");
        let script = Script::parse("set querytrace; T | take 10; .drop table T", &dialect).unwrap();
        assert_eq!(3, script.len());
        assert!(script.has_mutation());
        assert_eq!(Some(&SettingValue::Bool(true)), script.settings().get("querytrace"));
        assert!(script.tables().is_empty());
        assert!(!script.check_functions_present(&["version"]));
        assert_eq!("set querytrace;\nT | take 10;\n.drop table T", script.format(true));
    }

    #[test]
    fn single_statement() {
        assert!(Statement::parse("SELECT 1", &pg()).is_ok());
        assert!(Statement::parse("SELECT 1; SELECT 2", &pg()).is_err());
        assert!(Statement::parse("", &pg()).is_err());
        assert!(Statement::parse("T | count", &Dialect::from_name("kustokql")).is_ok());
    }

    #[test]
    fn script_functions_present() {
        let script = Script::parse("SELECT 1; SELECT version()", &pg()).unwrap();
        assert!(script.check_functions_present(&["VERSION"]));
        let found: Vec<_> = script
            .functions_present(&["version", "query_to_xml"])
            .into_iter()
            .collect();
        assert_eq!(vec!["VERSION".to_string()], found);
    }
}
