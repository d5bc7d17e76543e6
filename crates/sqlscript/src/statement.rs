use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use sqlparser::ast::{self, Expr, Ident, ObjectName, TableFactor, Value, Visit, Visitor};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::dialect::{Backend, Dialect, SqlBackend};
use crate::errors::{ParseError, Result, ScriptError};
use crate::extract::{extract_settings, extract_tables, function_names, is_mutating};
use crate::format::pretty;
use crate::split::{SplitStatement, split_sql};
use crate::table::Table;

/// Value of a session setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Text(String),
    /// Settings that are switched on by name alone.
    Bool(bool),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Text(s) => write!(f, "{s}"),
            SettingValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// How a row limit gets added to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitMethod {
    /// `SELECT * FROM (<query>) AS inner_qry LIMIT n`
    Wrap,
    /// Set the query's own `LIMIT`.
    Append,
}

/// Kind of object created from a query with [`SqlStatement::as_create_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CtasMethod {
    Table,
    View,
}

/// A single parsed SQL statement.
#[derive(Debug, Clone)]
pub struct SqlStatement {
    /// Source text as written, or the rendered AST when there's no source.
    sql: String,
    dialect: Dialect,
    ast: ast::Statement,
    comments: Vec<String>,
    tables: BTreeSet<Table>,
}

impl SqlStatement {
    pub(crate) fn from_split(split: SplitStatement, dialect: &Dialect) -> Self {
        let tables = extract_tables(&split.ast);
        SqlStatement {
            sql: split.sql,
            dialect: dialect.clone(),
            ast: split.ast,
            comments: split.comments,
            tables,
        }
    }

    /// Wrap an already parsed statement.
    pub fn from_ast(ast: ast::Statement, dialect: &Dialect) -> Self {
        let tables = extract_tables(&ast);
        SqlStatement {
            sql: ast.to_string(),
            dialect: dialect.clone(),
            ast,
            comments: Vec::new(),
            tables,
        }
    }

    /// Parse text holding exactly one statement.
    pub fn parse(sql: &str, dialect: &Dialect) -> Result<Self> {
        let backend = sql_backend(dialect)?;
        let mut statements = split_sql(sql, backend, dialect.name())?;
        if statements.len() != 1 {
            return Err(ParseError::new(
                format!("expected exactly one statement, found {}", statements.len()),
                sql,
                dialect.name(),
            )
            .into());
        }
        Ok(Self::from_split(statements.remove(0), dialect))
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub fn ast(&self) -> &ast::Statement {
        &self.ast
    }

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    /// Tables referenced by the statement, CTE names excluded.
    pub fn tables(&self) -> &BTreeSet<Table> {
        &self.tables
    }

    /// Modify the AST in place. Referenced tables are recomputed afterwards.
    pub fn transform<R>(&mut self, f: impl FnOnce(&mut ast::Statement) -> R) -> R {
        let out = f(&mut self.ast);
        self.tables = extract_tables(&self.ast);
        out
    }

    /// Render the statement on one line, optionally preceded by its comments.
    pub fn render(&self, comments: bool) -> String {
        self.with_comments(self.ast.to_string(), comments)
    }

    /// Pretty-print the statement with top-level clauses on their own lines.
    pub fn format(&self, comments: bool) -> String {
        self.with_comments(pretty(&self.ast.to_string()), comments)
    }

    fn with_comments(&self, sql: String, comments: bool) -> String {
        if !comments || self.comments.is_empty() {
            return sql;
        }
        let mut out = self.comments.join("\n");
        out.push('\n');
        out.push_str(&sql);
        out
    }

    pub fn is_mutating(&self) -> bool {
        is_mutating(&self.ast)
    }

    pub fn is_select(&self) -> bool {
        matches!(self.ast, ast::Statement::Query(_))
    }

    pub fn settings(&self) -> BTreeMap<String, SettingValue> {
        extract_settings(&self.ast)
    }

    /// Check if any of the given functions is called, ignoring case.
    pub fn check_functions_present<S: AsRef<str>>(&self, functions: &[S]) -> bool {
        self.functions_present(functions).next().is_some()
    }

    /// The subset of `functions` called by the statement, upper-cased.
    pub fn functions_present<'a, S: AsRef<str>>(
        &self,
        functions: &'a [S],
    ) -> impl Iterator<Item = String> + 'a {
        let called = function_names(&self.ast);
        functions
            .iter()
            .map(|f| f.as_ref().to_uppercase())
            .filter(move |f| called.contains(f))
    }

    fn query(&self) -> Option<&ast::Query> {
        match &self.ast {
            ast::Statement::Query(query) => Some(query),
            _ => None,
        }
    }

    /// Literal row limit of the outermost query.
    pub fn get_limit_value(&self) -> Option<u64> {
        match self.query()?.limit.as_ref()? {
            Expr::Value(Value::Number(n, _)) => n.parse().ok(),
            _ => None,
        }
    }

    /// Limit the number of rows returned by a query.
    pub fn set_limit_value(&mut self, limit: u64, method: LimitMethod) -> Result<()> {
        if !self.is_select() {
            return Err(ScriptError::Unsupported {
                operation: "setting a limit on a statement that isn't a query",
                dialect: self.dialect.name().to_string(),
            });
        }

        match method {
            LimitMethod::Append => {
                self.transform(|ast| {
                    if let ast::Statement::Query(query) = ast {
                        query.limit = Some(number(limit));
                    }
                });
            }
            LimitMethod::Wrap => {
                let sql = format!("SELECT * FROM ({}) AS inner_qry LIMIT {limit}", self.ast);
                let wrapped = Self::parse(&sql, &self.dialect)?;
                self.ast = wrapped.ast;
                self.tables = wrapped.tables;
            }
        }
        Ok(())
    }

    /// Check if the statement has a `WITH` clause anywhere.
    pub fn has_cte(&self) -> bool {
        struct Finder;
        impl Visitor for Finder {
            type Break = ();
            fn pre_visit_query(&mut self, query: &ast::Query) -> ControlFlow<()> {
                if query.with.is_some() {
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
        }
        self.ast.visit(&mut Finder).is_break()
    }

    /// Check if the statement nests a query in an expression or a `FROM`.
    pub fn has_subquery(&self) -> bool {
        struct Finder;
        impl Visitor for Finder {
            type Break = ();
            fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
                match expr {
                    Expr::Subquery(_) | Expr::InSubquery { .. } | Expr::Exists { .. } => {
                        ControlFlow::Break(())
                    }
                    _ => ControlFlow::Continue(()),
                }
            }
            fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<()> {
                match factor {
                    TableFactor::Derived { .. } => ControlFlow::Break(()),
                    _ => ControlFlow::Continue(()),
                }
            }
        }
        self.ast.visit(&mut Finder).is_break()
    }

    /// Turn a query into `CREATE TABLE|VIEW <table> AS <query>`.
    pub fn as_create_table(&self, table: &Table, method: CtasMethod) -> Result<SqlStatement> {
        if !self.is_select() {
            return Err(ScriptError::Unsupported {
                operation: "CREATE AS from a statement that isn't a query",
                dialect: self.dialect.name().to_string(),
            });
        }
        let name = object_name(table);
        let kind = match method {
            CtasMethod::Table => "TABLE",
            CtasMethod::View => "VIEW",
        };
        Self::parse(&format!("CREATE {kind} {name} AS {}", self.ast), &self.dialect)
    }

    /// Parse a boolean expression in this statement's dialect.
    pub fn parse_predicate(&self, predicate: &str) -> Result<Expr> {
        parse_expr(predicate, &self.dialect)
    }
}

impl fmt::Display for SqlStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ast)
    }
}

fn number(n: u64) -> Expr {
    Expr::Value(Value::Number(n.to_string(), false))
}

fn sql_backend(dialect: &Dialect) -> Result<SqlBackend> {
    match dialect.backend() {
        Backend::Sql(backend) => Ok(backend),
        Backend::Kql => Err(ScriptError::Unsupported {
            operation: "SQL parsing",
            dialect: dialect.name().to_string(),
        }),
    }
}

fn object_name(table: &Table) -> ObjectName {
    ObjectName(
        table
            .parts()
            .map(|part| {
                let plain = part.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
                    && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if plain {
                    Ident::new(part)
                } else {
                    Ident::with_quote('"', part)
                }
            })
            .collect(),
    )
}

/// Parse a standalone expression, rejecting trailing input.
pub fn parse_expr(text: &str, dialect: &Dialect) -> Result<Expr> {
    let backend = sql_backend(dialect)?;
    let parser_dialect = backend.parser_dialect();
    let mut parser = Parser::new(parser_dialect.as_ref())
        .try_with_sql(text)
        .map_err(|e| ParseError::from_parser(e, text, dialect.name()))?;
    let expr = parser
        .parse_expr()
        .map_err(|e| ParseError::from_parser(e, text, dialect.name()))?;
    let next = parser.peek_token();
    if next.token != Token::EOF {
        return Err(ParseError::new(
            format!("unexpected trailing input: {}", next.token),
            text,
            dialect.name(),
        )
        .into());
    }
    Ok(expr)
}

/// Check that a WHERE or HAVING fragment is a single expression, returning its
/// normalized text.
///
/// Fragments for dialects without a parser are returned trimmed.
pub fn sanitize_clause(clause: &str, dialect: &Dialect) -> Result<String> {
    if dialect.is_kql() {
        return Ok(clause.trim().to_string());
    }
    Ok(parse_expr(clause, dialect)?.to_string())
}
