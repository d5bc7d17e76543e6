//! Rewrites enforcing row and column level security on parsed statements.
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::ops::ControlFlow;

use access::{AccessCheck, ClsAction, RuleSet};
use sqlscript::export::sqlparser::ast::{
    self, BinaryOperator, Expr, Ident, JoinConstraint, JoinOperator, ObjectName, Query, Select,
    SelectItem, SetExpr, TableFactor, TableWithJoins, Value, VisitMut, VisitorMut,
};
use sqlscript::{CteScope, Dialect, SqlStatement, Table, parse_expr};
use tracing::{debug, warn};

use crate::database::{EngineSpec, RlsMethod};
use crate::errors::{ExecError, Result, internal};

/// Security applied to one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TablePolicy {
    /// Parenthesized predicates to be AND-ed together.
    pub predicates: Vec<String>,
    pub cls: BTreeMap<String, ClsAction>,
}

impl TablePolicy {
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty() && self.cls.is_empty()
    }

    fn cls_action(&self, column: &str) -> Option<ClsAction> {
        self.cls
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, action)| *action)
    }
}

/// Access decisions for every table referenced by a script.
#[derive(Debug, Clone, Default)]
pub struct TablePolicies {
    catalog: Option<String>,
    schema: Option<String>,
    policies: BTreeMap<Table, TablePolicy>,
}

impl TablePolicies {
    /// Evaluate the rules for each table, qualified with the given defaults.
    ///
    /// Denied tables are logged and skipped.
    pub fn resolve(
        rules: &RuleSet,
        database: &str,
        tables: impl IntoIterator<Item = Table>,
        catalog: Option<&str>,
        schema: Option<&str>,
    ) -> Self {
        let mut policies = BTreeMap::new();
        if !rules.is_empty() {
            for table in tables {
                let table = table.qualify(catalog, schema);
                if policies.contains_key(&table) {
                    continue;
                }
                let access = rules.check_table_access(database, &table);
                match access.access {
                    AccessCheck::Denied => {
                        warn!(%database, %table, "access to table denied, skipping row and column level security");
                    }
                    AccessCheck::NoRule => (),
                    AccessCheck::Allowed => {
                        let policy = TablePolicy {
                            predicates: access.combined_predicates(),
                            cls: access.cls_rules,
                        };
                        if !policy.is_empty() {
                            debug!(%table, ?policy, "applying table policy");
                            policies.insert(table, policy);
                        }
                    }
                }
            }
        }

        TablePolicies {
            catalog: catalog.map(|c| c.to_string()),
            schema: schema.map(|s| s.to_string()),
            policies,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Policy for a table as written in a query.
    pub fn get(&self, table: &Table) -> Option<&TablePolicy> {
        self.policies
            .get(&table.qualify(self.catalog.as_deref(), self.schema.as_deref()))
    }

    /// Tables with column level rules.
    pub fn cls_tables(&self) -> impl Iterator<Item = &Table> {
        self.policies
            .iter()
            .filter(|(_, policy)| !policy.cls.is_empty())
            .map(|(table, _)| table)
    }

    /// Sorted `table: predicate` pairs of all row level rules.
    pub fn applied_predicates(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .policies
            .iter()
            .flat_map(|(table, policy)| policy.predicates.iter().map(move |p| format!("{table}: {p}")))
            .collect();
        out.sort();
        out
    }
}

/// Applies table policies to statements.
#[derive(Debug)]
pub struct StatementTransformer<'a> {
    policies: &'a TablePolicies,
    /// Known columns of tables with column level rules, keyed by qualified
    /// table.
    columns: &'a HashMap<Table, Vec<String>>,
    rls_method: RlsMethod,
    engine: &'a dyn EngineSpec,
}

impl<'a> StatementTransformer<'a> {
    pub fn new(
        policies: &'a TablePolicies,
        columns: &'a HashMap<Table, Vec<String>>,
        engine: &'a dyn EngineSpec,
    ) -> Self {
        StatementTransformer {
            policies,
            columns,
            rls_method: engine.rls_method(),
            engine,
        }
    }

    /// Rewrite projections for column level rules, then inject row level
    /// predicates.
    pub fn apply(&self, statement: &mut SqlStatement) -> Result<()> {
        if self.policies.is_empty() {
            return Ok(());
        }

        let dialect = statement.dialect().clone();
        let mut predicates = HashMap::new();
        for (table, policy) in &self.policies.policies {
            if let Some(expr) = and_all(&policy.predicates, &dialect)? {
                predicates.insert(table.clone(), expr);
            }
        }

        statement.transform(|ast| {
            let mut cls = ClsRewriter {
                transformer: self,
                dialect: &dialect,
                scope: CteScope::default(),
            };
            if let ControlFlow::Break(err) = ast.visit(&mut cls) {
                return Err(err);
            }

            if predicates.is_empty() {
                return Ok(());
            }

            let flow = match self.rls_method {
                RlsMethod::Predicate => ast.visit(&mut PredicateInjector {
                    policies: self.policies,
                    predicates: &predicates,
                    scope: CteScope::default(),
                }),
                RlsMethod::Subquery => ast.visit(&mut SubqueryInjector {
                    policies: self.policies,
                    predicates: &predicates,
                    dialect: &dialect,
                    scope: CteScope::default(),
                    depth: 0,
                }),
            };
            match flow {
                ControlFlow::Break(err) => Err(err),
                ControlFlow::Continue(()) => Ok(()),
            }
        })
    }
}

fn and(left: Expr, right: Expr) -> Expr {
    Expr::BinaryOp {
        left: Box::new(left),
        op: BinaryOperator::And,
        right: Box::new(right),
    }
}

fn nested(expr: Expr) -> Expr {
    match expr {
        Expr::Nested(_) => expr,
        other => Expr::Nested(Box::new(other)),
    }
}

fn and_all(predicates: &[String], dialect: &Dialect) -> Result<Option<Expr>> {
    let mut combined = None;
    for predicate in predicates {
        let expr = nested(parse_expr(predicate, dialect)?);
        combined = Some(match combined {
            Some(acc) => and(acc, expr),
            None => expr,
        });
    }
    Ok(combined)
}

fn normalize_ident(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

/// Table named in a `FROM` clause that isn't a CTE or table function.
fn plain_table<'t>(factor: &'t TableFactor, scope: &CteScope) -> Option<(&'t ObjectName, Table)> {
    match factor {
        TableFactor::Table {
            name, args: None, ..
        } if !scope.is_cte(name) => Table::from_object_name(name).map(|table| (name, table)),
        _ => None,
    }
}

/// Call `f` on each `SELECT` of a query body, skipping nested queries which
/// get visited on their own.
fn for_each_select(
    body: &mut SetExpr,
    f: &mut dyn FnMut(&mut Select) -> Result<()>,
) -> Result<()> {
    match body {
        SetExpr::Select(select) => f(&mut **select),
        SetExpr::SetOperation { left, right, .. } => {
            for_each_select(left, f)?;
            for_each_select(right, f)
        }
        _ => Ok(()),
    }
}

/// A relation in scope of a `SELECT`.
struct Source<'p> {
    /// Name used to qualify columns, the alias when there is one.
    qualifier: Option<Vec<Ident>>,
    table: Option<Table>,
    policy: Option<&'p TablePolicy>,
}

impl Source<'_> {
    fn matches_qualifier(&self, parts: &[Ident]) -> bool {
        match (&self.qualifier, parts.last()) {
            (Some(qualifier), Some(last)) => qualifier
                .last()
                .is_some_and(|q| normalize_ident(q) == normalize_ident(last)),
            _ => false,
        }
    }

    fn has_cls(&self) -> bool {
        self.policy.is_some_and(|p| !p.cls.is_empty())
    }
}

fn relations(from: &[TableWithJoins]) -> impl Iterator<Item = &TableFactor> {
    from.iter()
        .flat_map(|twj| std::iter::once(&twj.relation).chain(twj.joins.iter().map(|j| &j.relation)))
}

struct ClsRewriter<'t, 'a> {
    transformer: &'t StatementTransformer<'a>,
    dialect: &'t Dialect,
    scope: CteScope,
}

impl ClsRewriter<'_, '_> {
    fn sources(&self, from: &[TableWithJoins]) -> Vec<Source<'_>> {
        relations(from)
            .map(|factor| {
                let alias = match factor {
                    TableFactor::Table { alias, .. } | TableFactor::Derived { alias, .. } => {
                        alias.as_ref().map(|a| vec![a.name.clone()])
                    }
                    _ => None,
                };
                match plain_table(factor, &self.scope) {
                    Some((name, table)) => Source {
                        qualifier: alias.or_else(|| Some(name.0.clone())),
                        policy: self.transformer.policies.get(&table),
                        table: Some(table),
                    },
                    None => Source {
                        qualifier: alias.or_else(|| match factor {
                            TableFactor::Table { name, .. } => Some(name.0.clone()),
                            _ => None,
                        }),
                        table: None,
                        policy: None,
                    },
                }
            })
            .collect()
    }

    fn rewrite_select(&self, select: &mut Select) -> Result<()> {
        let sources = self.sources(&select.from);
        if !sources.iter().any(Source::has_cls) {
            return Ok(());
        }

        let qualify = sources.len() > 1;
        let mut projection = Vec::with_capacity(select.projection.len());
        for item in std::mem::take(&mut select.projection) {
            match item {
                SelectItem::Wildcard(_) => {
                    for source in &sources {
                        self.expand_wildcard(source, qualify, &mut projection)?;
                    }
                }
                SelectItem::QualifiedWildcard(name, opts) => {
                    match sources.iter().find(|s| s.matches_qualifier(&name.0)) {
                        Some(source) if source.has_cls() => {
                            self.expand_wildcard(source, true, &mut projection)?
                        }
                        _ => projection.push(SelectItem::QualifiedWildcard(name, opts)),
                    }
                }
                SelectItem::UnnamedExpr(expr) => {
                    if let Some(item) = self.rewrite_item(&sources, expr, None)? {
                        projection.push(item);
                    }
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    if let Some(item) = self.rewrite_item(&sources, expr, Some(alias))? {
                        projection.push(item);
                    }
                }
            }
        }

        if projection.is_empty() {
            return Err(ExecError::Security(
                "All selected columns are hidden by column level security".to_string(),
            ));
        }
        select.projection = projection;
        Ok(())
    }

    fn expand_wildcard(
        &self,
        source: &Source<'_>,
        qualify: bool,
        projection: &mut Vec<SelectItem>,
    ) -> Result<()> {
        let qualifier = source.qualifier.clone();
        let (Some(policy), Some(table)) = (source.policy.filter(|p| !p.cls.is_empty()), &source.table)
        else {
            return match qualifier {
                Some(qualifier) => {
                    projection.push(SelectItem::QualifiedWildcard(
                        ObjectName(qualifier),
                        Default::default(),
                    ));
                    Ok(())
                }
                None => Err(ExecError::Security(
                    "Cannot expand * over an unnamed relation while applying column level security"
                        .to_string(),
                )),
            };
        };

        let qualified = table.qualify(
            self.transformer.policies.catalog.as_deref(),
            self.transformer.policies.schema.as_deref(),
        );
        let columns = self.transformer.columns.get(&qualified).ok_or_else(|| {
            ExecError::Security(format!(
                "Cannot apply column level security to * on {table} without column metadata"
            ))
        })?;

        for column in columns {
            let ident = Ident::new(column);
            let expr = match (&qualifier, qualify) {
                (Some(qualifier), true) => {
                    let mut parts = qualifier.clone();
                    parts.push(ident.clone());
                    Expr::CompoundIdentifier(parts)
                }
                _ => Expr::Identifier(ident.clone()),
            };
            match policy.cls_action(column) {
                None => projection.push(SelectItem::UnnamedExpr(expr)),
                Some(ClsAction::Hide) => (),
                Some(action) => projection.push(SelectItem::ExprWithAlias {
                    expr: self.masked(action, expr)?,
                    alias: ident,
                }),
            }
        }
        Ok(())
    }

    /// Column level action for a column reference, if any.
    fn resolve(&self, sources: &[Source<'_>], expr: &Expr) -> Option<ClsAction> {
        match expr {
            Expr::Identifier(ident) => sources
                .iter()
                .filter_map(|s| s.policy?.cls_action(&normalize_ident(ident)))
                .max(),
            Expr::CompoundIdentifier(parts) if parts.len() > 1 => {
                let (column, qualifier) = parts.split_last()?;
                sources
                    .iter()
                    .find(|s| s.matches_qualifier(qualifier))?
                    .policy?
                    .cls_action(&normalize_ident(column))
            }
            _ => None,
        }
    }

    fn masked(&self, action: ClsAction, expr: Expr) -> Result<Expr> {
        match self.transformer.engine.cls_function(action) {
            Some(func) => Ok(parse_expr(&format!("{func}({expr})"), self.dialect)?),
            None => Ok(Expr::Value(Value::Null)),
        }
    }

    fn rewrite_item(
        &self,
        sources: &[Source<'_>],
        expr: Expr,
        alias: Option<Ident>,
    ) -> Result<Option<SelectItem>> {
        // Bare column references keep their name through an alias.
        if let Some(action) = self.resolve(sources, &expr) {
            if action == ClsAction::Hide {
                return Ok(None);
            }
            let alias = match (alias, &expr) {
                (Some(alias), _) => alias,
                (None, Expr::Identifier(ident)) => ident.clone(),
                (None, Expr::CompoundIdentifier(parts)) => match parts.last() {
                    Some(ident) => ident.clone(),
                    None => return Err(internal!("empty compound identifier")),
                },
                (None, _) => return Err(internal!("column reference without a name")),
            };
            return Ok(Some(SelectItem::ExprWithAlias {
                expr: self.masked(action, expr)?,
                alias,
            }));
        }

        let mut expr = expr;
        let mut nested = NestedColumns {
            rewriter: self,
            sources,
            depth: 0,
            hidden: false,
        };
        if let ControlFlow::Break(err) = expr.visit(&mut nested) {
            return Err(err);
        }
        if nested.hidden {
            return Ok(None);
        }

        Ok(Some(match alias {
            Some(alias) => SelectItem::ExprWithAlias { expr, alias },
            None => SelectItem::UnnamedExpr(expr),
        }))
    }
}

impl VisitorMut for ClsRewriter<'_, '_> {
    type Break = ExecError;

    fn pre_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        self.scope.enter_query(query);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        let res = for_each_select(&mut query.body, &mut |select| self.rewrite_select(select));
        self.scope.exit_query(query);
        match res {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err),
        }
    }
}

/// Masks column references nested inside projected expressions. Hidden
/// columns flag the whole item for removal.
struct NestedColumns<'r, 't, 'a> {
    rewriter: &'r ClsRewriter<'t, 'a>,
    sources: &'r [Source<'r>],
    depth: usize,
    hidden: bool,
}

impl VisitorMut for NestedColumns<'_, '_, '_> {
    type Break = ExecError;

    fn pre_visit_query(&mut self, _query: &mut Query) -> ControlFlow<Self::Break> {
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &mut Query) -> ControlFlow<Self::Break> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        if self.depth > 0 {
            return ControlFlow::Continue(());
        }
        match self.rewriter.resolve(self.sources, expr) {
            Some(ClsAction::Hide) => self.hidden = true,
            Some(action) => match self.rewriter.masked(action, expr.clone()) {
                Ok(masked) => *expr = masked,
                Err(err) => return ControlFlow::Break(err),
            },
            None => (),
        }
        ControlFlow::Continue(())
    }
}

/// Injects predicates into `WHERE` clauses, or the `ON` clause for tables on
/// the inner side of a join.
struct PredicateInjector<'a> {
    policies: &'a TablePolicies,
    predicates: &'a HashMap<Table, Expr>,
    scope: CteScope,
}

impl PredicateInjector<'_> {
    fn predicate_for(&self, factor: &TableFactor, qualify: bool) -> Option<Expr> {
        let (name, table) = plain_table(factor, &self.scope)?;
        let qualified = table.qualify(self.policies.catalog.as_deref(), self.policies.schema.as_deref());
        let mut predicate = self.predicates.get(&qualified)?.clone();
        if qualify {
            let qualifier = match factor {
                TableFactor::Table {
                    alias: Some(alias), ..
                } => vec![alias.name.clone()],
                _ => name.0.clone(),
            };
            let mut visitor = QualifyColumns {
                qualifier,
                depth: 0,
            };
            match predicate.visit(&mut visitor) {
                ControlFlow::Continue(()) => {}
                ControlFlow::Break(never) => match never {},
            }
        }
        Some(predicate)
    }

    fn inject(&self, select: &mut Select) {
        let qualify = select.from.len() > 1 || select.from.iter().any(|twj| !twj.joins.is_empty());

        let mut filters = Vec::new();
        for twj in &mut select.from {
            if let Some(predicate) = self.predicate_for(&twj.relation, qualify) {
                filters.push(predicate);
            }
            for join in &mut twj.joins {
                let Some(predicate) = self.predicate_for(&join.relation, qualify) else {
                    continue;
                };
                match join_on(&mut join.join_operator) {
                    Some(on) => {
                        let existing = std::mem::replace(on, Expr::Value(Value::Null));
                        *on = and(predicate, nested(existing));
                    }
                    None => filters.push(predicate),
                }
            }
        }

        let Some(combined) = filters.into_iter().reduce(and) else {
            return;
        };
        select.selection = Some(match select.selection.take() {
            Some(existing) => and(combined, nested(existing)),
            None => combined,
        });
    }
}

/// `ON` clause of joins where filtering the right side in the clause keeps
/// its rows out of the result.
fn join_on(op: &mut JoinOperator) -> Option<&mut Expr> {
    match op {
        JoinOperator::Inner(JoinConstraint::On(expr))
        | JoinOperator::LeftOuter(JoinConstraint::On(expr)) => Some(expr),
        _ => None,
    }
}

impl VisitorMut for PredicateInjector<'_> {
    type Break = ExecError;

    fn pre_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        self.scope.enter_query(query);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        let res = for_each_select(&mut query.body, &mut |select| {
            self.inject(select);
            Ok(())
        });
        self.scope.exit_query(query);
        match res {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err),
        }
    }
}

/// Prefixes unqualified column references with a relation name.
struct QualifyColumns {
    qualifier: Vec<Ident>,
    depth: usize,
}

impl VisitorMut for QualifyColumns {
    type Break = Infallible;

    fn pre_visit_query(&mut self, _query: &mut Query) -> ControlFlow<Self::Break> {
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &mut Query) -> ControlFlow<Self::Break> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        if self.depth == 0 {
            if let Expr::Identifier(ident) = expr {
                let mut parts = self.qualifier.clone();
                parts.push(ident.clone());
                *expr = Expr::CompoundIdentifier(parts);
            }
        }
        ControlFlow::Continue(())
    }
}

/// Replaces tables with a filtering subquery aliased as the table.
struct SubqueryInjector<'a> {
    policies: &'a TablePolicies,
    predicates: &'a HashMap<Table, Expr>,
    dialect: &'a Dialect,
    scope: CteScope,
    depth: usize,
}

impl SubqueryInjector<'_> {
    fn replacement(&self, factor: &TableFactor) -> Result<Option<TableFactor>> {
        let Some((name, table)) = plain_table(factor, &self.scope) else {
            return Ok(None);
        };
        let qualified = table.qualify(self.policies.catalog.as_deref(), self.policies.schema.as_deref());
        let Some(predicate) = self.predicates.get(&qualified) else {
            return Ok(None);
        };

        let alias = match factor {
            TableFactor::Table {
                alias: Some(alias), ..
            } => alias.to_string(),
            _ => match name.0.last() {
                Some(ident) => ident.to_string(),
                None => return Err(internal!("table reference without a name")),
            },
        };

        let sql = format!("SELECT * FROM (SELECT * FROM {name} WHERE {predicate}) AS {alias}");
        let parsed = SqlStatement::parse(&sql, self.dialect)?;
        match parsed.ast() {
            ast::Statement::Query(query) => match query.body.as_ref() {
                SetExpr::Select(select) => match select.from.first() {
                    Some(twj) => Ok(Some(twj.relation.clone())),
                    None => Err(internal!("subquery without a FROM clause: {sql}")),
                },
                _ => Err(internal!("unexpected subquery shape: {sql}")),
            },
            _ => Err(internal!("unexpected subquery statement: {sql}")),
        }
    }
}

impl VisitorMut for SubqueryInjector<'_> {
    type Break = ExecError;

    fn pre_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        self.scope.enter_query(query);
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        self.depth -= 1;
        self.scope.exit_query(query);
        ControlFlow::Continue(())
    }

    fn post_visit_table_factor(&mut self, factor: &mut TableFactor) -> ControlFlow<Self::Break> {
        // Targets of DML statements are left alone.
        if self.depth == 0 {
            return ControlFlow::Continue(());
        }
        match self.replacement(factor) {
            Ok(Some(replacement)) => *factor = replacement,
            Ok(None) => (),
            Err(err) => return ControlFlow::Break(err),
        }
        ControlFlow::Continue(())
    }
}
