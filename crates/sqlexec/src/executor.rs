//! Preparing and running scripts against a database.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlscript::{Script, Table};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::database::{Cursor, Database, EngineSpec};
use crate::engine::EngineState;
use crate::errors::{DriverError, ExecError, Result};
use crate::handle::AsyncQueryHandle;
use crate::options::{Principal, QueryOptions};
use crate::query::{ERRORS_KEY, NewQuery, PROGRESS_KEY, QueryRecord, QueryStore, QueryUpdate};
use crate::result::{QueryResult, QueryStatus, ResultSet, StatementResult};
use crate::task::QueryTask;
use crate::template::render_sql;
use crate::transform::{StatementTransformer, TablePolicies};

/// One statement ready to be sent to the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// The statement as written by the caller.
    pub original_sql: String,
    /// The statement after access rules, limits and the process mutator.
    pub executed_sql: String,
}

/// A script that went through templating, transformation and the security
/// checks.
#[derive(Debug, Clone)]
pub struct PreparedScript {
    /// Script text after template rendering.
    pub sql: String,
    pub statements: Vec<PreparedStatement>,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    /// Limit applied to the last statement.
    pub limit: Option<u64>,
    pub has_mutation: bool,
    /// Row level predicates applied, as sorted `table: predicate` pairs.
    pub applied_predicates: Vec<String>,
}

impl PreparedScript {
    /// All statements as sent to the database.
    pub fn executed_sql(&self) -> String {
        self.statements
            .iter()
            .map(|stmt| stmt.executed_sql.as_str())
            .collect::<Vec<_>>()
            .join(";\n")
    }

    /// Fingerprint identifying results of this script on a database.
    pub fn cache_key(&self, database_id: i64) -> String {
        let mut hasher = Sha256::new();
        let parts = [
            database_id.to_string(),
            self.executed_sql(),
            self.catalog.clone().unwrap_or_default(),
            self.schema.clone().unwrap_or_default(),
            self.limit.map(|l| l.to_string()).unwrap_or_default(),
            self.applied_predicates.join(";"),
        ];
        hasher.update(parts.join("|").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn dry_run_result(&self) -> QueryResult {
        let statements = self
            .statements
            .iter()
            .map(|stmt| StatementResult {
                original_sql: stmt.original_sql.clone(),
                executed_sql: stmt.executed_sql.clone(),
                data: None,
                row_count: 0,
                execution_time_ms: 0.0,
            })
            .collect();
        QueryResult::success(statements, None, 0.0)
    }
}

/// How a statement loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    /// The query record was marked stopped between statements.
    Stopped,
}

pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

pub(crate) fn database_error(database: &dyn Database, err: DriverError) -> ExecError {
    let errors = database.engine_spec().extract_errors(&err.message, database.name());
    ExecError::Database {
        message: err.message,
        errors,
    }
}

/// Runs prepared statements in order on one cursor, tracking progress on the
/// query record.
pub(crate) struct StatementRunner<'a> {
    pub database: &'a dyn Database,
    pub engine_spec: &'a dyn EngineSpec,
    pub queries: &'a dyn QueryStore,
    pub config: &'a CoreConfig,
    pub query: &'a QueryRecord,
    /// Poll the record for stop requests and execute through
    /// `execute_with_cursor`.
    pub tracked: bool,
}

impl StatementRunner<'_> {
    pub async fn run(
        &self,
        cursor: &mut dyn Cursor,
        statements: &[PreparedStatement],
        results: &mut Vec<StatementResult>,
    ) -> Result<RunOutcome> {
        let count = statements.len();
        for (idx, stmt) in statements.iter().enumerate() {
            if self.tracked && self.is_stopped().await {
                info!(query_id = self.query.id, statement = idx + 1, "query stopped, skipping remaining statements");
                return Ok(RunOutcome::Stopped);
            }

            let sql = self.database.mutate_sql_based_on_config(&stmt.executed_sql, true);
            debug!(query_id = self.query.id, statement = idx + 1, count, "running statement");
            self.config
                .log_query(self.database.name(), &sql, self.query.schema.as_deref());

            let start = Instant::now();
            let executed = if self.tracked {
                self.engine_spec.execute_with_cursor(cursor, &sql, self.query).await
            } else {
                self.engine_spec.execute(cursor, &sql).await
            };
            executed.map_err(|e| database_error(self.database, e))?;

            let (data, row_count) = match cursor.description() {
                Some(columns) => {
                    let rows = self
                        .engine_spec
                        .fetch_data(cursor)
                        .await
                        .map_err(|e| database_error(self.database, e))?;
                    let row_count = rows.len() as u64;
                    (Some(ResultSet::new(columns, rows)), row_count)
                }
                None => (None, cursor.rowcount()),
            };

            results.push(StatementResult {
                original_sql: stmt.original_sql.clone(),
                executed_sql: sql,
                data,
                row_count,
                execution_time_ms: elapsed_ms(start),
            });

            let done = idx + 1;
            let progress = (done * 100).div_ceil(count) as u8;
            self.queries
                .update(
                    self.query.id,
                    QueryUpdate::default()
                        .with_progress(progress)
                        .with_extra(PROGRESS_KEY, format!("Running statement {done} out of {count}")),
                )
                .await;
        }
        Ok(RunOutcome::Completed)
    }

    async fn is_stopped(&self) -> bool {
        self.queries
            .get(self.query.id)
            .await
            .is_some_and(|record| record.is_stopped())
    }
}

/// Executes scripts on one database on behalf of one principal.
#[derive(Debug, Clone)]
pub struct SqlExecutor {
    state: Arc<EngineState>,
    database: Arc<dyn Database>,
    principal: Principal,
}

impl SqlExecutor {
    pub(crate) fn new(
        state: Arc<EngineState>,
        database: Arc<dyn Database>,
        principal: Principal,
    ) -> Self {
        SqlExecutor {
            state,
            database,
            principal,
        }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Render, parse, transform and check a script.
    ///
    /// Parse, template, access and security errors are returned as errors.
    pub async fn prepare(&self, sql: &str, options: &QueryOptions) -> Result<PreparedScript> {
        let config = &self.state.config;
        let spec = self.database.engine_spec();

        let rendered = match &options.template_params {
            Some(params) => render_sql(sql, params, &self.principal)?,
            None => sql.to_string(),
        };

        let dialect = self.state.dialects.resolve(spec.engine());
        let original = Script::parse(&rendered, &dialect)?;
        let mut transformed = Script::parse(&rendered, &dialect)?;

        let catalog = match &options.catalog {
            Some(catalog) => Some(catalog.clone()),
            None => self
                .database
                .get_default_catalog()
                .await
                .map_err(|e| database_error(self.database.as_ref(), e))?,
        };
        let schema = match &options.schema {
            Some(schema) => Some(schema.clone()),
            None => self
                .database
                .get_default_schema(catalog.as_deref())
                .await
                .map_err(|e| database_error(self.database.as_ref(), e))?,
        };

        let policies = if dialect.supports_access_rules() {
            TablePolicies::resolve(
                &self.principal.rules,
                self.database.name(),
                transformed.tables(),
                catalog.as_deref(),
                schema.as_deref(),
            )
        } else {
            if !self.principal.rules.is_empty() {
                warn!(dialect = %dialect, database = %self.database.name(), "access rules can't be enforced for this dialect");
            }
            TablePolicies::default()
        };

        let columns = self.fetch_cls_columns(&policies).await;
        let transformer = StatementTransformer::new(&policies, &columns, spec.as_ref());
        for stmt in transformed.statements_mut() {
            if let Some(stmt) = stmt.as_sql_mut() {
                transformer.apply(stmt)?;
            }
        }

        let has_mutation = original.has_mutation();
        let limit = options.limit.map(|limit| limit.min(config.sql_max_row));
        if let (Some(limit), false) = (limit, has_mutation) {
            if let Some(last) = transformed.statements_mut().last_mut() {
                let keep_existing = last.get_limit_value().is_some_and(|existing| existing <= limit);
                if last.is_select() && !keep_existing {
                    last.set_limit_value(limit, spec.limit_method())?;
                }
            }
        }

        let disallowed = config.disallowed_functions_for(spec.engine());
        let found = original.functions_present(&disallowed);
        if !found.is_empty() {
            let names: Vec<String> = found.iter().map(|f| f.to_lowercase()).collect();
            return Err(ExecError::Security(format!(
                "Disallowed SQL functions: {}",
                names.join(", ")
            )));
        }
        if has_mutation && !self.database.allow_dml() {
            return Err(ExecError::Security(
                "DML queries are not allowed on this database".to_string(),
            ));
        }

        let comments = spec.allows_sql_comments();
        let database_name = self.database.name();
        let mut statements: Vec<PreparedStatement> = original
            .statements()
            .iter()
            .zip(transformed.statements())
            .map(|(orig, trans)| PreparedStatement {
                original_sql: orig.render(true),
                executed_sql: config.mutate_sql(&trans.render(comments), database_name),
            })
            .collect();
        if spec.run_multiple_statements_as_one() && statements.len() > 1 {
            statements = vec![PreparedStatement {
                original_sql: original.format(true),
                executed_sql: config.mutate_sql(&transformed.format(comments), database_name),
            }];
        }

        Ok(PreparedScript {
            sql: rendered,
            statements,
            catalog,
            schema,
            limit,
            has_mutation,
            applied_predicates: policies.applied_predicates(),
        })
    }

    /// Columns of tables with column level rules, for `*` expansion. Tables
    /// without metadata are left out.
    async fn fetch_cls_columns(&self, policies: &TablePolicies) -> HashMap<Table, Vec<String>> {
        let mut columns = HashMap::new();
        for table in policies.cls_tables() {
            match self.database.get_columns(table).await {
                Ok(cols) => {
                    columns.insert(table.clone(), cols);
                }
                Err(error) => debug!(%table, %error, "no column metadata for table"),
            }
        }
        columns
    }

    fn cache_ttl(&self, options: &QueryOptions) -> Duration {
        options
            .cache
            .timeout
            .or_else(|| self.database.cache_timeout())
            .unwrap_or(self.state.config.cache_default_timeout)
    }

    /// Look up a cached result for a non-mutating script.
    async fn cached(&self, prepared: &PreparedScript, options: &QueryOptions) -> Option<QueryResult> {
        if prepared.has_mutation || options.cache.force_refresh {
            return None;
        }
        let key = prepared.cache_key(self.database.id());
        let hit = self.state.cache.get(&key).await?;
        debug!(%key, "serving query from cache");
        let mut result = (*hit).clone();
        result.is_cached = true;
        result.query_id = None;
        Some(result)
    }

    async fn create_record(
        &self,
        prepared: &PreparedScript,
        options: &QueryOptions,
        status: QueryStatus,
    ) -> QueryRecord {
        let client_id = options.client_id.clone().unwrap_or_else(|| {
            let mut id = Uuid::new_v4().simple().to_string();
            id.truncate(11);
            id
        });
        self.state
            .queries
            .create(NewQuery {
                client_id,
                database_id: self.database.id(),
                user_id: self.principal.id.clone(),
                catalog: prepared.catalog.clone(),
                schema: prepared.schema.clone(),
                sql: prepared.sql.clone(),
                executed_sql: Some(prepared.executed_sql()),
                limit: prepared.limit,
                status,
            })
            .await
    }

    /// Run a script and wait for its result.
    ///
    /// Database errors and timeouts are reported through the returned
    /// result, keeping the statements completed before the failure.
    pub async fn execute(&self, sql: &str, options: QueryOptions) -> Result<QueryResult> {
        let prepared = self.prepare(sql, &options).await?;
        if options.dry_run {
            return Ok(prepared.dry_run_result());
        }
        if let Some(cached) = self.cached(&prepared, &options).await {
            return Ok(cached);
        }

        let query = self.create_record(&prepared, &options, QueryStatus::Running).await;
        let timeout = options
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.state.config.sqllab_timeout);

        let start = Instant::now();
        let mut statements = Vec::new();
        let run = self.run_statements(&query, &prepared, &mut statements);
        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok(res) => res,
            Err(_) => Err(ExecError::timeout(timeout.as_secs())),
        };
        let total_ms = elapsed_ms(start);

        let queries = &self.state.queries;
        match outcome {
            Ok(()) => {
                let result = QueryResult::success(statements, Some(query.id), total_ms);
                queries
                    .update(
                        query.id,
                        QueryUpdate::status(QueryStatus::Success)
                            .with_rows(result.total_rows())
                            .with_progress(100)
                            .with_end_time(Utc::now()),
                    )
                    .await;

                if !prepared.has_mutation {
                    let key = prepared.cache_key(self.database.id());
                    self.state
                        .cache
                        .set(key, result.clone(), Some(self.cache_ttl(&options)))
                        .await;
                }
                Ok(result)
            }
            Err(err) => {
                warn!(query_id = query.id, error = %err, "query failed");
                let status = err.query_status();
                queries
                    .update(
                        query.id,
                        QueryUpdate::status(status)
                            .with_error(err.to_string())
                            .with_end_time(Utc::now())
                            .with_extra(ERRORS_KEY, serde_json::to_value(err.error_infos()).unwrap_or_default()),
                    )
                    .await;
                Ok(QueryResult {
                    status,
                    statements,
                    query_id: Some(query.id),
                    total_execution_time_ms: total_ms,
                    error_message: Some(err.to_string()),
                    is_cached: false,
                })
            }
        }
    }

    async fn run_statements(
        &self,
        query: &QueryRecord,
        prepared: &PreparedScript,
        results: &mut Vec<StatementResult>,
    ) -> Result<()> {
        let spec = self.database.engine_spec();
        let mut conn = self
            .database
            .get_raw_connection(prepared.catalog.as_deref(), prepared.schema.as_deref())
            .await
            .map_err(|e| database_error(self.database.as_ref(), e))?;
        let mut cursor = conn
            .cursor()
            .map_err(|e| database_error(self.database.as_ref(), e))?;

        let runner = StatementRunner {
            database: self.database.as_ref(),
            engine_spec: spec.as_ref(),
            queries: self.state.queries.as_ref(),
            config: &self.state.config,
            query,
            tracked: false,
        };
        runner.run(cursor.as_mut(), &prepared.statements, results).await?;

        if prepared.has_mutation {
            conn.commit()
                .await
                .map_err(|e| database_error(self.database.as_ref(), e))?;
        }
        Ok(())
    }

    /// Queue a script for background execution.
    ///
    /// Dry runs and cache hits complete immediately.
    pub async fn execute_async(&self, sql: &str, options: QueryOptions) -> Result<AsyncQueryHandle> {
        let prepared = self.prepare(sql, &options).await?;
        if options.dry_run {
            return Ok(AsyncQueryHandle::completed(prepared.dry_run_result()));
        }
        if let Some(cached) = self.cached(&prepared, &options).await {
            return Ok(AsyncQueryHandle::completed(cached));
        }

        let query = self.create_record(&prepared, &options, QueryStatus::Pending).await;
        let task = QueryTask::new(
            self.state.clone(),
            self.database.clone(),
            query.id,
            prepared,
            self.principal.id.clone(),
        );
        if let Err(err) = self.state.jobs.add(Arc::new(task)) {
            self.state
                .queries
                .update(
                    query.id,
                    QueryUpdate::status(QueryStatus::Failed)
                        .with_error(err.to_string())
                        .with_end_time(Utc::now()),
                )
                .await;
            return Err(err);
        }

        Ok(AsyncQueryHandle::tracked(
            query.id,
            query.status,
            query.start_time,
            self.state.queries.clone(),
            self.state.results.clone(),
            self.database.clone(),
        ))
    }
}
