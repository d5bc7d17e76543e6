//! Registry mapping dialect identifiers onto parser backends.
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use sqlparser::dialect::{
    AnsiDialect, BigQueryDialect, ClickHouseDialect, DatabricksDialect, Dialect as ParserDialect,
    DuckDbDialect, GenericDialect, HiveDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect,
    RedshiftSqlDialect, SQLiteDialect, SnowflakeDialect,
};
use tracing::debug;

use crate::errors::{Result, ScriptError};

/// SQL grammars understood by the AST parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlBackend {
    Generic,
    Ansi,
    PostgreSql,
    MySql,
    Snowflake,
    BigQuery,
    ClickHouse,
    Databricks,
    DuckDb,
    Hive,
    MsSql,
    Redshift,
    Sqlite,
}

impl SqlBackend {
    const ALL: [SqlBackend; 13] = [
        SqlBackend::Generic,
        SqlBackend::Ansi,
        SqlBackend::PostgreSql,
        SqlBackend::MySql,
        SqlBackend::Snowflake,
        SqlBackend::BigQuery,
        SqlBackend::ClickHouse,
        SqlBackend::Databricks,
        SqlBackend::DuckDb,
        SqlBackend::Hive,
        SqlBackend::MsSql,
        SqlBackend::Redshift,
        SqlBackend::Sqlite,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            SqlBackend::Generic => "generic",
            SqlBackend::Ansi => "ansi",
            SqlBackend::PostgreSql => "postgres",
            SqlBackend::MySql => "mysql",
            SqlBackend::Snowflake => "snowflake",
            SqlBackend::BigQuery => "bigquery",
            SqlBackend::ClickHouse => "clickhouse",
            SqlBackend::Databricks => "databricks",
            SqlBackend::DuckDb => "duckdb",
            SqlBackend::Hive => "hive",
            SqlBackend::MsSql => "tsql",
            SqlBackend::Redshift => "redshift",
            SqlBackend::Sqlite => "sqlite",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    /// Get a fresh parser dialect for this backend.
    pub fn parser_dialect(&self) -> Box<dyn ParserDialect> {
        match self {
            SqlBackend::Generic => Box::new(GenericDialect {}),
            SqlBackend::Ansi => Box::new(AnsiDialect {}),
            SqlBackend::PostgreSql => Box::new(PostgreSqlDialect {}),
            SqlBackend::MySql => Box::new(MySqlDialect {}),
            SqlBackend::Snowflake => Box::new(SnowflakeDialect {}),
            SqlBackend::BigQuery => Box::new(BigQueryDialect {}),
            SqlBackend::ClickHouse => Box::new(ClickHouseDialect {}),
            SqlBackend::Databricks => Box::new(DatabricksDialect {}),
            SqlBackend::DuckDb => Box::new(DuckDbDialect {}),
            SqlBackend::Hive => Box::new(HiveDialect {}),
            SqlBackend::MsSql => Box::new(MsSqlDialect {}),
            SqlBackend::Redshift => Box::new(RedshiftSqlDialect {}),
            SqlBackend::Sqlite => Box::new(SQLiteDialect {}),
        }
    }
}

/// How statements of a dialect are split and analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Sql(SqlBackend),
    /// Kusto query language, handled with a string-aware splitter instead of
    /// an AST.
    Kql,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Sql(b) => b.name(),
            Backend::Kql => "kql",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        if name == "kql" {
            return Some(Backend::Kql);
        }
        SqlBackend::from_name(name).map(Backend::Sql)
    }
}

/// A resolved dialect: the identifier the caller used and the backend that
/// handles it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dialect {
    name: String,
    backend: Backend,
}

impl Dialect {
    pub fn new(name: impl Into<String>, backend: Backend) -> Self {
        Dialect {
            name: name.into(),
            backend,
        }
    }

    /// Resolve a dialect identifier with the built-in registry.
    pub fn from_name(name: &str) -> Self {
        BUILTIN_REGISTRY.resolve(name)
    }

    pub fn generic() -> Self {
        Dialect::new("base", Backend::Sql(SqlBackend::Generic))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn is_kql(&self) -> bool {
        self.backend == Backend::Kql
    }

    /// Whether table references can be extracted from statements of this
    /// dialect, which access rules depend on.
    pub fn supports_access_rules(&self) -> bool {
        !self.is_kql()
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

static BUILTIN_DIALECTS: LazyLock<HashMap<&'static str, Backend>> = LazyLock::new(|| {
    use SqlBackend::*;

    let mut map = HashMap::new();

    insert_dialects(&mut map, &["base", "generic"], Backend::Sql(Generic));
    insert_dialects(
        &mut map,
        &["postgresql", "postgres", "cockroachdb", "netezza", "hana", "vertica"],
        Backend::Sql(PostgreSql),
    );
    insert_dialects(
        &mut map,
        &["mysql", "mariadb", "singlestoredb", "starrocks", "doris"],
        Backend::Sql(MySql),
    );
    insert_dialects(&mut map, &["snowflake"], Backend::Sql(Snowflake));
    insert_dialects(&mut map, &["bigquery"], Backend::Sql(BigQuery));
    insert_dialects(&mut map, &["clickhouse", "clickhousedb"], Backend::Sql(ClickHouse));
    insert_dialects(&mut map, &["databricks"], Backend::Sql(Databricks));
    insert_dialects(&mut map, &["duckdb", "motherduck"], Backend::Sql(DuckDb));
    insert_dialects(&mut map, &["hive", "impala", "ascend", "spark"], Backend::Sql(Hive));
    insert_dialects(&mut map, &["mssql", "sybase", "kustosql"], Backend::Sql(MsSql));
    insert_dialects(&mut map, &["redshift"], Backend::Sql(Redshift));
    insert_dialects(
        &mut map,
        &["sqlite", "gsheets", "shillelagh", "superset"],
        Backend::Sql(Sqlite),
    );
    insert_dialects(&mut map, &["trino", "presto", "awsathena"], Backend::Sql(Ansi));
    insert_dialects(
        &mut map,
        &["oracle", "teradata", "db2", "dremio", "drill", "firebolt", "exasol", "kylin"],
        Backend::Sql(Generic),
    );
    insert_dialects(&mut map, &["kustokql"], Backend::Kql);

    map
});

static BUILTIN_REGISTRY: LazyLock<DialectRegistry> = LazyLock::new(DialectRegistry::new);

fn insert_dialects(map: &mut HashMap<&'static str, Backend>, names: &[&'static str], backend: Backend) {
    for name in names {
        if map.insert(*name, backend).is_some() {
            panic!("Duplicate dialect names: {name}");
        }
    }
}

/// Maps dialect identifiers to backends.
///
/// Unknown identifiers resolve to the generic SQL backend.
#[derive(Debug, Clone)]
pub struct DialectRegistry {
    entries: HashMap<String, Backend>,
}

impl Default for DialectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DialectRegistry {
    /// Create a registry with the built-in dialects.
    pub fn new() -> Self {
        DialectRegistry {
            entries: BUILTIN_DIALECTS
                .iter()
                .map(|(name, backend)| (name.to_string(), *backend))
                .collect(),
        }
    }

    /// Extend the registry with `identifier -> backend name` pairs.
    ///
    /// Extensions may override built-in identifiers.
    pub fn with_extensions<'a>(
        mut self,
        extensions: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Self> {
        for (name, backend_name) in extensions {
            let backend = Backend::from_name(backend_name)
                .or_else(|| self.entries.get(backend_name.as_str()).copied())
                .ok_or_else(|| ScriptError::UnknownBackend(backend_name.clone()))?;
            self.entries.insert(name.clone(), backend);
        }
        Ok(self)
    }

    pub fn resolve(&self, name: &str) -> Dialect {
        match self.entries.get(name) {
            Some(backend) => Dialect::new(name, *backend),
            None => {
                debug!(%name, "unknown dialect, falling back to generic sql");
                Dialect::new(name, Backend::Sql(SqlBackend::Generic))
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}
