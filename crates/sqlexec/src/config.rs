//! Process wide configuration read by the executor and workers.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::errors::{ExecError, Result};

/// Hook rewriting each statement before it's sent to the database. Receives
/// the SQL and the database name.
pub type SqlMutator = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Hook called before each statement runs with the database name, the SQL and
/// the schema.
pub type QueryLogger = Arc<dyn Fn(&str, &str, Option<&str>) + Send + Sync>;

/// Configuration shared by all executions in a process.
///
/// Built once at startup, then shared behind an `Arc`.
#[derive(Clone)]
pub struct CoreConfig {
    /// Timeout for synchronous execution.
    pub sqllab_timeout: Duration,
    /// Soft time limit for background execution.
    pub async_time_limit: Duration,
    pub sql_max_row: u64,
    pub cache_default_timeout: Duration,
    /// Max compressed size of a background result payload in megabytes.
    pub payload_max_mb: Option<f64>,
    /// Function names callers may not use, per engine.
    pub disallowed_functions: BTreeMap<String, BTreeSet<String>>,
    /// Additional dialect names mapped to a known dialect.
    pub dialect_extensions: BTreeMap<String, String>,
    /// Encode background results as Arrow IPC rather than JSON.
    pub results_use_msgpack: bool,
    pub results_default_timeout: Duration,
    pub worker_pool_size: usize,
    query_logger: Option<QueryLogger>,
    sql_mutator: Option<SqlMutator>,
}

impl CoreConfig {
    pub fn new() -> Self {
        let disallowed = [
            (
                "postgresql",
                &["version", "query_to_xml", "inet_server_addr", "inet_client_addr"][..],
            ),
            ("clickhouse", &["url"][..]),
            ("mysql", &["version"][..]),
        ]
        .into_iter()
        .map(|(engine, funcs)| {
            (
                engine.to_string(),
                funcs.iter().map(|f| f.to_string()).collect(),
            )
        })
        .collect();

        CoreConfig {
            sqllab_timeout: Duration::from_secs(30),
            async_time_limit: Duration::from_secs(21_600),
            sql_max_row: 100_000,
            cache_default_timeout: Duration::from_secs(300),
            payload_max_mb: None,
            disallowed_functions: disallowed,
            dialect_extensions: BTreeMap::new(),
            results_use_msgpack: true,
            results_default_timeout: Duration::from_secs(86_400),
            worker_pool_size: num_cpus::get(),
            query_logger: None,
            sql_mutator: None,
        }
    }

    /// Build a config from `(name, value)` pairs, ignoring unknown names.
    pub fn from_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut conf = Self::new();
        for (name, value) in vars {
            if SETTINGS.contains_key(name.as_ref()) {
                conf.set(name.as_ref(), value.as_ref())?;
            }
        }
        Ok(conf)
    }

    /// Build a config from environment variables named after the settings.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Set a setting by its configuration key.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let func = SETTINGS
            .get(name)
            .ok_or_else(|| ExecError::UnknownSetting(name.to_string()))?;
        (func.set)(value.trim(), self)
    }

    /// Current value of a setting rendered as text.
    pub fn get(&self, name: &str) -> Result<String> {
        let func = SETTINGS
            .get(name)
            .ok_or_else(|| ExecError::UnknownSetting(name.to_string()))?;
        Ok((func.get)(self))
    }

    /// Names and descriptions of all settings.
    pub fn settings() -> impl Iterator<Item = (&'static str, &'static str)> {
        let mut settings: Vec<_> = SETTINGS.iter().map(|(name, f)| (*name, f.description)).collect();
        settings.sort();
        settings.into_iter()
    }

    pub fn with_query_logger(mut self, logger: QueryLogger) -> Self {
        self.query_logger = Some(logger);
        self
    }

    pub fn with_sql_mutator(mut self, mutator: SqlMutator) -> Self {
        self.sql_mutator = Some(mutator);
        self
    }

    /// Run the SQL mutator, if any.
    pub fn mutate_sql(&self, sql: &str, database: &str) -> String {
        match &self.sql_mutator {
            Some(mutator) => mutator(sql, database),
            None => sql.to_string(),
        }
    }

    pub fn log_query(&self, database: &str, sql: &str, schema: Option<&str>) {
        if let Some(logger) = &self.query_logger {
            logger(database, sql, schema);
        }
    }

    /// Disallowed functions for an engine, sorted.
    pub fn disallowed_functions_for(&self, engine: &str) -> Vec<String> {
        self.disallowed_functions
            .get(engine)
            .map(|funcs| funcs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Max payload size in bytes.
    pub fn payload_max_bytes(&self) -> Option<usize> {
        self.payload_max_mb
            .map(|mb| (mb * 1024.0 * 1024.0) as usize)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreConfig")
            .field("sqllab_timeout", &self.sqllab_timeout)
            .field("async_time_limit", &self.async_time_limit)
            .field("sql_max_row", &self.sql_max_row)
            .field("cache_default_timeout", &self.cache_default_timeout)
            .field("payload_max_mb", &self.payload_max_mb)
            .field("disallowed_functions", &self.disallowed_functions)
            .field("dialect_extensions", &self.dialect_extensions)
            .field("results_use_msgpack", &self.results_use_msgpack)
            .field("results_default_timeout", &self.results_default_timeout)
            .field("worker_pool_size", &self.worker_pool_size)
            .field("query_logger", &self.query_logger.is_some())
            .field("sql_mutator", &self.sql_mutator.is_some())
            .finish()
    }
}

struct SettingFunctions {
    description: &'static str,
    set: fn(value: &str, conf: &mut CoreConfig) -> Result<()>,
    get: fn(conf: &CoreConfig) -> String,
}

impl SettingFunctions {
    const fn new<S: ConfigSetting>() -> Self {
        SettingFunctions {
            description: S::DESCRIPTION,
            set: S::set_from_str as _,
            get: S::get_as_string as _,
        }
    }
}

fn insert_setting<S: ConfigSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static SETTINGS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<SqllabTimeout>(&mut map);
    insert_setting::<SqllabAsyncTimeLimit>(&mut map);
    insert_setting::<SqlMaxRow>(&mut map);
    insert_setting::<CacheDefaultTimeout>(&mut map);
    insert_setting::<SqllabPayloadMaxMb>(&mut map);
    insert_setting::<DisallowedSqlFunctions>(&mut map);
    insert_setting::<DialectExtensions>(&mut map);
    insert_setting::<ResultsBackendUseMsgpack>(&mut map);
    insert_setting::<ResultsBackendDefaultTimeout>(&mut map);
    insert_setting::<WorkerPoolSize>(&mut map);

    map
});

pub trait ConfigSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_str(value: &str, conf: &mut CoreConfig) -> Result<()>;
    fn get_as_string(conf: &CoreConfig) -> String;
}

fn invalid<S: ConfigSetting>(reason: impl fmt::Display) -> ExecError {
    ExecError::InvalidSetting {
        name: S::NAME.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_u64<S: ConfigSetting>(value: &str) -> Result<u64> {
    value.parse().map_err(invalid::<S>)
}

fn parse_seconds<S: ConfigSetting>(value: &str) -> Result<Duration> {
    Ok(Duration::from_secs(parse_u64::<S>(value)?))
}

fn parse_bool<S: ConfigSetting>(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(invalid::<S>(format!("expected a boolean, got '{other}'"))),
    }
}

pub struct SqllabTimeout;

impl ConfigSetting for SqllabTimeout {
    const NAME: &'static str = "SQLLAB_TIMEOUT";
    const DESCRIPTION: &'static str = "Seconds a synchronous query may run";

    fn set_from_str(value: &str, conf: &mut CoreConfig) -> Result<()> {
        conf.sqllab_timeout = parse_seconds::<Self>(value)?;
        Ok(())
    }

    fn get_as_string(conf: &CoreConfig) -> String {
        conf.sqllab_timeout.as_secs().to_string()
    }
}

pub struct SqllabAsyncTimeLimit;

impl ConfigSetting for SqllabAsyncTimeLimit {
    const NAME: &'static str = "SQLLAB_ASYNC_TIME_LIMIT_SEC";
    const DESCRIPTION: &'static str = "Seconds a background query may run";

    fn set_from_str(value: &str, conf: &mut CoreConfig) -> Result<()> {
        conf.async_time_limit = parse_seconds::<Self>(value)?;
        Ok(())
    }

    fn get_as_string(conf: &CoreConfig) -> String {
        conf.async_time_limit.as_secs().to_string()
    }
}

pub struct SqlMaxRow;

impl ConfigSetting for SqlMaxRow {
    const NAME: &'static str = "SQL_MAX_ROW";
    const DESCRIPTION: &'static str = "Upper bound for row limits requested by callers";

    fn set_from_str(value: &str, conf: &mut CoreConfig) -> Result<()> {
        let val = parse_u64::<Self>(value)?;
        if val == 0 {
            return Err(invalid::<Self>("must be greater than zero"));
        }
        conf.sql_max_row = val;
        Ok(())
    }

    fn get_as_string(conf: &CoreConfig) -> String {
        conf.sql_max_row.to_string()
    }
}

pub struct CacheDefaultTimeout;

impl ConfigSetting for CacheDefaultTimeout {
    const NAME: &'static str = "CACHE_DEFAULT_TIMEOUT";
    const DESCRIPTION: &'static str = "Seconds a cached result is kept when no other timeout applies";

    fn set_from_str(value: &str, conf: &mut CoreConfig) -> Result<()> {
        conf.cache_default_timeout = parse_seconds::<Self>(value)?;
        Ok(())
    }

    fn get_as_string(conf: &CoreConfig) -> String {
        conf.cache_default_timeout.as_secs().to_string()
    }
}

pub struct SqllabPayloadMaxMb;

impl ConfigSetting for SqllabPayloadMaxMb {
    const NAME: &'static str = "SQLLAB_PAYLOAD_MAX_MB";
    const DESCRIPTION: &'static str = "Max size of a background result payload in megabytes";

    fn set_from_str(value: &str, conf: &mut CoreConfig) -> Result<()> {
        if value.is_empty() || value.eq_ignore_ascii_case("none") {
            conf.payload_max_mb = None;
            return Ok(());
        }
        let val: f64 = value.parse().map_err(invalid::<Self>)?;
        if !val.is_finite() || val < 0.0 {
            return Err(invalid::<Self>("must be a non-negative number"));
        }
        conf.payload_max_mb = Some(val);
        Ok(())
    }

    fn get_as_string(conf: &CoreConfig) -> String {
        match conf.payload_max_mb {
            Some(val) => val.to_string(),
            None => "none".to_string(),
        }
    }
}

pub struct DisallowedSqlFunctions;

impl ConfigSetting for DisallowedSqlFunctions {
    const NAME: &'static str = "DISALLOWED_SQL_FUNCTIONS";
    const DESCRIPTION: &'static str = "JSON object mapping engines to function names callers may not use";

    fn set_from_str(value: &str, conf: &mut CoreConfig) -> Result<()> {
        conf.disallowed_functions = serde_json::from_str(value).map_err(invalid::<Self>)?;
        Ok(())
    }

    fn get_as_string(conf: &CoreConfig) -> String {
        serde_json::to_string(&conf.disallowed_functions).unwrap_or_default()
    }
}

pub struct DialectExtensions;

impl ConfigSetting for DialectExtensions {
    const NAME: &'static str = "SQLGLOT_DIALECTS_EXTENSIONS";
    const DESCRIPTION: &'static str = "JSON object mapping extra dialect names to known dialects";

    fn set_from_str(value: &str, conf: &mut CoreConfig) -> Result<()> {
        conf.dialect_extensions = serde_json::from_str(value).map_err(invalid::<Self>)?;
        Ok(())
    }

    fn get_as_string(conf: &CoreConfig) -> String {
        serde_json::to_string(&conf.dialect_extensions).unwrap_or_default()
    }
}

pub struct ResultsBackendUseMsgpack;

impl ConfigSetting for ResultsBackendUseMsgpack {
    const NAME: &'static str = "RESULTS_BACKEND_USE_MSGPACK";
    const DESCRIPTION: &'static str = "Encode background results as Arrow IPC instead of JSON";

    fn set_from_str(value: &str, conf: &mut CoreConfig) -> Result<()> {
        conf.results_use_msgpack = parse_bool::<Self>(value)?;
        Ok(())
    }

    fn get_as_string(conf: &CoreConfig) -> String {
        conf.results_use_msgpack.to_string()
    }
}

pub struct ResultsBackendDefaultTimeout;

impl ConfigSetting for ResultsBackendDefaultTimeout {
    const NAME: &'static str = "RESULTS_BACKEND_DEFAULT_TIMEOUT";
    const DESCRIPTION: &'static str = "Seconds a background result payload is kept";

    fn set_from_str(value: &str, conf: &mut CoreConfig) -> Result<()> {
        conf.results_default_timeout = parse_seconds::<Self>(value)?;
        Ok(())
    }

    fn get_as_string(conf: &CoreConfig) -> String {
        conf.results_default_timeout.as_secs().to_string()
    }
}

const MIN_WORKER_POOL_SIZE: usize = 1;
const MAX_WORKER_POOL_SIZE: usize = 512;

pub struct WorkerPoolSize;

impl ConfigSetting for WorkerPoolSize {
    const NAME: &'static str = "SQLLAB_WORKER_POOL_SIZE";
    const DESCRIPTION: &'static str = "Number of background queries that may run at once";

    fn set_from_str(value: &str, conf: &mut CoreConfig) -> Result<()> {
        let val = parse_u64::<Self>(value)? as usize;
        if !(MIN_WORKER_POOL_SIZE..=MAX_WORKER_POOL_SIZE).contains(&val) {
            return Err(invalid::<Self>(format!(
                "must be between {MIN_WORKER_POOL_SIZE} and {MAX_WORKER_POOL_SIZE}"
            )));
        }
        conf.worker_pool_size = val;
        Ok(())
    }

    fn get_as_string(conf: &CoreConfig) -> String {
        conf.worker_pool_size.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let conf = CoreConfig::new();
        assert_eq!(Duration::from_secs(30), conf.sqllab_timeout);
        assert_eq!(Duration::from_secs(21_600), conf.async_time_limit);
        assert_eq!(100_000, conf.sql_max_row);
        assert_eq!(Duration::from_secs(300), conf.cache_default_timeout);
        assert_eq!(None, conf.payload_max_mb);
        assert!(conf.results_use_msgpack);
        assert_eq!(
            vec!["inet_client_addr", "inet_server_addr", "query_to_xml", "version"],
            conf.disallowed_functions_for("postgresql")
        );
        assert!(conf.disallowed_functions_for("sqlite").is_empty());
    }

    #[test]
    fn set_by_name() {
        let test_cases = [
            ("SQLLAB_TIMEOUT", "45", "45"),
            ("SQL_MAX_ROW", "10", "10"),
            ("SQLLAB_PAYLOAD_MAX_MB", "2.5", "2.5"),
            ("SQLLAB_PAYLOAD_MAX_MB", "none", "none"),
            ("RESULTS_BACKEND_USE_MSGPACK", "off", "false"),
            ("SQLLAB_WORKER_POOL_SIZE", "4", "4"),
            ("SQLGLOT_DIALECTS_EXTENSIONS", r#"{"mydb": "postgresql"}"#, r#"{"mydb":"postgresql"}"#),
        ];

        for (name, value, expected) in test_cases {
            let mut conf = CoreConfig::new();
            conf.set(name, value).unwrap();
            assert_eq!(expected, conf.get(name).unwrap(), "setting: {name}");
        }
    }

    #[test]
    fn reject_invalid_values() {
        let test_cases = [
            ("SQLLAB_TIMEOUT", "soon"),
            ("SQL_MAX_ROW", "0"),
            ("SQLLAB_PAYLOAD_MAX_MB", "-1"),
            ("RESULTS_BACKEND_USE_MSGPACK", "maybe"),
            ("SQLLAB_WORKER_POOL_SIZE", "0"),
            ("DISALLOWED_SQL_FUNCTIONS", "[1, 2]"),
            ("NOT_A_SETTING", "1"),
        ];

        for (name, value) in test_cases {
            let mut conf = CoreConfig::new();
            conf.set(name, value).unwrap_err();
        }
    }

    #[test]
    fn from_vars_skips_unrelated_names() {
        let conf = CoreConfig::from_vars([
            ("PATH", "/usr/bin"),
            ("SQLLAB_TIMEOUT", "5"),
            ("DISALLOWED_SQL_FUNCTIONS", r#"{"sqlite": ["load_extension"]}"#),
        ])
        .unwrap();
        assert_eq!(Duration::from_secs(5), conf.sqllab_timeout);
        assert_eq!(vec!["load_extension"], conf.disallowed_functions_for("sqlite"));
        assert!(conf.disallowed_functions_for("postgresql").is_empty());
    }

    #[test]
    fn hooks() {
        let conf = CoreConfig::new()
            .with_sql_mutator(Arc::new(|sql: &str, db: &str| format!("-- {db}\n{sql}")));
        assert_eq!("-- main\nSELECT 1", conf.mutate_sql("SELECT 1", "main"));
        assert_eq!("SELECT 1", CoreConfig::new().mutate_sql("SELECT 1", "main"));
    }

    #[test]
    fn settings_are_listed() {
        let names: Vec<_> = CoreConfig::settings().map(|(name, _)| name).collect();
        assert!(names.contains(&"SQLLAB_ASYNC_TIME_LIMIT_SEC"));
        assert!(names.contains(&"RESULTS_BACKEND_DEFAULT_TIMEOUT"));
    }
}
