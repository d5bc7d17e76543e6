use std::time::Duration;

use access::RuleSet;
use serde_json::{Map, Value};

/// Identity a script runs as, with the access rules visible to it.
#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub id: Option<String>,
    pub username: Option<String>,
    pub rules: RuleSet,
}

impl Principal {
    pub fn new(id: Option<&str>, username: Option<&str>) -> Self {
        Principal {
            id: id.map(|s| s.to_string()),
            username: username.map(|s| s.to_string()),
            rules: RuleSet::default(),
        }
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Skip the cache lookup. Fresh results are still cached.
    pub force_refresh: bool,
    /// TTL for the cached result, overriding the database and process
    /// defaults.
    pub timeout: Option<Duration>,
}

/// Per call execution options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    /// Row limit applied to the last statement, capped at `SQL_MAX_ROW`.
    pub limit: Option<u64>,
    /// Overrides `SQLLAB_TIMEOUT` for synchronous execution.
    pub timeout_seconds: Option<u64>,
    /// Render the script as a template with these parameters.
    pub template_params: Option<Map<String, Value>>,
    pub cache: CacheOptions,
    /// Transform and check the script without running it.
    pub dry_run: bool,
    pub client_id: Option<String>,
}

impl QueryOptions {
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_template_params(mut self, params: Map<String, Value>) -> Self {
        self.template_params = Some(params);
        self
    }

    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_force_refresh(mut self) -> Self {
        self.cache.force_refresh = true;
        self
    }
}
