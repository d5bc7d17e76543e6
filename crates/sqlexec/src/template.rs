//! Jinja templating of SQL text before parsing.
use minijinja::Environment;
use serde_json::{Map, Value};

use crate::errors::Result;
use crate::options::Principal;

/// Render `sql` as a template with the given parameters.
///
/// Templates may call `current_username()` and `current_user_id()` to get
/// the principal running the query.
pub fn render_sql(sql: &str, params: &Map<String, Value>, principal: &Principal) -> Result<String> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);

    let username = principal.username.clone();
    env.add_function("current_username", move || username.clone());
    let user_id = principal.id.clone();
    env.add_function("current_user_id", move || user_id.clone());

    Ok(env.render_str(sql, params)?)
}
