use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use sqlparser::parser::ParserError;
use sqlparser::tokenizer::TokenizerError;

static LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Line: (\d+), Column: (\d+)").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("unknown dialect backend '{0}'")]
    UnknownBackend(String),

    #[error("{operation} is not supported for dialect '{dialect}'")]
    Unsupported {
        operation: &'static str,
        dialect: String,
    },
}

pub type Result<T, E = ScriptError> = std::result::Result<T, E>;

/// A script or statement could not be parsed.
///
/// Line and column are 1-based and refer to the text in `sql`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub dialect: String,
    pub sql: String,
    pub line: Option<u64>,
    pub column: Option<u64>,
}

impl ParseError {
    pub fn new(message: impl Into<String>, sql: impl Into<String>, dialect: impl Into<String>) -> Self {
        ParseError {
            message: message.into(),
            dialect: dialect.into(),
            sql: sql.into(),
            line: None,
            column: None,
        }
    }

    pub fn with_location(mut self, line: u64, column: u64) -> Self {
        // Line 0 is how the tokenizer marks an empty span.
        if line > 0 {
            self.line = Some(line);
            self.column = Some(column);
        }
        self
    }

    pub(crate) fn from_parser(err: ParserError, sql: &str, dialect: &str) -> Self {
        let message = match err {
            ParserError::TokenizerError(s) | ParserError::ParserError(s) => s,
            ParserError::RecursionLimitExceeded => "recursion limit exceeded".to_string(),
        };

        let location = LOCATION_RE.captures(&message).and_then(|caps| {
            let line = caps.get(1)?.as_str().parse().ok()?;
            let column = caps.get(2)?.as_str().parse().ok()?;
            Some((line, column))
        });

        let err = ParseError::new(message, sql, dialect);
        match location {
            Some((line, column)) => err.with_location(line, column),
            None => err,
        }
    }

    pub(crate) fn from_tokenizer(err: TokenizerError, sql: &str, dialect: &str) -> Self {
        ParseError::new(err.message, sql, dialect)
            .with_location(err.location.line, err.location.column)
    }

    /// The offending source line with a caret under the error column.
    pub fn highlight(&self) -> Option<String> {
        let line = self.line?;
        let column = self.column.unwrap_or(1);
        let text = self.sql.lines().nth(line.checked_sub(1)? as usize)?;
        let pad = " ".repeat(column.saturating_sub(1) as usize);
        Some(format!("{text}\n{pad}^"))
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error parsing {} query: {}", self.dialect, self.message)?;
        if let Some(highlight) = self.highlight() {
            write!(f, "\n{highlight}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}
