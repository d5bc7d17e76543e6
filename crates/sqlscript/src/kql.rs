//! Kusto query language statements.
//!
//! There's no parser for KQL, so statements are kept as text and analyzed
//! with a small string-aware tokenizer.
use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::errors::{ParseError, Result, ScriptError};
use crate::statement::{LimitMethod, SettingValue};

static SET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^set\s+(\w+)(?:\s*=\s*(\w+))?$").unwrap());

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z_0-9]*|\d+|\s+|.").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KqlTokenKind {
    String,
    Word,
    Number,
    Semicolon,
    Whitespace,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KqlToken {
    pub kind: KqlTokenKind,
    pub text: String,
}

impl KqlToken {
    fn new(kind: KqlTokenKind, text: impl Into<String>) -> Self {
        KqlToken {
            kind,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitState {
    Outside,
    SingleQuoted,
    DoubleQuoted,
    Multiline,
}

fn classify(text: &str, out: &mut Vec<KqlToken>) {
    for m in TOKEN_RE.find_iter(text) {
        let tok = m.as_str();
        let kind = if tok == ";" {
            KqlTokenKind::Semicolon
        } else if tok.bytes().all(|b| b.is_ascii_digit()) {
            KqlTokenKind::Number
        } else if tok.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            KqlTokenKind::Word
        } else if tok.chars().all(char::is_whitespace) {
            KqlTokenKind::Whitespace
        } else {
            KqlTokenKind::Other
        };
        out.push(KqlToken::new(kind, tok));
    }
}

/// Turn a KQL script into a flat list of tokens.
///
/// String literals are single tokens. A backslash before a quote doesn't end
/// the string, and multiline strings are delimited by triple backticks.
pub fn tokenize(kql: &str) -> Vec<KqlToken> {
    let mut state = SplitState::Outside;
    let mut tokens = Vec::new();
    let mut buffer = String::new();
    let mut prev: [Option<char>; 2] = [None, None];

    for ch in kql.chars() {
        let after_two_backticks = prev == [Some('`'), Some('`')];
        match state {
            SplitState::Outside => {
                if ch == '\'' || ch == '"' {
                    if !buffer.is_empty() {
                        classify(&buffer, &mut tokens);
                    }
                    state = if ch == '\'' {
                        SplitState::SingleQuoted
                    } else {
                        SplitState::DoubleQuoted
                    };
                    buffer = ch.to_string();
                } else if ch == '`' && after_two_backticks {
                    // Flush whatever preceded the opening backticks.
                    let preceding = &buffer[..buffer.len() - 2];
                    if !preceding.is_empty() {
                        classify(preceding, &mut tokens);
                    }
                    state = SplitState::Multiline;
                    buffer = "```".to_string();
                } else {
                    buffer.push(ch);
                }
            }
            _ => {
                buffer.push(ch);
                let escaped = prev[1] == Some('\\');
                let end = match state {
                    SplitState::SingleQuoted => ch == '\'' && !escaped,
                    SplitState::DoubleQuoted => ch == '"' && !escaped,
                    // The closing backticks can't reuse the opening ones.
                    SplitState::Multiline => ch == '`' && after_two_backticks && buffer.len() >= 6,
                    SplitState::Outside => false,
                };
                if end {
                    tokens.push(KqlToken::new(KqlTokenKind::String, std::mem::take(&mut buffer)));
                    state = SplitState::Outside;
                }
            }
        }
        prev = [prev[1], Some(ch)];
    }

    if !buffer.is_empty() {
        match state {
            SplitState::Outside => classify(&buffer, &mut tokens),
            // Unterminated string, keep the text as is.
            _ => tokens.push(KqlToken::new(KqlTokenKind::String, buffer)),
        }
    }

    tokens
}

/// Split a KQL script on semicolons outside of strings.
///
/// Segments holding only whitespace are dropped.
pub fn split(kql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for token in tokenize(kql) {
        if token.kind == KqlTokenKind::Semicolon {
            if !current.trim().is_empty() {
                statements.push(std::mem::take(&mut current));
            }
            current.clear();
        } else {
            current.push_str(&token.text);
        }
    }
    if !current.trim().is_empty() {
        statements.push(current);
    }

    statements
}

/// A single KQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KqlStatement {
    kql: String,
    dialect: String,
}

impl KqlStatement {
    pub(crate) fn new(kql: &str, dialect: &str) -> Self {
        KqlStatement {
            kql: kql.trim().to_string(),
            dialect: dialect.to_string(),
        }
    }

    /// Parse text holding exactly one KQL statement.
    pub fn parse(kql: &str, dialect: &str) -> Result<Self> {
        let statements = split(kql);
        if statements.len() != 1 {
            return Err(ParseError::new(
                "KQL statement should have exactly one statement",
                kql,
                dialect,
            )
            .into());
        }
        Ok(KqlStatement::new(&statements[0], dialect))
    }

    pub fn kql(&self) -> &str {
        &self.kql
    }

    pub fn dialect(&self) -> &str {
        &self.dialect
    }

    pub fn format(&self) -> String {
        self.kql.clone()
    }

    /// `set name [= value]` yields the value, or `true` when there's none.
    pub fn settings(&self) -> BTreeMap<String, SettingValue> {
        let mut settings = BTreeMap::new();
        if let Some(caps) = SET_RE.captures(&self.kql) {
            let name = caps[1].to_string();
            let value = match caps.get(2) {
                Some(value) => SettingValue::Text(value.as_str().to_string()),
                None => SettingValue::Bool(true),
            };
            settings.insert(name, value);
        }
        settings
    }

    /// Management commands start with a dot, `.show` only reads.
    pub fn is_mutating(&self) -> bool {
        self.kql.starts_with('.') && !self.kql.starts_with(".show")
    }

    pub fn is_select(&self) -> bool {
        !self.kql.starts_with('.')
    }

    pub fn warn_no_table_extraction(&self) {
        warn!(
            dialect = %self.dialect,
            "KQL doesn't support table extraction, data access rules will not be enforced"
        );
    }

    pub fn check_functions_present(&self) -> bool {
        warn!(dialect = %self.dialect, "KQL doesn't support checking for functions present");
        false
    }

    /// The number following the first `take` or `limit` operator.
    pub fn get_limit_value(&self) -> Option<u64> {
        let tokens: Vec<KqlToken> = tokenize(&self.kql)
            .into_iter()
            .filter(|t| t.kind != KqlTokenKind::Whitespace)
            .collect();
        let idx = tokens.iter().position(is_limit_keyword)?;
        match tokens.get(idx + 1) {
            Some(next) if next.kind == KqlTokenKind::Number => next.text.parse().ok(),
            _ => None,
        }
    }

    /// Replace the existing `take` count, or pipe into `take n`.
    pub fn set_limit_value(&mut self, limit: u64, method: LimitMethod) -> Result<()> {
        if method != LimitMethod::Append {
            return Err(ScriptError::Unsupported {
                operation: "wrapping a limit",
                dialect: self.dialect.clone(),
            });
        }

        let mut tokens = tokenize(&self.kql);
        let mut found_keyword = false;
        let mut replaced = false;
        for token in tokens.iter_mut() {
            if is_limit_keyword(token) {
                found_keyword = true;
            }
            if found_keyword && token.kind == KqlTokenKind::Number {
                token.text = limit.to_string();
                replaced = true;
                break;
            }
        }

        let mut kql: String = tokens.into_iter().map(|t| t.text).collect();
        if !replaced {
            kql.push_str(&format!(" | take {limit}"));
        }
        self.kql = kql;
        Ok(())
    }
}

fn is_limit_keyword(token: &KqlToken) -> bool {
    token.kind != KqlTokenKind::String
        && (token.text.eq_ignore_ascii_case("take") || token.text.eq_ignore_ascii_case("limit"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_strings() {
        let test_cases: [(&str, &[&str]); 6] = [
            ("T | take 10", &["T | take 10"]),
            ("T | take 10; U | count", &["T | take 10", " U | count"]),
            ("T | where a == ';'; U", &["T | where a == ';'", " U"]),
            (r#"T | where a == "x\";y"; U"#, &[r#"T | where a == "x\";y""#, " U"]),
            ("T | where a == ```multi;\nline```; U", &["T | where a == ```multi;\nline```", " U"]),
            (" ; ;\n", &[]),
        ];

        for (kql, expected) in test_cases {
            assert_eq!(expected.to_vec(), split(kql), "kql: {kql}");
        }
    }

    #[test]
    fn tokenize_kinds() {
        let kinds: Vec<_> = tokenize("T | take 10 'x'").into_iter().map(|t| t.kind).collect();
        assert_eq!(
            vec![
                KqlTokenKind::Word,
                KqlTokenKind::Whitespace,
                KqlTokenKind::Other,
                KqlTokenKind::Whitespace,
                KqlTokenKind::Word,
                KqlTokenKind::Whitespace,
                KqlTokenKind::Number,
                KqlTokenKind::Whitespace,
                KqlTokenKind::String,
            ],
            kinds
        );
    }

    #[test]
    fn parse_requires_one_statement() {
        assert!(KqlStatement::parse("T | count", "kustokql").is_ok());
        assert!(KqlStatement::parse("T; U", "kustokql").is_err());
        assert!(KqlStatement::parse("", "kustokql").is_err());
    }

    #[test]
    fn settings() {
        let stmt = KqlStatement::new("set querytrace", "kustokql");
        assert_eq!(Some(&SettingValue::Bool(true)), stmt.settings().get("querytrace"));

        let stmt = KqlStatement::new("set truncationmaxrecords = 100", "kustokql");
        assert_eq!(
            Some(&SettingValue::Text("100".to_string())),
            stmt.settings().get("truncationmaxrecords")
        );

        assert!(KqlStatement::new("T | take 1", "kustokql").settings().is_empty());
    }

    #[test]
    fn mutations() {
        let test_cases = [
            ("T | count", false),
            (".show tables", false),
            (".drop table T", true),
            (".set-or-append T <| U", true),
        ];

        for (kql, expected) in test_cases {
            assert_eq!(expected, KqlStatement::new(kql, "kustokql").is_mutating(), "kql: {kql}");
        }
    }

    #[test]
    fn limits() {
        let mut stmt = KqlStatement::new("T | take 500 | where a == 'take 3'", "kustokql");
        assert_eq!(Some(500), stmt.get_limit_value());
        stmt.set_limit_value(10, LimitMethod::Append).unwrap();
        assert_eq!("T | take 10 | where a == 'take 3'", stmt.kql());

        let mut stmt = KqlStatement::new("T | where x > 1", "kustokql");
        assert_eq!(None, stmt.get_limit_value());
        stmt.set_limit_value(10, LimitMethod::Append).unwrap();
        assert_eq!("T | where x > 1 | take 10", stmt.kql());

        assert!(stmt.set_limit_value(10, LimitMethod::Wrap).is_err());
    }
}
