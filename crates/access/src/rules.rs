use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlscript::Table;

use crate::errors::{AccessError, Result};

/// Column level security action.
///
/// Variants are ordered by strictness, `Hide` being the strictest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ClsAction {
    Hash,
    Mask,
    Nullify,
    Hide,
}

impl ClsAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ClsAction::Hash => "hash",
            ClsAction::Mask => "mask",
            ClsAction::Nullify => "nullify",
            ClsAction::Hide => "hide",
        }
    }
}

impl fmt::Display for ClsAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ClsAction {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_lowercase().as_str() {
            "hash" => ClsAction::Hash,
            "mask" => ClsAction::Mask,
            "nullify" => ClsAction::Nullify,
            "hide" => ClsAction::Hide,
            _ => return Err(AccessError::UnknownClsAction(s.to_string())),
        })
    }
}

impl TryFrom<String> for ClsAction {
    type Error = AccessError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// A row level security predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlsRule {
    #[serde(default)]
    pub predicate: String,
    /// Predicates sharing a group key are OR-ed together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
}

/// One allowed or denied entry. Absent levels match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEntry {
    #[serde(default)]
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rls: Option<RlsRule>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cls: BTreeMap<String, ClsAction>,
}

impl RuleEntry {
    pub fn new(database: impl Into<String>) -> Self {
        RuleEntry {
            database: database.into(),
            ..Default::default()
        }
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_rls(mut self, predicate: impl Into<String>, group_key: Option<&str>) -> Self {
        self.rls = Some(RlsRule {
            predicate: predicate.into(),
            group_key: group_key.map(|k| k.to_string()),
        });
        self
    }

    pub fn with_cls(mut self, column: impl Into<String>, action: ClsAction) -> Self {
        self.cls.insert(column.into(), action);
        self
    }

    /// Check if this entry covers the table in the given database.
    ///
    /// A level the table leaves unspecified isn't compared.
    pub fn matches(&self, database: &str, table: &Table) -> bool {
        self.database == database
            && level_matches(self.catalog.as_deref(), table.catalog.as_deref())
            && level_matches(self.schema.as_deref(), table.schema.as_deref())
            && level_matches(self.table.as_deref(), Some(&table.table))
    }

    /// Number of populated levels below the database.
    pub fn specificity(&self) -> usize {
        [&self.catalog, &self.schema, &self.table]
            .into_iter()
            .filter(|level| level.is_some())
            .count()
    }
}

fn level_matches(entry: Option<&str>, target: Option<&str>) -> bool {
    match (entry, target) {
        (Some(entry), Some(target)) => entry == target,
        _ => true,
    }
}

/// An access rule document attached to a role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    #[serde(default)]
    pub allowed: Vec<RuleEntry>,
    #[serde(default)]
    pub denied: Vec<RuleEntry>,
}

impl AccessRule {
    /// Parse and validate a rule document.
    pub fn from_json(text: &str) -> Result<Self> {
        let rule: AccessRule = serde_json::from_str(text)?;
        rule.validate()?;
        Ok(rule)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let rule: AccessRule = serde_json::from_value(value)?;
        rule.validate()?;
        Ok(rule)
    }

    pub fn validate(&self) -> Result<()> {
        for (list, entries) in [("allowed", &self.allowed), ("denied", &self.denied)] {
            for (index, entry) in entries.iter().enumerate() {
                if entry.database.is_empty() {
                    return Err(AccessError::MissingDatabase { list, index });
                }
                if let Some(rls) = &entry.rls {
                    if rls.predicate.trim().is_empty() {
                        return Err(AccessError::EmptyPredicate { list, index });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rule_document() {
        let rule = AccessRule::from_json(
            r#"{
                "allowed": [
                    {"database": "mydb", "schema": "public", "table": "users",
                     "rls": {"predicate": "org_id = 7", "group_key": "org"},
                     "cls": {"ssn": "hide", "email": "MASK"}}
                ],
                "denied": [{"database": "mydb", "schema": "secret"}]
            }"#,
        )
        .unwrap();

        let expected = AccessRule {
            allowed: vec![
                RuleEntry::new("mydb")
                    .with_schema("public")
                    .with_table("users")
                    .with_rls("org_id = 7", Some("org"))
                    .with_cls("ssn", ClsAction::Hide)
                    .with_cls("email", ClsAction::Mask),
            ],
            denied: vec![RuleEntry::new("mydb").with_schema("secret")],
        };
        assert_eq!(expected, rule);
    }

    #[test]
    fn reject_invalid_documents() {
        let test_cases = [
            r#"{"allowed": [{"schema": "public"}]}"#,
            r#"{"denied": [{"database": ""}]}"#,
            r#"{"allowed": [{"database": "db", "cls": {"a": "encrypt"}}]}"#,
            r#"{"allowed": [{"database": "db", "rls": {"predicate": "  "}}]}"#,
            r#"{"allowed": "#,
        ];

        for text in test_cases {
            assert!(AccessRule::from_json(text).is_err(), "text: {text}");
        }

        let err = AccessRule::from_json(r#"{"allowed": [{"table": "t"}]}"#).unwrap_err();
        assert!(matches!(err, AccessError::MissingDatabase { list: "allowed", index: 0 }));
    }

    #[test]
    fn strictness_order() {
        assert!(ClsAction::Hide > ClsAction::Nullify);
        assert!(ClsAction::Nullify > ClsAction::Mask);
        assert!(ClsAction::Mask > ClsAction::Hash);
    }

    #[test]
    fn entry_matching() {
        let table = Table::new("users").with_schema("public").with_catalog("main");
        let test_cases = [
            (RuleEntry::new("mydb"), true, 0),
            (RuleEntry::new("other"), false, 0),
            (RuleEntry::new("mydb").with_schema("public"), true, 1),
            (RuleEntry::new("mydb").with_schema("private"), false, 1),
            (RuleEntry::new("mydb").with_catalog("main").with_schema("public").with_table("users"), true, 3),
            (RuleEntry::new("mydb").with_table("orders"), false, 1),
        ];

        for (entry, matches, specificity) in test_cases {
            assert_eq!(matches, entry.matches("mydb", &table), "entry: {entry:?}");
            assert_eq!(specificity, entry.specificity());
        }

        // Targets without a catalog still match entries that name one.
        let uncataloged = Table::new("users").with_schema("public");
        assert!(RuleEntry::new("mydb").with_catalog("main").matches("mydb", &uncataloged));
    }
}
