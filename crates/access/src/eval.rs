//! Evaluating rules against tables.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sqlscript::Table;
use tracing::debug;

use crate::rules::{AccessRule, ClsAction, RuleEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessCheck {
    Allowed,
    Denied,
    NoRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlsPredicate {
    pub predicate: String,
    pub group_key: Option<String>,
}

/// Outcome of checking one table against a rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableAccess {
    pub access: AccessCheck,
    pub rls_predicates: Vec<RlsPredicate>,
    pub cls_rules: BTreeMap<String, ClsAction>,
}

impl TableAccess {
    fn without_rules(access: AccessCheck) -> Self {
        TableAccess {
            access,
            rls_predicates: Vec::new(),
            cls_rules: BTreeMap::new(),
        }
    }

    /// Predicates to be AND-ed together.
    ///
    /// Each predicate is parenthesized. Predicates sharing a group key become a
    /// single OR-ed entry. Entries keep the position of the first predicate
    /// they contain.
    pub fn combined_predicates(&self) -> Vec<String> {
        enum Slot<'a> {
            Single(&'a str),
            Group(Vec<&'a str>),
        }

        let mut slots: Vec<Slot> = Vec::new();
        let mut group_slots: BTreeMap<&str, usize> = BTreeMap::new();

        for pred in &self.rls_predicates {
            match pred.group_key.as_deref().filter(|k| !k.is_empty()) {
                None => slots.push(Slot::Single(&pred.predicate)),
                Some(key) => match group_slots.get(key) {
                    Some(&idx) => {
                        if let Slot::Group(members) = &mut slots[idx] {
                            members.push(&pred.predicate);
                        }
                    }
                    None => {
                        group_slots.insert(key, slots.len());
                        slots.push(Slot::Group(vec![&pred.predicate]));
                    }
                },
            }
        }

        slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Single(pred) => format!("({pred})"),
                Slot::Group(members) if members.len() == 1 => format!("({})", members[0]),
                Slot::Group(members) => {
                    let ored: Vec<String> = members.iter().map(|m| format!("({m})")).collect();
                    format!("({})", ored.join(" OR "))
                }
            })
            .collect()
    }
}

/// An allowed entry at any level of the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedEntry {
    pub database: String,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
}

/// The union of rules visible to a principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    rules: Vec<AccessRule>,
}

impl RuleSet {
    pub fn new(rules: impl IntoIterator<Item = AccessRule>) -> Self {
        RuleSet {
            rules: rules.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[AccessRule] {
        &self.rules
    }

    fn allowed(&self) -> impl Iterator<Item = &RuleEntry> {
        self.rules.iter().flat_map(|rule| rule.allowed.iter())
    }

    fn denied(&self) -> impl Iterator<Item = &RuleEntry> {
        self.rules.iter().flat_map(|rule| rule.denied.iter())
    }

    /// Decide access to a table.
    ///
    /// The most specific matching entry on each side is compared. The more
    /// specific one wins and deny wins ties. When access is allowed, predicates
    /// and column actions are gathered from every matching allowed entry.
    pub fn check_table_access(&self, database: &str, table: &Table) -> TableAccess {
        let allowed: Vec<&RuleEntry> = self.allowed().filter(|e| e.matches(database, table)).collect();
        let denied: Vec<&RuleEntry> = self.denied().filter(|e| e.matches(database, table)).collect();

        let access = match (most_specific(&allowed), most_specific(&denied)) {
            (None, None) => AccessCheck::NoRule,
            (None, Some(_)) => AccessCheck::Denied,
            (Some(_), None) => AccessCheck::Allowed,
            (Some(allow), Some(deny)) => {
                if allow.specificity() > deny.specificity() {
                    AccessCheck::Allowed
                } else {
                    AccessCheck::Denied
                }
            }
        };
        debug!(%database, %table, ?access, "checked table access");

        if access != AccessCheck::Allowed {
            return TableAccess::without_rules(access);
        }

        let rls_predicates = allowed
            .iter()
            .filter_map(|entry| entry.rls.as_ref())
            .map(|rls| RlsPredicate {
                predicate: rls.predicate.clone(),
                group_key: rls.group_key.clone(),
            })
            .collect();

        let mut cls_rules: BTreeMap<String, ClsAction> = BTreeMap::new();
        for entry in &allowed {
            for (column, action) in &entry.cls {
                let strictest = cls_rules.get(column).map_or(*action, |existing| (*existing).max(*action));
                cls_rules.insert(column.clone(), strictest);
            }
        }

        TableAccess {
            access,
            rls_predicates,
            cls_rules,
        }
    }

    /// Combined RLS predicates for a table, empty unless access is allowed.
    pub fn rls_predicates_for_table(&self, database: &str, table: &Table) -> Vec<String> {
        self.check_table_access(database, table).combined_predicates()
    }

    /// Column actions for a table, empty unless access is allowed.
    pub fn cls_rules_for_table(&self, database: &str, table: &Table) -> BTreeMap<String, ClsAction> {
        self.check_table_access(database, table).cls_rules
    }

    pub fn hidden_columns_for_table(&self, database: &str, table: &Table) -> BTreeSet<String> {
        self.cls_rules_for_table(database, table)
            .into_iter()
            .filter(|(_, action)| *action == ClsAction::Hide)
            .map(|(column, _)| column)
            .collect()
    }

    /// Drop hidden columns from column metadata.
    pub fn filter_columns_by_cls<T>(
        &self,
        database: &str,
        table: &Table,
        columns: Vec<T>,
        column_name: impl Fn(&T) -> &str,
    ) -> Vec<T> {
        let hidden = self.hidden_columns_for_table(database, table);
        if hidden.is_empty() {
            return columns;
        }
        columns
            .into_iter()
            .filter(|col| !hidden.contains(column_name(col)))
            .collect()
    }

    /// Table names granted in a database and schema.
    ///
    /// The flag is set when an entry without a table grants the whole schema,
    /// in which case every table is allowed regardless of the returned set.
    pub fn allowed_tables(
        &self,
        database: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
    ) -> (BTreeSet<String>, bool) {
        let mut tables = BTreeSet::new();
        let mut schema_level_access = false;

        for entry in self.allowed().filter(|e| e.database == database) {
            if !optional_matches(entry.catalog.as_deref(), catalog)
                || !optional_matches(entry.schema.as_deref(), schema)
            {
                continue;
            }
            match &entry.table {
                Some(table) => {
                    tables.insert(table.clone());
                }
                None if entry.schema.as_deref() == schema || entry.schema.is_none() => {
                    schema_level_access = true;
                }
                None => (),
            }
        }

        (tables, schema_level_access)
    }

    /// Schema names granted in a database.
    ///
    /// The flag is set when an entry grants the whole database.
    pub fn allowed_schemas(&self, database: &str, catalog: Option<&str>) -> (BTreeSet<String>, bool) {
        let mut schemas = BTreeSet::new();
        let mut all_schemas = false;

        for entry in self.allowed().filter(|e| e.database == database) {
            if !optional_matches(entry.catalog.as_deref(), catalog) {
                continue;
            }
            match &entry.schema {
                Some(schema) => {
                    schemas.insert(schema.clone());
                }
                None => all_schemas = true,
            }
        }

        (schemas, all_schemas)
    }

    pub fn allowed_databases(&self) -> BTreeSet<String> {
        self.allowed().map(|e| e.database.clone()).collect()
    }

    pub fn allowed_entries(&self) -> Vec<AllowedEntry> {
        self.allowed()
            .map(|e| AllowedEntry {
                database: e.database.clone(),
                catalog: e.catalog.clone(),
                schema: e.schema.clone(),
                table: e.table.clone(),
            })
            .collect()
    }

    /// Group keys used by allowed entries, optionally narrowed to a database
    /// and table.
    pub fn all_group_keys(&self, database: Option<&str>, table: Option<&Table>) -> BTreeSet<String> {
        self.allowed()
            .filter(|e| database.is_none_or(|db| e.database == db))
            .filter(|e| {
                table.is_none_or(|t| {
                    t.catalog.as_ref().is_none_or(|c| e.catalog.as_ref() == Some(c))
                        && t.schema.as_ref().is_none_or(|s| e.schema.as_ref() == Some(s))
                        && e.table.as_ref() == Some(&t.table)
                })
            })
            .filter_map(|e| e.rls.as_ref()?.group_key.clone())
            .collect()
    }
}

/// First entry with the highest specificity.
fn most_specific<'a>(entries: &[&'a RuleEntry]) -> Option<&'a RuleEntry> {
    let mut best: Option<&RuleEntry> = None;
    for &entry in entries {
        if best.is_none_or(|b| entry.specificity() > b.specificity()) {
            best = Some(entry);
        }
    }
    best
}

fn optional_matches(entry: Option<&str>, filter: Option<&str>) -> bool {
    match (entry, filter) {
        (Some(entry), Some(filter)) => entry == filter,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Table {
        Table::new("users").with_schema("public")
    }

    fn rules(allowed: Vec<RuleEntry>, denied: Vec<RuleEntry>) -> RuleSet {
        RuleSet::new([AccessRule { allowed, denied }])
    }

    #[test]
    fn access_decisions() {
        logutil::init_test();
        let db = || RuleEntry::new("mydb");
        let test_cases = [
            (vec![], vec![], AccessCheck::NoRule),
            (vec![RuleEntry::new("other")], vec![], AccessCheck::NoRule),
            (vec![db()], vec![], AccessCheck::Allowed),
            (vec![], vec![db()], AccessCheck::Denied),
            // Equal specificity, deny wins.
            (vec![db().with_schema("public")], vec![db().with_schema("public")], AccessCheck::Denied),
            // More specific allow wins.
            (vec![db().with_schema("public").with_table("users")], vec![db().with_schema("public")], AccessCheck::Allowed),
            // More specific deny wins.
            (vec![db()], vec![db().with_table("users")], AccessCheck::Denied),
        ];

        for (allowed, denied, expected) in test_cases {
            let set = rules(allowed.clone(), denied.clone());
            assert_eq!(
                expected,
                set.check_table_access("mydb", &users()).access,
                "allowed: {allowed:?}, denied: {denied:?}"
            );
        }
    }

    #[test]
    fn denied_has_no_rules() {
        logutil::init_test();
        let set = rules(
            vec![RuleEntry::new("mydb").with_rls("a = 1", None).with_cls("ssn", ClsAction::Hide)],
            vec![RuleEntry::new("mydb")],
        );
        let access = set.check_table_access("mydb", &users());
        assert_eq!(AccessCheck::Denied, access.access);
        assert!(access.rls_predicates.is_empty());
        assert!(access.cls_rules.is_empty());
    }

    #[test]
    fn grouped_predicates() {
        let set = rules(
            vec![
                RuleEntry::new("mydb").with_rls("org_id = 1", Some("org")),
                RuleEntry::new("mydb").with_schema("public").with_rls("org_id = 2", Some("org")),
                RuleEntry::new("mydb").with_table("users").with_rls("region = 'US'", None),
            ],
            vec![],
        );
        assert_eq!(
            vec!["((org_id = 1) OR (org_id = 2))".to_string(), "(region = 'US')".to_string()],
            set.rls_predicates_for_table("mydb", &users())
        );
    }

    #[test]
    fn single_member_group() {
        let set = rules(vec![RuleEntry::new("mydb").with_rls("a = 1", Some("g"))], vec![]);
        assert_eq!(vec!["(a = 1)".to_string()], set.rls_predicates_for_table("mydb", &users()));
    }

    #[test]
    fn strictest_cls_action_wins() {
        let set = rules(
            vec![
                RuleEntry::new("mydb").with_cls("ssn", ClsAction::Hash).with_cls("email", ClsAction::Hide),
                RuleEntry::new("mydb")
                    .with_table("users")
                    .with_cls("ssn", ClsAction::Nullify)
                    .with_cls("email", ClsAction::Mask),
            ],
            vec![],
        );
        let cls = set.cls_rules_for_table("mydb", &users());
        assert_eq!(Some(&ClsAction::Nullify), cls.get("ssn"));
        assert_eq!(Some(&ClsAction::Hide), cls.get("email"));
        assert_eq!(2, cls.len());

        let hidden: Vec<_> = set.hidden_columns_for_table("mydb", &users()).into_iter().collect();
        assert_eq!(vec!["email".to_string()], hidden);

        let columns = vec!["id", "email", "ssn"];
        assert_eq!(
            vec!["id", "ssn"],
            set.filter_columns_by_cls("mydb", &users(), columns, |c| *c)
        );
    }

    #[test]
    fn listings() {
        let set = rules(
            vec![
                RuleEntry::new("mydb").with_schema("public").with_table("users"),
                RuleEntry::new("mydb").with_schema("public").with_table("orders"),
                RuleEntry::new("mydb").with_schema("sales"),
                RuleEntry::new("other").with_rls("x = 1", Some("tenant")),
            ],
            vec![],
        );

        let (tables, schema_level) = set.allowed_tables("mydb", None, Some("public"));
        assert_eq!(vec!["orders", "users"], tables.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(!schema_level);

        let (tables, schema_level) = set.allowed_tables("mydb", None, Some("sales"));
        assert!(tables.is_empty());
        assert!(schema_level);

        let (schemas, all) = set.allowed_schemas("mydb", None);
        assert_eq!(vec!["public", "sales"], schemas.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(!all);
        assert!(set.allowed_schemas("other", None).1);

        assert_eq!(
            vec!["mydb", "other"],
            set.allowed_databases().iter().map(String::as_str).collect::<Vec<_>>()
        );
        assert_eq!(4, set.allowed_entries().len());

        assert_eq!(
            vec!["tenant".to_string()],
            set.all_group_keys(None, None).into_iter().collect::<Vec<_>>()
        );
        assert!(set.all_group_keys(Some("mydb"), None).is_empty());
    }
}
