use std::cmp::Ordering;
use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sqlparser::ast::ObjectName;

/// A possibly qualified table reference, `[[catalog.]schema.]table`.
///
/// Equality, ordering and hashing all go through the escaped string form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub table: String,
    pub schema: Option<String>,
    pub catalog: Option<String>,
}

impl Table {
    pub fn new(table: impl Into<String>) -> Self {
        Table {
            table: table.into(),
            schema: None,
            catalog: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    /// Build a table from name parts, the last part being the table name.
    ///
    /// Names with more than three parts keep the last three. Returns `None`
    /// when there's no non-empty table part.
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> Option<Self> {
        let parts: Vec<&str> = parts.iter().map(|p| p.as_ref()).collect();
        let (table, rest) = parts.split_last()?;
        if table.is_empty() {
            return None;
        }

        let mut out = Table::new(*table);
        let mut rest = rest.iter().rev();
        out.schema = rest.next().map(|s| s.to_string());
        out.catalog = rest.next().map(|s| s.to_string());
        Some(out)
    }

    /// Build a table from a parsed name. Unquoted parts fold to lower case,
    /// quoted parts are kept as written.
    pub fn from_object_name(name: &ObjectName) -> Option<Self> {
        let parts: Vec<String> = name
            .0
            .iter()
            .map(|ident| match ident.quote_style {
                Some(_) => ident.value.clone(),
                None => ident.value.to_lowercase(),
            })
            .collect();
        Self::from_parts(&parts)
    }

    /// Fill in missing catalog and schema.
    pub fn qualify(&self, catalog: Option<&str>, schema: Option<&str>) -> Table {
        Table {
            table: self.table.clone(),
            schema: self.schema.clone().or_else(|| schema.map(|s| s.to_string())),
            catalog: self.catalog.clone().or_else(|| catalog.map(|s| s.to_string())),
        }
    }

    pub fn parts(&self) -> impl Iterator<Item = &str> {
        [self.catalog.as_deref(), self.schema.as_deref(), Some(self.table.as_str())]
            .into_iter()
            .flatten()
    }
}

/// Percent-encode everything except ASCII alphanumerics and `_-~`, so a dot
/// inside a name can't be confused with the separator.
fn escape_part(part: &str, out: &mut String) {
    for byte in part.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'~') {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = String::new();
        for (idx, part) in self.parts().enumerate() {
            if idx > 0 {
                buf.push('.');
            }
            escape_part(part, &mut buf);
        }
        f.write_str(&buf)
    }
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for Table {}

impl Hash for Table {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_string().hash(state)
    }
}

impl PartialOrd for Table {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Table {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_escapes_parts() {
        let test_cases = [
            (Table::new("users"), "users"),
            (Table::new("users").with_schema("public"), "public.users"),
            (
                Table::new("users").with_schema("public").with_catalog("db"),
                "db.public.users",
            ),
            (Table::new("a.b").with_schema("my schema"), "my%20schema.a%2Eb"),
            (Table::new("100%"), "100%25"),
        ];

        for (table, expected) in test_cases {
            assert_eq!(expected, table.to_string());
        }
    }

    #[test]
    fn dotted_name_differs_from_qualified() {
        let dotted = Table::new("public.users");
        let qualified = Table::new("users").with_schema("public");
        assert_ne!(dotted, qualified);
    }

    #[test]
    fn from_parts() {
        assert_eq!(None, Table::from_parts::<&str>(&[]));
        assert_eq!(None, Table::from_parts(&["public", ""]));
        assert_eq!(
            Some(Table::new("t").with_schema("s").with_catalog("c")),
            Table::from_parts(&["server", "c", "s", "t"])
        );
    }

    #[test]
    fn object_names_fold_unquoted_parts() {
        use sqlparser::ast::Ident;

        let test_cases = [
            (vec![Ident::new("USERS")], Table::new("users")),
            (
                vec![Ident::new("Public"), Ident::new("Users")],
                Table::new("users").with_schema("public"),
            ),
            (vec![Ident::with_quote('"', "Users")], Table::new("Users")),
            (
                vec![Ident::new("MyDb"), Ident::with_quote('`', "App"), Ident::new("T")],
                Table::new("t").with_schema("App").with_catalog("mydb"),
            ),
        ];

        for (idents, expected) in test_cases {
            let name = ObjectName(idents);
            assert_eq!(Some(expected), Table::from_object_name(&name), "name: {name}");
        }
    }

    #[test]
    fn qualify_fills_missing() {
        let table = Table::new("users").with_schema("app");
        let qualified = table.qualify(Some("main"), Some("public"));
        assert_eq!(Table::new("users").with_schema("app").with_catalog("main"), qualified);
    }
}
