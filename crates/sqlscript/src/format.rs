//! Line-breaking pretty printer for rendered SQL.

/// Clause keywords that start a new line when found at the top level.
///
/// Longer phrases come first so `LEFT JOIN` wins over `JOIN`.
const CLAUSES: &[&str] = &[
    "FULL OUTER JOIN",
    "LEFT OUTER JOIN",
    "RIGHT OUTER JOIN",
    "NATURAL JOIN",
    "CROSS JOIN",
    "INNER JOIN",
    "FULL JOIN",
    "LEFT JOIN",
    "RIGHT JOIN",
    "JOIN",
    "GROUP BY",
    "ORDER BY",
    "UNION",
    "EXCEPT",
    "INTERSECT",
    "FROM",
    "WHERE",
    "HAVING",
    "QUALIFY",
    "WINDOW",
    "LIMIT",
    "OFFSET",
];

/// Words that can come right before `JOIN` as part of the same join phrase.
const JOIN_MODIFIERS: &[&str] = &[
    "LEFT", "RIGHT", "FULL", "INNER", "CROSS", "NATURAL", "OUTER", "SEMI", "ANTI",
];

/// Break the top-level clauses of a rendered statement onto their own lines.
///
/// Only a single space preceding a clause keyword is replaced, which keeps the
/// function idempotent. Text inside quotes, dollar-quoted strings and
/// parentheses is left alone.
pub(crate) fn pretty(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + 16);
    let mut depth: i32 = 0;
    let mut quote: Option<u8> = None;
    let mut dollar = false;
    let mut prev_word = String::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if dollar {
            if sql[i..].starts_with("$$") {
                dollar = false;
                out.push_str("$$");
                i += 2;
            } else {
                push_char(sql, &mut i, &mut out);
            }
            continue;
        }

        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            push_char(sql, &mut i, &mut out);
            continue;
        }

        match b {
            b'\'' | b'"' | b'`' => {
                quote = Some(b);
                out.push(b as char);
                i += 1;
            }
            b'$' if sql[i..].starts_with("$$") => {
                dollar = true;
                out.push_str("$$");
                i += 2;
            }
            b'(' | b'[' => {
                depth += 1;
                out.push(b as char);
                i += 1;
            }
            b')' | b']' => {
                depth -= 1;
                out.push(b as char);
                i += 1;
            }
            b' ' if depth == 0 => {
                let rest = &sql[i + 1..];
                match clause_at(rest) {
                    Some(clause) if !continues_phrase(clause, &prev_word) => {
                        out.push('\n');
                    }
                    _ => out.push(' '),
                }
                i += 1;
            }
            _ => {
                if b.is_ascii_alphanumeric() || b == b'_' {
                    let start = i;
                    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                        i += 1;
                    }
                    prev_word = sql[start..i].to_string();
                    out.push_str(&sql[start..i]);
                } else {
                    push_char(sql, &mut i, &mut out);
                }
            }
        }
    }

    out
}

/// Whether `clause` is the tail of a phrase started by `prev_word`, as in
/// `IS DISTINCT FROM` or `LEFT OUTER JOIN`.
fn continues_phrase(clause: &str, prev_word: &str) -> bool {
    match clause {
        "FROM" => prev_word == "DISTINCT",
        "JOIN" => JOIN_MODIFIERS.contains(&prev_word),
        _ => false,
    }
}

fn push_char(sql: &str, i: &mut usize, out: &mut String) {
    if let Some(c) = sql[*i..].chars().next() {
        out.push(c);
        *i += c.len_utf8();
    } else {
        *i += 1;
    }
}

/// Match a whole-word clause keyword at the start of `rest`.
fn clause_at(rest: &str) -> Option<&'static str> {
    CLAUSES.iter().copied().find(|clause| {
        rest.starts_with(clause)
            && rest[clause.len()..]
                .chars()
                .next()
                .is_none_or(|c| !(c.is_ascii_alphanumeric() || c == '_'))
    })
}
