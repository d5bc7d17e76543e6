//! Splitting SQL scripts into parsed statements.
use sqlparser::ast;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Location, Token, TokenWithSpan, Tokenizer, Whitespace};
use tracing::debug;

use crate::dialect::SqlBackend;
use crate::errors::ParseError;

/// One statement cut out of a script.
#[derive(Debug, Clone)]
pub(crate) struct SplitStatement {
    pub ast: ast::Statement,
    /// Source text of the statement, without the trailing semicolon.
    pub sql: String,
    /// Comments found before or inside the statement.
    pub comments: Vec<String>,
}

/// Tokens between two top-level semicolons.
#[derive(Debug, Default)]
struct Chunk {
    tokens: Vec<TokenWithSpan>,
    comments: Vec<String>,
    code_start: Option<Location>,
    code_end: Option<Location>,
}

impl Chunk {
    fn has_code(&self) -> bool {
        self.code_start.is_some()
    }

    fn push(&mut self, tok: TokenWithSpan) {
        match &tok.token {
            Token::Whitespace(Whitespace::SingleLineComment { comment, prefix }) => {
                self.comments.push(format!("{prefix}{}", comment.trim_end()));
            }
            Token::Whitespace(Whitespace::MultiLineComment(comment)) => {
                self.comments.push(format!("/*{comment}*/"));
            }
            Token::Whitespace(_) | Token::EOF => (),
            _ => {
                if self.code_start.is_none() {
                    self.code_start = Some(tok.span.start);
                }
                self.code_end = Some(tok.span.end);
            }
        }
        self.tokens.push(tok);
    }
}

/// Split the script into statements.
///
/// The whole token stream is handed to the parser first. If that fails, each
/// chunk between top-level semicolons is parsed on its own so one statement
/// the parser chokes on as part of a larger script can still be recovered.
pub(crate) fn split_sql(
    script: &str,
    backend: SqlBackend,
    dialect_name: &str,
) -> Result<Vec<SplitStatement>, ParseError> {
    let parser_dialect = backend.parser_dialect();
    let tokens = Tokenizer::new(parser_dialect.as_ref(), script)
        .tokenize_with_location()
        .map_err(|e| ParseError::from_tokenizer(e, script, dialect_name))?;

    let chunks = chunk_tokens(tokens.clone());
    let code_chunks: Vec<&Chunk> = chunks.iter().filter(|c| c.has_code()).collect();
    if code_chunks.is_empty() {
        return Ok(Vec::new());
    }

    let index = LineIndex::new(script);

    match Parser::new(parser_dialect.as_ref())
        .with_tokens_with_locations(tokens)
        .parse_statements()
    {
        Ok(statements) if statements.len() == code_chunks.len() => {
            Ok(attach_sources(statements, &chunks, script, &index))
        }
        Ok(statements) => {
            // Block statements may contain semicolons of their own, so chunks
            // don't line up with statements. Keep the parser's view.
            debug!(
                statements = statements.len(),
                chunks = code_chunks.len(),
                "statement count differs from semicolon chunks"
            );
            let comments: Vec<String> = chunks.iter().flat_map(|c| c.comments.clone()).collect();
            let mut out: Vec<SplitStatement> = statements
                .into_iter()
                .map(|ast| SplitStatement {
                    sql: ast.to_string(),
                    ast,
                    comments: Vec::new(),
                })
                .collect();
            if let Some(first) = out.first_mut() {
                first.comments = comments;
            }
            Ok(out)
        }
        Err(err) => {
            debug!(%err, "script failed to parse as a whole, parsing chunks individually");
            let mut statements = Vec::with_capacity(code_chunks.len());
            for chunk in &code_chunks {
                let mut parsed = Parser::new(parser_dialect.as_ref())
                    .with_tokens_with_locations(chunk.tokens.clone())
                    .parse_statements()
                    .map_err(|e| ParseError::from_parser(e, script, dialect_name))?;
                if parsed.len() != 1 {
                    return Err(ParseError::new(
                        format!("expected one statement, found {}", parsed.len()),
                        script,
                        dialect_name,
                    ));
                }
                statements.push(parsed.remove(0));
            }
            Ok(attach_sources(statements, &chunks, script, &index))
        }
    }
}

fn chunk_tokens(tokens: Vec<TokenWithSpan>) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current = Chunk::default();
    for tok in tokens {
        if tok.token == Token::SemiColon {
            chunks.push(std::mem::take(&mut current));
        } else {
            current.push(tok);
        }
    }
    chunks.push(current);
    chunks
}

/// Pair statements with their chunks' source text and comments.
///
/// Comments in chunks without code are carried to the next statement, or to
/// the last statement when they trail the script.
fn attach_sources(
    statements: Vec<ast::Statement>,
    chunks: &[Chunk],
    script: &str,
    index: &LineIndex,
) -> Vec<SplitStatement> {
    let mut out = Vec::with_capacity(statements.len());
    let mut pending: Vec<String> = Vec::new();
    let mut statements = statements.into_iter();

    for chunk in chunks {
        if !chunk.has_code() {
            pending.extend(chunk.comments.iter().cloned());
            continue;
        }
        let Some(ast) = statements.next() else {
            break;
        };

        let sql = match (chunk.code_start, chunk.code_end) {
            (Some(start), Some(end)) => index.slice(script, start, end).map(|s| s.trim().to_string()),
            _ => None,
        };

        let mut comments = std::mem::take(&mut pending);
        comments.extend(chunk.comments.iter().cloned());

        out.push(SplitStatement {
            sql: sql.unwrap_or_else(|| ast.to_string()),
            ast,
            comments,
        });
    }

    if let Some(last) = out.last_mut() {
        last.comments.append(&mut pending);
    }

    out
}

/// Converts tokenizer locations (1-based line and character column) into byte
/// offsets.
struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    fn new(text: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(text.match_indices('\n').map(|(idx, _)| idx + 1));
        LineIndex { line_starts }
    }

    fn offset(&self, text: &str, loc: Location) -> Option<usize> {
        let line_start = *self.line_starts.get((loc.line as usize).checked_sub(1)?)?;
        let line = &text[line_start..];
        let col = (loc.column as usize).checked_sub(1)?;
        match line.char_indices().nth(col) {
            Some((idx, _)) => Some(line_start + idx),
            None => Some(text.len()),
        }
    }

    fn slice<'a>(&self, text: &'a str, start: Location, end: Location) -> Option<&'a str> {
        let start = self.offset(text, start)?;
        let end = self.offset(text, end)?;
        text.get(start..end)
    }
}
