//! Hand-written lexer and recursive descent parser for Musoq queries, with
//! Pratt precedence-climbing for expressions. Produces an AST from
//! `musoq-ast`.

pub mod expr;
pub mod lexer;
pub mod parser;
pub mod token;

pub use expr::parse_expr;
pub use lexer::{LexError, Lexer};
pub use parser::{ParseError, Parser};
pub use token::{Token, TokenKind};

use musoq_ast::SelectStatement;

/// Lex and parse a complete query.
///
/// Lexing and parsing errors are both reported as [`musoq_error::MusoqError`].
pub fn parse_query(text: &str) -> musoq_error::Result<SelectStatement> {
    let span = tracing::debug_span!(
        target: "musoq.parse",
        "parse_query",
        tokens = tracing::field::Empty,
        set_ops = tracing::field::Empty,
    );
    let _guard = span.enter();

    let tokens = Lexer::tokenize(text)?;
    span.record("tokens", tokens.len());
    let mut parser = Parser::new(tokens);
    let stmt = parser.compose_all().map_err(|e| {
        tracing::debug!(target: "musoq.parse", error = %e, "parse failed");
        e
    })?;
    span.record("set_ops", stmt.body.compounds.len());
    Ok(stmt)
}
