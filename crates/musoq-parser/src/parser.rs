// Recursive descent parser for queries.
//
// Consumes the token stream produced by the lexer and builds the AST.
// Expressions are delegated to the Pratt parser in expr.rs. The first error
// fails the whole parse; there is no recovery.

use std::error::Error;
use std::fmt;

use musoq_ast::{
    CompoundOp, Cte, FromClause, FromSource, JoinClause, JoinKind, OrderingTerm, ResultColumn,
    SelectBody, SelectCore, SelectStatement, SortDirection, Span, WithClause,
};
use musoq_error::MusoqError;

use crate::lexer::{LexError, Lexer};
use crate::token::{Token, TokenKind};

/// A parse error naming the expected construct and the token actually found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub expected: String,
    pub found: String,
    pub span: Span,
    pub line: u32,
    pub col: u32,
}

impl ParseError {
    #[must_use]
    pub fn at(expected: impl Into<String>, token: Option<&Token>) -> Self {
        let (found, span, line, col) = token.map_or_else(
            || ("end of input".to_owned(), Span::ZERO, 0, 0),
            |t| (t.kind.describe(), t.span, t.line, t.col),
        );
        Self {
            expected: expected.into(),
            found,
            span,
            line,
            col,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: expected {}, found {}",
            self.line, self.col, self.expected, self.found
        )
    }
}

impl Error for ParseError {}

impl From<ParseError> for MusoqError {
    fn from(e: ParseError) -> Self {
        Self::Parse {
            expected: e.expected,
            found: e.found,
            offset: e.span.start as usize,
            line: e.line,
            col: e.col,
        }
    }
}

/// Parser over a pre-lexed token stream.
pub struct Parser {
    pub(crate) tokens: Vec<Token>,
    pub(crate) pos: usize,
}

impl Parser {
    /// Create a parser from a token vector. The vector must end with `Eof`.
    #[must_use]
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    /// Lex and wrap query text.
    pub fn from_query(text: &str) -> Result<Self, LexError> {
        Ok(Self::new(Lexer::tokenize(text)?))
    }

    /// Parse the entire input into a single root statement.
    ///
    /// A trailing `;` is accepted. Anything else after the statement is an
    /// error.
    pub fn compose_all(&mut self) -> Result<SelectStatement, ParseError> {
        let stmt = self.parse_statement()?;
        self.eat(&TokenKind::Semicolon);
        if !self.check(&TokenKind::Eof) {
            return Err(self.err_expected("end of query"));
        }
        Ok(stmt)
    }

    // -----------------------------------------------------------------------
    // Token navigation
    // -----------------------------------------------------------------------

    pub(crate) fn current(&self) -> &Token {
        let idx = self.pos.min(self.tokens.len().saturating_sub(1));
        &self.tokens[idx]
    }

    pub(crate) fn peek(&self) -> &TokenKind {
        self.tokens.get(self.pos).map_or(&TokenKind::Eof, |t| &t.kind)
    }

    pub(crate) fn peek_nth(&self, n: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + n)
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    pub(crate) fn advance(&mut self) -> Token {
        let tok = self.current().clone();
        if tok.kind != TokenKind::Eof {
            self.pos += 1;
        }
        tok
    }

    pub(crate) fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(kind)
    }

    pub(crate) fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_token(&mut self, kind: &TokenKind) -> Result<Span, ParseError> {
        if self.check(kind) {
            Ok(self.advance().span)
        } else {
            Err(self.err_expected(kind.describe()))
        }
    }

    pub(crate) fn err_expected(&self, what: impl Into<String>) -> ParseError {
        ParseError::at(what, self.tokens.get(self.pos))
    }

    pub(crate) fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(Span::ZERO, |t| t.span)
    }

    /// Parse an identifier, plain or bracketed.
    pub(crate) fn parse_identifier(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            TokenKind::Id(s) | TokenKind::QuotedId(s) => {
                let name = s.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.err_expected("identifier")),
        }
    }

    pub(crate) fn parse_comma_sep<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, ParseError>,
    ) -> Result<Vec<T>, ParseError> {
        let mut items = vec![item(self)?];
        while self.eat(&TokenKind::Comma) {
            items.push(item(self)?);
        }
        Ok(items)
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    pub(crate) fn parse_statement(&mut self) -> Result<SelectStatement, ParseError> {
        let start = self.current().span;
        let with = if self.eat(&TokenKind::KwWith) {
            Some(WithClause {
                ctes: self.parse_comma_sep(Self::parse_cte)?,
            })
        } else {
            None
        };

        let body = self.parse_select_body()?;

        let mut order_by = Vec::new();
        if self.eat(&TokenKind::KwOrder) {
            self.expect_token(&TokenKind::KwBy)?;
            order_by = self.parse_comma_sep(Self::parse_ordering_term)?;
        }
        let skip = if self.eat(&TokenKind::KwSkip) {
            Some(self.parse_count("row count after SKIP")?)
        } else {
            None
        };
        let take = if self.eat(&TokenKind::KwTake) {
            Some(self.parse_count("row count after TAKE")?)
        } else {
            None
        };

        Ok(SelectStatement {
            with,
            body,
            order_by,
            skip,
            take,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_cte(&mut self) -> Result<Cte, ParseError> {
        let start = self.current().span;
        let name = self.parse_identifier()?;
        self.expect_token(&TokenKind::KwAs)?;
        self.expect_token(&TokenKind::LeftParen)?;
        let query = self.parse_statement()?;
        self.expect_token(&TokenKind::RightParen)?;
        Ok(Cte {
            name,
            query: Box::new(query),
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_select_body(&mut self) -> Result<SelectBody, ParseError> {
        let select = self.parse_select_core()?;
        let mut compounds = Vec::new();
        loop {
            let op = match self.peek() {
                TokenKind::KwUnion => {
                    self.advance();
                    if self.eat(&TokenKind::KwAll) {
                        CompoundOp::UnionAll
                    } else {
                        CompoundOp::Union
                    }
                }
                TokenKind::KwIntersect => {
                    self.advance();
                    CompoundOp::Intersect
                }
                TokenKind::KwExcept => {
                    self.advance();
                    CompoundOp::Except
                }
                _ => break,
            };
            compounds.push((op, self.parse_select_core()?));
        }
        Ok(SelectBody { select, compounds })
    }

    fn parse_select_core(&mut self) -> Result<SelectCore, ParseError> {
        let start = self.expect_token(&TokenKind::KwSelect)?;
        let distinct = self.eat(&TokenKind::KwDistinct);
        let columns = self.parse_comma_sep(Self::parse_result_column)?;

        let from = if self.eat(&TokenKind::KwFrom) {
            Some(self.parse_from_clause()?)
        } else {
            None
        };
        let where_clause = if self.eat(&TokenKind::KwWhere) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        let mut group_by = Vec::new();
        if self.eat(&TokenKind::KwGroup) {
            self.expect_token(&TokenKind::KwBy)?;
            group_by = self.parse_comma_sep(Self::parse_expr)?;
        }
        let having = if self.eat(&TokenKind::KwHaving) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };

        Ok(SelectCore {
            distinct,
            columns,
            from,
            where_clause,
            group_by,
            having,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_result_column(&mut self) -> Result<ResultColumn, ParseError> {
        if self.eat(&TokenKind::Star) {
            return Ok(ResultColumn::Star);
        }
        // alias.*
        if matches!(self.peek(), TokenKind::Id(_) | TokenKind::QuotedId(_))
            && self.peek_nth(1) == &TokenKind::Dot
            && self.peek_nth(2) == &TokenKind::Star
        {
            let alias = self.parse_identifier()?;
            self.advance();
            self.advance();
            return Ok(ResultColumn::TableStar(alias));
        }
        let expr = self.parse_expr()?;
        let alias = self.parse_optional_alias()?;
        Ok(ResultColumn::Expr { expr, alias })
    }

    /// `[AS] name`. Without `AS` only an identifier that cannot start a
    /// clause is taken as an alias.
    fn parse_optional_alias(&mut self) -> Result<Option<String>, ParseError> {
        if self.eat(&TokenKind::KwAs) {
            return self.parse_identifier().map(Some);
        }
        if matches!(self.peek(), TokenKind::Id(_) | TokenKind::QuotedId(_)) {
            return self.parse_identifier().map(Some);
        }
        Ok(None)
    }

    fn parse_from_clause(&mut self) -> Result<FromClause, ParseError> {
        let source = self.parse_from_source()?;
        let mut joins = Vec::new();
        while let Some(kind) = self.parse_join_kind()? {
            let source = self.parse_from_source()?;
            let on = if kind.is_apply() {
                None
            } else {
                self.expect_token(&TokenKind::KwOn)?;
                Some(self.parse_expr()?)
            };
            joins.push(JoinClause { kind, source, on });
        }
        Ok(FromClause { source, joins })
    }

    fn parse_join_kind(&mut self) -> Result<Option<JoinKind>, ParseError> {
        let kind = match (self.peek(), self.peek_nth(1)) {
            (TokenKind::KwInner, _) => {
                self.advance();
                self.expect_token(&TokenKind::KwJoin)?;
                JoinKind::Inner
            }
            (TokenKind::KwJoin, _) => {
                self.advance();
                JoinKind::Inner
            }
            (TokenKind::KwLeft | TokenKind::KwRight, _) => {
                let left = self.advance().kind == TokenKind::KwLeft;
                self.eat(&TokenKind::KwOuter);
                self.expect_token(&TokenKind::KwJoin)?;
                if left {
                    JoinKind::LeftOuter
                } else {
                    JoinKind::RightOuter
                }
            }
            (TokenKind::KwCross, _) => {
                self.advance();
                self.expect_token(&TokenKind::KwApply)?;
                JoinKind::CrossApply
            }
            (TokenKind::KwOuter, TokenKind::KwApply) => {
                self.advance();
                self.advance();
                JoinKind::OuterApply
            }
            _ => return Ok(None),
        };
        Ok(Some(kind))
    }

    fn parse_from_source(&mut self) -> Result<FromSource, ParseError> {
        let start = self.current().span;
        match self.peek() {
            TokenKind::Hash => {
                self.advance();
                let schema = self.parse_identifier()?;
                self.expect_token(&TokenKind::Dot)?;
                let method = self.parse_identifier()?;
                self.expect_token(&TokenKind::LeftParen)?;
                let args = if self.check(&TokenKind::RightParen) {
                    Vec::new()
                } else {
                    self.parse_comma_sep(Self::parse_expr)?
                };
                self.expect_token(&TokenKind::RightParen)?;
                let alias = self.parse_optional_alias()?;
                Ok(FromSource::SchemaMethod {
                    schema,
                    method,
                    args,
                    alias,
                    span: start.merge(self.prev_span()),
                })
            }
            TokenKind::LeftParen => {
                self.advance();
                let query = self.parse_statement()?;
                self.expect_token(&TokenKind::RightParen)?;
                let alias = self.parse_optional_alias()?;
                Ok(FromSource::Subquery {
                    query: Box::new(query),
                    alias,
                    span: start.merge(self.prev_span()),
                })
            }
            TokenKind::Id(_) | TokenKind::QuotedId(_) => {
                let name = self.parse_identifier()?;
                let alias = self.parse_optional_alias()?;
                Ok(FromSource::Reference {
                    name,
                    alias,
                    span: start.merge(self.prev_span()),
                })
            }
            _ => Err(self.err_expected("data source ('#schema.method(...)', CTE name or subquery)")),
        }
    }

    fn parse_ordering_term(&mut self) -> Result<OrderingTerm, ParseError> {
        let expr = self.parse_expr()?;
        let direction = if self.eat(&TokenKind::KwDesc) {
            SortDirection::Desc
        } else {
            self.eat(&TokenKind::KwAsc);
            SortDirection::Asc
        };
        Ok(OrderingTerm { expr, direction })
    }

    fn parse_count(&mut self, what: &str) -> Result<u64, ParseError> {
        let value = match self.peek() {
            TokenKind::Int(n) => u64::try_from(*n).ok(),
            TokenKind::Long(n) => u64::try_from(*n).ok(),
            _ => None,
        };
        match value {
            Some(n) => {
                self.advance();
                Ok(n)
            }
            None => Err(self.err_expected(what)),
        }
    }
}

#[cfg(test)]
mod tests {
    use musoq_ast::{Expr, Literal};

    use super::*;

    fn parse_ok(text: &str) -> SelectStatement {
        Parser::from_query(text)
            .unwrap()
            .compose_all()
            .unwrap_or_else(|e| panic!("failed to parse {text:?}: {e}"))
    }

    fn parse_err(text: &str) -> ParseError {
        Parser::from_query(text)
            .unwrap()
            .compose_all()
            .expect_err("expected a parse error")
    }

    fn assert_round_trip(text: &str) {
        let first = parse_ok(text);
        let printed = first.to_string();
        let second = parse_ok(&printed);
        assert_eq!(printed, second.to_string(), "unstable print for {text:?}");
    }

    #[test]
    fn test_simple_select() {
        let stmt = parse_ok("select Name from #test.entities()");
        let core = &stmt.body.select;
        assert_eq!(core.columns.len(), 1);
        let Some(FromClause {
            source: FromSource::SchemaMethod { schema, method, args, alias, .. },
            joins,
        }) = &core.from
        else {
            unreachable!("expected schema method source")
        };
        assert_eq!(schema, "test");
        assert_eq!(method, "entities");
        assert!(args.is_empty());
        assert!(alias.is_none());
        assert!(joins.is_empty());
    }

    #[test]
    fn test_select_without_from() {
        let stmt = parse_ok("select 1 + 2 as Three");
        assert!(stmt.body.select.from.is_none());
        let ResultColumn::Expr { alias, .. } = &stmt.body.select.columns[0] else {
            unreachable!("expected expression column")
        };
        assert_eq!(alias.as_deref(), Some("Three"));
    }

    #[test]
    fn test_star_and_table_star() {
        let stmt = parse_ok("select *, a.* from #s.m() a");
        assert_eq!(stmt.body.select.columns[0], ResultColumn::Star);
        assert_eq!(
            stmt.body.select.columns[1],
            ResultColumn::TableStar("a".to_owned())
        );
    }

    #[test]
    fn test_alias_without_as() {
        let stmt = parse_ok("select Name n from #s.m() t where n = 'x'");
        let ResultColumn::Expr { alias, .. } = &stmt.body.select.columns[0] else {
            unreachable!("expected expression column")
        };
        assert_eq!(alias.as_deref(), Some("n"));
        assert_eq!(
            stmt.body.select.from.as_ref().and_then(|f| f.source.alias()),
            Some("t")
        );
    }

    #[test]
    fn test_schema_method_arguments() {
        let stmt = parse_ok("select 1 from #csv.file('a.csv', true, 10) f");
        let Some(FromClause {
            source: FromSource::SchemaMethod { args, .. },
            ..
        }) = &stmt.body.select.from
        else {
            unreachable!("expected schema method source")
        };
        assert_eq!(args.len(), 3);
        assert!(matches!(args[1], Expr::Literal(Literal::Bool(true), _)));
    }

    #[test]
    fn test_joins_and_applies() {
        let stmt = parse_ok(
            "select a.Name from #s.a() a \
             inner join #s.b() b on a.Id = b.Id \
             left outer join #s.c() c on a.Id = c.Id \
             right join #s.d() d on a.Id = d.Id \
             cross apply #s.e(a.Id) e \
             outer apply #s.f(a.Id) f",
        );
        let from = stmt.body.select.from.unwrap();
        let kinds: Vec<_> = from.joins.iter().map(|j| j.kind).collect();
        assert_eq!(
            kinds,
            vec![
                JoinKind::Inner,
                JoinKind::LeftOuter,
                JoinKind::RightOuter,
                JoinKind::CrossApply,
                JoinKind::OuterApply,
            ]
        );
        assert!(from.joins[0].on.is_some());
        assert!(from.joins[3].on.is_none());
    }

    #[test]
    fn test_join_requires_on() {
        let err = parse_err("select 1 from #s.a() a inner join #s.b() b where 1 = 1");
        assert_eq!(err.expected, "ON");
        assert_eq!(err.found, "WHERE");
    }

    #[test]
    fn test_where_group_having() {
        let stmt = parse_ok(
            "select Country, Count(Country) from #s.people() \
             where Age > 18 group by Country having Count(Country) > 1",
        );
        let core = &stmt.body.select;
        assert!(core.where_clause.is_some());
        assert_eq!(core.group_by.len(), 1);
        assert!(core.having.is_some());
    }

    #[test]
    fn test_order_skip_take() {
        let stmt = parse_ok("select Name from #s.m() order by Name desc, Id skip 2 take 10");
        assert_eq!(stmt.order_by.len(), 2);
        assert_eq!(stmt.order_by[0].direction, SortDirection::Desc);
        assert_eq!(stmt.order_by[1].direction, SortDirection::Asc);
        assert_eq!(stmt.skip, Some(2));
        assert_eq!(stmt.take, Some(10));
    }

    #[test]
    fn test_take_requires_count() {
        let err = parse_err("select 1 take x");
        assert_eq!(err.expected, "row count after TAKE");
        assert_eq!(err.found, "x");
        assert!(parse_err("select 1 skip -1").expected.contains("SKIP"));
    }

    #[test]
    fn test_set_operations_chain() {
        let stmt = parse_ok(
            "select Name from #s.a() union all select Name from #s.b() \
             except select Name from #s.c() intersect select Name from #s.d() \
             union select Name from #s.e()",
        );
        let ops: Vec<_> = stmt.body.compounds.iter().map(|(op, _)| *op).collect();
        assert_eq!(
            ops,
            vec![
                CompoundOp::UnionAll,
                CompoundOp::Except,
                CompoundOp::Intersect,
                CompoundOp::Union,
            ]
        );
    }

    #[test]
    fn test_with_ctes() {
        let stmt = parse_ok(
            "with p as (select Name from #s.a()), q as (select Name from p) \
             select Name from q",
        );
        let with = stmt.with.unwrap();
        assert_eq!(with.ctes.len(), 2);
        assert_eq!(with.ctes[1].name, "q");
        assert!(matches!(
            stmt.body.select.from.unwrap().source,
            FromSource::Reference { ref name, .. } if name == "q"
        ));
    }

    #[test]
    fn test_subquery_source() {
        let stmt = parse_ok("select x.Name from (select Name from #s.a() take 1) x");
        let Some(FromClause {
            source: FromSource::Subquery { query, alias, .. },
            ..
        }) = &stmt.body.select.from
        else {
            unreachable!("expected subquery source")
        };
        assert_eq!(alias.as_deref(), Some("x"));
        assert_eq!(query.take, Some(1));
    }

    #[test]
    fn test_trailing_semicolon_and_garbage() {
        parse_ok("select 1;");
        let err = parse_err("select 1 select 2");
        assert_eq!(err.expected, "end of query");
        assert_eq!(err.found, "SELECT");
    }

    #[test]
    fn test_missing_select() {
        let err = parse_err("from #s.a()");
        assert_eq!(err.expected, "SELECT");
        assert_eq!((err.line, err.col), (1, 1));
    }

    #[test]
    fn test_parse_error_converts_to_musoq_error() {
        let err: MusoqError = parse_err("select 1 from").into();
        assert!(matches!(err, MusoqError::Parse { .. }));
    }

    #[test]
    fn test_statement_round_trip() {
        for text in [
            "select Name, Age * 2 as Double from #test.entities() e where e.Age >= 18",
            "select distinct Country from #s.people() p order by Country desc skip 1 take 2",
            "with c as (select Name from #s.a()) select Name from c union all select Name from #s.b()",
            "select a.Name, b.Value from #s.a() a left outer join #s.b() b on a.Id = b.Id",
            "select [Has Space], [select] from #s.odd() x cross apply #s.items(x.Id) i",
            "select case when Age > 10 then 'old' else 'young' end from #s.m() where Name like 'a%'",
            "select Count(Name) from #s.m() group by Country having Count(Name) > 1",
            "select 1 from (select Name from #s.m()) t where t.Name in ('a', 'b') and t.Name is not null",
        ] {
            assert_round_trip(text);
        }
    }
}
