// Pratt expression parser.
//
// Precedence table (lowest to highest, every tier left-associative):
//   OR
//   AND
//   |
//   ^
//   &
//   = <> !=
//   < <= > >= LIKE IN IS [NOT] NULL
//   << >>
//   + -
//   * / %
//   - ~ NOT (unary prefix)

use musoq_ast::{BinaryOp, ColumnRef, Expr, Literal, Span, UnaryOp};

use crate::parser::{ParseError, Parser};
use crate::token::TokenKind;

// Binding powers: higher = tighter binding.
// Left BP is checked against min_bp; right BP is passed to recursive call.
mod bp {
    pub const OR: (u8, u8) = (1, 2);
    pub const AND: (u8, u8) = (3, 4);
    pub const BITOR: (u8, u8) = (5, 6);
    pub const BITXOR: (u8, u8) = (7, 8);
    pub const BITAND: (u8, u8) = (9, 10);
    pub const EQUALITY: (u8, u8) = (11, 12);
    pub const COMPARISON: (u8, u8) = (13, 14);
    pub const SHIFT: (u8, u8) = (15, 16);
    pub const ADD: (u8, u8) = (17, 18);
    pub const MUL: (u8, u8) = (19, 20);
    // Unary prefix (- ~ NOT) right BP:
    pub const UNARY: u8 = 21;
}

/// What an infix-position token turns into.
enum Infix {
    Binary(BinaryOp),
    Like { not: bool },
    In { not: bool },
    IsNull,
}

impl Parser {
    /// Parse a single expression.
    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_expr_bp(0)
    }

    // ── Pratt core ──────────────────────────────────────────────────────

    fn parse_expr_bp(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_prefix()?;

        while let Some((infix, (l_bp, r_bp))) = self.infix_op() {
            if l_bp < min_bp {
                break;
            }
            lhs = self.parse_infix(lhs, infix, r_bp)?;
        }

        Ok(lhs)
    }

    // ── Prefix (nud) ────────────────────────────────────────────────────

    fn parse_prefix(&mut self) -> Result<Expr, ParseError> {
        let tok = self.advance();
        let span = tok.span;
        match tok.kind {
            TokenKind::Int(n) => Ok(Expr::Literal(Literal::Int(n), span)),
            TokenKind::Long(n) => Ok(Expr::Literal(Literal::Long(n), span)),
            TokenKind::Decimal(d) => Ok(Expr::Literal(Literal::Decimal(d), span)),
            TokenKind::Double(v) => Ok(Expr::Literal(Literal::Double(v), span)),
            TokenKind::String(s) => Ok(Expr::Literal(Literal::String(s), span)),
            TokenKind::KwTrue => Ok(Expr::Literal(Literal::Bool(true), span)),
            TokenKind::KwFalse => Ok(Expr::Literal(Literal::Bool(false), span)),
            TokenKind::KwNull => Ok(Expr::Literal(Literal::Null, span)),

            TokenKind::Minus => self.parse_unary(UnaryOp::Negate, span),
            TokenKind::Tilde => self.parse_unary(UnaryOp::BitNot, span),
            TokenKind::KwNot => self.parse_unary(UnaryOp::Not, span),

            TokenKind::KwCase => self.parse_case_expr(span),

            TokenKind::LeftParen => {
                let inner = self.parse_expr()?;
                self.expect_token(&TokenKind::RightParen)?;
                Ok(inner)
            }

            TokenKind::Id(name) | TokenKind::QuotedId(name) => self.parse_ident_expr(name, span),

            other => {
                // Step back so the error points at the offending token.
                self.pos -= usize::from(other != TokenKind::Eof);
                Err(self.err_expected("expression"))
            }
        }
    }

    fn parse_unary(&mut self, op: UnaryOp, start: Span) -> Result<Expr, ParseError> {
        let inner = self.parse_expr_bp(bp::UNARY)?;
        let span = start.merge(inner.span());
        Ok(Expr::UnaryOp {
            op,
            expr: Box::new(inner),
            span,
        })
    }

    /// Parse `name`, `name(args)`, `alias.column` or `alias.method(args)`.
    fn parse_ident_expr(&mut self, name: String, start: Span) -> Result<Expr, ParseError> {
        if self.check(&TokenKind::LeftParen) {
            return self.parse_function_call(None, name, start);
        }
        if self.eat(&TokenKind::Dot) {
            let member = self.parse_identifier()?;
            if self.check(&TokenKind::LeftParen) {
                return self.parse_function_call(Some(name), member, start);
            }
            return Ok(Expr::Column(
                ColumnRef::qualified(name, member),
                start.merge(self.prev_span()),
            ));
        }
        Ok(Expr::Column(ColumnRef::bare(name), start))
    }

    fn parse_function_call(
        &mut self,
        qualifier: Option<String>,
        name: String,
        start: Span,
    ) -> Result<Expr, ParseError> {
        self.expect_token(&TokenKind::LeftParen)?;
        let args = if self.check(&TokenKind::RightParen) {
            Vec::new()
        } else {
            self.parse_comma_sep(Self::parse_expr)?
        };
        let end = self.expect_token(&TokenKind::RightParen)?;
        Ok(Expr::FunctionCall {
            qualifier,
            name,
            args,
            span: start.merge(end),
        })
    }

    fn parse_case_expr(&mut self, start: Span) -> Result<Expr, ParseError> {
        let mut whens = Vec::new();
        while self.eat(&TokenKind::KwWhen) {
            let cond = self.parse_expr()?;
            self.expect_token(&TokenKind::KwThen)?;
            let result = self.parse_expr()?;
            whens.push((cond, result));
        }
        if whens.is_empty() {
            return Err(self.err_expected("WHEN"));
        }
        let else_expr = if self.eat(&TokenKind::KwElse) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        let end = self.expect_token(&TokenKind::KwEnd)?;
        Ok(Expr::Case {
            whens,
            else_expr,
            span: start.merge(end),
        })
    }

    // ── Infix (led) ─────────────────────────────────────────────────────

    fn infix_op(&self) -> Option<(Infix, (u8, u8))> {
        let op = match self.peek() {
            TokenKind::KwOr => (Infix::Binary(BinaryOp::Or), bp::OR),
            TokenKind::KwAnd => (Infix::Binary(BinaryOp::And), bp::AND),
            TokenKind::Pipe => (Infix::Binary(BinaryOp::BitOr), bp::BITOR),
            TokenKind::Caret => (Infix::Binary(BinaryOp::BitXor), bp::BITXOR),
            TokenKind::Ampersand => (Infix::Binary(BinaryOp::BitAnd), bp::BITAND),
            TokenKind::Eq => (Infix::Binary(BinaryOp::Eq), bp::EQUALITY),
            TokenKind::Ne => (Infix::Binary(BinaryOp::Ne), bp::EQUALITY),
            TokenKind::Lt => (Infix::Binary(BinaryOp::Lt), bp::COMPARISON),
            TokenKind::Le => (Infix::Binary(BinaryOp::Le), bp::COMPARISON),
            TokenKind::Gt => (Infix::Binary(BinaryOp::Gt), bp::COMPARISON),
            TokenKind::Ge => (Infix::Binary(BinaryOp::Ge), bp::COMPARISON),
            TokenKind::KwLike => (Infix::Like { not: false }, bp::COMPARISON),
            TokenKind::KwIn => (Infix::In { not: false }, bp::COMPARISON),
            TokenKind::KwIs => (Infix::IsNull, bp::COMPARISON),
            TokenKind::KwNot => match self.peek_nth(1) {
                TokenKind::KwLike => (Infix::Like { not: true }, bp::COMPARISON),
                TokenKind::KwIn => (Infix::In { not: true }, bp::COMPARISON),
                _ => return None,
            },
            TokenKind::ShiftLeft => (Infix::Binary(BinaryOp::ShiftLeft), bp::SHIFT),
            TokenKind::ShiftRight => (Infix::Binary(BinaryOp::ShiftRight), bp::SHIFT),
            TokenKind::Plus => (Infix::Binary(BinaryOp::Add), bp::ADD),
            TokenKind::Minus => (Infix::Binary(BinaryOp::Subtract), bp::ADD),
            TokenKind::Star => (Infix::Binary(BinaryOp::Multiply), bp::MUL),
            TokenKind::Slash => (Infix::Binary(BinaryOp::Divide), bp::MUL),
            TokenKind::Percent => (Infix::Binary(BinaryOp::Modulo), bp::MUL),
            _ => return None,
        };
        Some(op)
    }

    fn parse_infix(&mut self, lhs: Expr, infix: Infix, r_bp: u8) -> Result<Expr, ParseError> {
        self.advance();
        match infix {
            Infix::Binary(op) => {
                let rhs = self.parse_expr_bp(r_bp)?;
                let span = lhs.span().merge(rhs.span());
                Ok(Expr::BinaryOp {
                    left: Box::new(lhs),
                    op,
                    right: Box::new(rhs),
                    span,
                })
            }
            Infix::Like { not } => {
                if not {
                    self.advance(); // LIKE
                }
                let pattern = self.parse_expr_bp(r_bp)?;
                let span = lhs.span().merge(pattern.span());
                Ok(Expr::Like {
                    expr: Box::new(lhs),
                    pattern: Box::new(pattern),
                    not,
                    span,
                })
            }
            Infix::In { not } => {
                if not {
                    self.advance(); // IN
                }
                self.expect_token(&TokenKind::LeftParen)?;
                let list = self.parse_comma_sep(Self::parse_expr)?;
                let end = self.expect_token(&TokenKind::RightParen)?;
                Ok(Expr::In {
                    span: lhs.span().merge(end),
                    expr: Box::new(lhs),
                    list,
                    not,
                })
            }
            Infix::IsNull => {
                let not = self.eat(&TokenKind::KwNot);
                let end = self.expect_token(&TokenKind::KwNull)?;
                Ok(Expr::IsNull {
                    span: lhs.span().merge(end),
                    expr: Box::new(lhs),
                    not,
                })
            }
        }
    }
}

/// Parse a single expression from raw query text.
pub fn parse_expr(text: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser::from_query(text).map_err(|e| ParseError {
        expected: "valid token".to_owned(),
        found: e.message,
        span: e.span,
        line: e.line,
        col: e.col,
    })?;
    let expr = parser.parse_expr()?;
    if !matches!(parser.peek(), TokenKind::Eof | TokenKind::Semicolon) {
        return Err(parser.err_expected("end of expression"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Expr {
        match parse_expr(text) {
            Ok(expr) => expr,
            Err(err) => unreachable!("parse error for `{text}`: {err}"),
        }
    }

    fn binop(expr: &Expr) -> (BinaryOp, &Expr, &Expr) {
        match expr {
            Expr::BinaryOp {
                left, op, right, ..
            } => (*op, left, right),
            other => unreachable!("expected binary op, got {other:?}"),
        }
    }

    fn int(expr: &Expr) -> i32 {
        match expr {
            Expr::Literal(Literal::Int(n), _) => *n,
            other => unreachable!("expected int literal, got {other:?}"),
        }
    }

    #[test]
    fn test_arithmetic_precedence() {
        // 1 + 2 * 3 → 1 + (2 * 3)
        let expr = parse("1 + 2 * 3");
        let (op, l, r) = binop(&expr);
        assert_eq!(op, BinaryOp::Add);
        assert_eq!(int(l), 1);
        assert_eq!(binop(r).0, BinaryOp::Multiply);
    }

    #[test]
    fn test_left_associative() {
        // 10 - 4 - 3 → (10 - 4) - 3
        let expr = parse("10 - 4 - 3");
        let (op, l, r) = binop(&expr);
        assert_eq!(op, BinaryOp::Subtract);
        assert_eq!(binop(l).0, BinaryOp::Subtract);
        assert_eq!(int(r), 3);
    }

    #[test]
    fn test_shift_binds_looser_than_add() {
        // 1 << 2 + 3 → 1 << (2 + 3)
        let expr = parse("1 << 2 + 3");
        let (op, _, r) = binop(&expr);
        assert_eq!(op, BinaryOp::ShiftLeft);
        assert_eq!(binop(r).0, BinaryOp::Add);
    }

    #[test]
    fn test_comparison_tighter_than_equality() {
        // a < b = c > d → (a < b) = (c > d)
        let expr = parse("a < b = c > d");
        let (op, l, r) = binop(&expr);
        assert_eq!(op, BinaryOp::Eq);
        assert_eq!(binop(l).0, BinaryOp::Lt);
        assert_eq!(binop(r).0, BinaryOp::Gt);
    }

    #[test]
    fn test_bitwise_tiers() {
        // 1 | 2 ^ 3 & 4 → 1 | (2 ^ (3 & 4))
        let expr = parse("1 | 2 ^ 3 & 4");
        let (op, _, r) = binop(&expr);
        assert_eq!(op, BinaryOp::BitOr);
        let (op, _, r) = binop(r);
        assert_eq!(op, BinaryOp::BitXor);
        assert_eq!(binop(r).0, BinaryOp::BitAnd);
    }

    #[test]
    fn test_equality_tighter_than_bitand() {
        // a & b = c → a & (b = c)
        let expr = parse("a & b = c");
        let (op, _, r) = binop(&expr);
        assert_eq!(op, BinaryOp::BitAnd);
        assert_eq!(binop(r).0, BinaryOp::Eq);
    }

    #[test]
    fn test_and_higher_than_or() {
        // a OR b AND c → a OR (b AND c)
        let expr = parse("a or b and c");
        let (op, _, r) = binop(&expr);
        assert_eq!(op, BinaryOp::Or);
        assert_eq!(binop(r).0, BinaryOp::And);
    }

    #[test]
    fn test_unary_binds_tightest() {
        // -a * b → (-a) * b
        let expr = parse("-a * b");
        let (op, l, _) = binop(&expr);
        assert_eq!(op, BinaryOp::Multiply);
        assert!(matches!(l, Expr::UnaryOp { op: UnaryOp::Negate, .. }));

        // NOT a AND b → (NOT a) AND b
        let expr = parse("not a and b");
        let (op, l, _) = binop(&expr);
        assert_eq!(op, BinaryOp::And);
        assert!(matches!(l, Expr::UnaryOp { op: UnaryOp::Not, .. }));
    }

    #[test]
    fn test_parentheses_override() {
        let expr = parse("(1 + 2) * 3");
        let (op, l, _) = binop(&expr);
        assert_eq!(op, BinaryOp::Multiply);
        assert_eq!(binop(l).0, BinaryOp::Add);
    }

    #[test]
    fn test_function_calls() {
        let expr = parse("ToUpper(Name)");
        assert!(matches!(
            expr,
            Expr::FunctionCall { qualifier: None, ref name, ref args, .. }
                if name == "ToUpper" && args.len() == 1
        ));
        let expr = parse("a.Concat(a.Name, 'x')");
        assert!(matches!(
            expr,
            Expr::FunctionCall { qualifier: Some(ref q), ref args, .. }
                if q == "a" && args.len() == 2
        ));
        let expr = parse("RowNumber()");
        assert!(matches!(expr, Expr::FunctionCall { ref args, .. } if args.is_empty()));
    }

    #[test]
    fn test_qualified_column() {
        assert_eq!(
            parse("e.Name"),
            Expr::Column(ColumnRef::qualified("e", "Name"), Span::new(0, 6))
        );
    }

    #[test]
    fn test_in_and_not_in() {
        let expr = parse("x in (1, 2, 3)");
        assert!(matches!(expr, Expr::In { not: false, ref list, .. } if list.len() == 3));
        let expr = parse("x not in ('a')");
        assert!(matches!(expr, Expr::In { not: true, .. }));
    }

    #[test]
    fn test_like_and_is_null() {
        assert!(matches!(parse("Name like 'A%'"), Expr::Like { not: false, .. }));
        assert!(matches!(parse("Name not like 'A%'"), Expr::Like { not: true, .. }));
        assert!(matches!(parse("Name is null"), Expr::IsNull { not: false, .. }));
        assert!(matches!(parse("Name is not null"), Expr::IsNull { not: true, .. }));
    }

    #[test]
    fn test_like_binds_tighter_than_and() {
        let expr = parse("a like 'x' and b is null");
        let (op, l, r) = binop(&expr);
        assert_eq!(op, BinaryOp::And);
        assert!(matches!(l, Expr::Like { .. }));
        assert!(matches!(r, Expr::IsNull { .. }));
    }

    #[test]
    fn test_case_when() {
        let expr = parse("case when a > 1 then 'big' when a > 0 then 'small' else 'none' end");
        let Expr::Case { whens, else_expr, .. } = expr else {
            unreachable!("expected case")
        };
        assert_eq!(whens.len(), 2);
        assert!(else_expr.is_some());
        assert!(parse_expr("case else 1 end").is_err());
        assert!(parse_expr("case when 1 then 2").is_err());
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse("true"), Expr::Literal(Literal::Bool(true), Span::new(0, 4)));
        assert!(matches!(parse("null"), Expr::Literal(Literal::Null, _)));
        assert!(matches!(parse("7l"), Expr::Literal(Literal::Long(7), _)));
        assert!(matches!(parse("2.5f"), Expr::Literal(Literal::Double(_), _)));
        assert!(matches!(parse("'s'"), Expr::Literal(Literal::String(_), _)));
    }

    #[test]
    fn test_errors_name_expected_and_found() {
        let err = parse_expr("1 +").unwrap_err();
        assert_eq!(err.expected, "expression");
        assert_eq!(err.found, "end of input");

        let err = parse_expr("(1 + 2").unwrap_err();
        assert_eq!(err.expected, "')'");

        let err = parse_expr("1 2").unwrap_err();
        assert_eq!(err.expected, "end of expression");
        assert_eq!(err.found, "2");

        let err = parse_expr("select").unwrap_err();
        assert_eq!(err.found, "SELECT");
    }

    #[test]
    fn test_print_reparse_preserves_shape() {
        for text in [
            "1 + 2 * 3 - 4",
            "-(1 + 2)",
            "-(-1)",
            "not a = b or c <> d",
            "a & b | c ^ d << 2",
            "x not in (1, 2) and y like 'a\\'b%'",
            "case when a is null then 0 else ~a end",
        ] {
            let first = parse(text);
            let printed = first.to_string();
            let second = parse(&printed);
            assert_eq!(printed, second.to_string(), "unstable print for {text:?}");
        }
    }
}
