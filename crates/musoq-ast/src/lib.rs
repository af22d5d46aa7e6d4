//! Abstract syntax tree for the Musoq query language.
//!
//! Every query parsed by `musoq-parser` produces a [`SelectStatement`] tree of
//! these nodes. All expression nodes carry a [`Span`] for error reporting.
//! Trees are immutable once built; later passes produce new typed trees
//! instead of mutating these.

mod display;

use std::fmt;

use rust_decimal::Decimal;

// ---------------------------------------------------------------------------
// Span
// ---------------------------------------------------------------------------

/// A byte-offset range into the original query text.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    /// Byte offset of the first character (inclusive).
    pub start: u32,
    /// Byte offset one past the last character (exclusive).
    pub end: u32,
}

impl Span {
    #[must_use]
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Placeholder span at position 0.
    pub const ZERO: Self = Self { start: 0, end: 0 };

    /// Smallest span covering both.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        let start = if self.start < other.start {
            self.start
        } else {
            other.start
        };
        let end = if self.end > other.end {
            self.end
        } else {
            other.end
        };
        Self { start, end }
    }

    #[must_use]
    pub const fn len(self) -> u32 {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.start == self.end
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Reserved words. Identifiers spelled like one of these are printed in
/// brackets so that printed queries parse back to the same tree.
pub const KEYWORDS: &[&str] = &[
    "AND", "APPLY", "AS", "ASC", "BY", "CASE", "CROSS", "DESC", "DISTINCT", "ELSE", "END",
    "EXCEPT", "FALSE", "FROM", "GROUP", "HAVING", "IN", "INNER", "INTERSECT", "IS", "JOIN",
    "LEFT", "LIKE", "NOT", "NULL", "ON", "OR", "ORDER", "OUTER", "RIGHT", "SELECT", "SKIP",
    "TAKE", "THEN", "TRUE", "UNION", "ALL", "WHEN", "WHERE", "WITH",
];

/// Case-insensitive membership in [`KEYWORDS`].
#[must_use]
pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

// ---------------------------------------------------------------------------
// Literals
// ---------------------------------------------------------------------------

/// A literal value as written in the query.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Integer that fits in 32 bits, or has an `i` suffix.
    Int(i32),
    /// Integer too large for 32 bits, or with an `l` suffix.
    Long(i64),
    /// Fractional number without suffix, or with a `d` suffix.
    Decimal(Decimal),
    /// Number with an `f` suffix.
    Double(f64),
    String(String),
    Bool(bool),
    Null,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// Reference to a column, optionally qualified by a source alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

impl ColumnRef {
    #[must_use]
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn qualified(qualifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            qualifier: Some(qualifier.into()),
            name: name.into(),
        }
    }
}

/// Binary operators, listed from the tightest-binding tier down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Multiply,
    Divide,
    Modulo,
    Add,
    Subtract,
    ShiftLeft,
    ShiftRight,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,
}

impl BinaryOp {
    #[must_use]
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Lt | Self::Le | Self::Gt | Self::Ge | Self::Eq | Self::Ne
        )
    }

    #[must_use]
    pub const fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Self::Multiply | Self::Divide | Self::Modulo | Self::Add | Self::Subtract
        )
    }

    #[must_use]
    pub const fn is_bitwise(self) -> bool {
        matches!(
            self,
            Self::ShiftLeft | Self::ShiftRight | Self::BitAnd | Self::BitXor | Self::BitOr
        )
    }

    #[must_use]
    pub const fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negate,
    BitNot,
    Not,
}

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal, Span),
    Column(ColumnRef, Span),
    BinaryOp {
        left: Box<Self>,
        op: BinaryOp,
        right: Box<Self>,
        span: Span,
    },
    UnaryOp {
        op: UnaryOp,
        expr: Box<Self>,
        span: Span,
    },
    /// Method call. `qualifier` names the source whose schema library
    /// provides the method (`a.ToUpper(a.Name)`).
    FunctionCall {
        qualifier: Option<String>,
        name: String,
        args: Vec<Self>,
        span: Span,
    },
    /// `CASE WHEN c THEN r ... [ELSE e] END`
    Case {
        whens: Vec<(Self, Self)>,
        else_expr: Option<Box<Self>>,
        span: Span,
    },
    /// `expr [NOT] IN (a, b, ...)`
    In {
        expr: Box<Self>,
        list: Vec<Self>,
        not: bool,
        span: Span,
    },
    /// `expr [NOT] LIKE pattern`
    Like {
        expr: Box<Self>,
        pattern: Box<Self>,
        not: bool,
        span: Span,
    },
    /// `expr IS [NOT] NULL`
    IsNull {
        expr: Box<Self>,
        not: bool,
        span: Span,
    },
}

impl Expr {
    #[must_use]
    pub const fn span(&self) -> Span {
        match self {
            Self::Literal(_, s) | Self::Column(_, s) => *s,
            Self::BinaryOp { span, .. }
            | Self::UnaryOp { span, .. }
            | Self::FunctionCall { span, .. }
            | Self::Case { span, .. }
            | Self::In { span, .. }
            | Self::Like { span, .. }
            | Self::IsNull { span, .. } => *span,
        }
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

/// Root node: a full query with optional CTEs, set operations, ordering and
/// paging.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub with: Option<WithClause>,
    pub body: SelectBody,
    pub order_by: Vec<OrderingTerm>,
    pub skip: Option<u64>,
    pub take: Option<u64>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithClause {
    pub ctes: Vec<Cte>,
}

/// `name AS (query)`
#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub query: Box<SelectStatement>,
    pub span: Span,
}

/// First SELECT block followed by set-operation branches, combined
/// left to right.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectBody {
    pub select: SelectCore,
    pub compounds: Vec<(CompoundOp, SelectCore)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompoundOp {
    Union,
    UnionAll,
    Intersect,
    Except,
}

/// One SELECT block.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectCore {
    pub distinct: bool,
    pub columns: Vec<ResultColumn>,
    pub from: Option<FromClause>,
    pub where_clause: Option<Box<Expr>>,
    pub group_by: Vec<Expr>,
    pub having: Option<Box<Expr>>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultColumn {
    /// `*`
    Star,
    /// `alias.*`
    TableStar(String),
    /// `expr [AS alias]`
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FromClause {
    pub source: FromSource,
    pub joins: Vec<JoinClause>,
}

/// A row-producing source in FROM, JOIN or APPLY position.
#[derive(Debug, Clone, PartialEq)]
pub enum FromSource {
    /// `#schema.method(args) [alias]`
    SchemaMethod {
        schema: String,
        method: String,
        args: Vec<Expr>,
        alias: Option<String>,
        span: Span,
    },
    /// Reference to a CTE by name.
    Reference {
        name: String,
        alias: Option<String>,
        span: Span,
    },
    /// `(query) alias`
    Subquery {
        query: Box<SelectStatement>,
        alias: Option<String>,
        span: Span,
    },
}

impl FromSource {
    #[must_use]
    pub fn alias(&self) -> Option<&str> {
        match self {
            Self::SchemaMethod { alias, .. }
            | Self::Reference { alias, .. }
            | Self::Subquery { alias, .. } => alias.as_deref(),
        }
    }

    #[must_use]
    pub const fn span(&self) -> Span {
        match self {
            Self::SchemaMethod { span, .. }
            | Self::Reference { span, .. }
            | Self::Subquery { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    RightOuter,
    CrossApply,
    OuterApply,
}

impl JoinKind {
    #[must_use]
    pub const fn is_apply(self) -> bool {
        matches!(self, Self::CrossApply | Self::OuterApply)
    }
}

/// JOIN (with `on`) or APPLY (without).
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub source: FromSource,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderingTerm {
    pub expr: Expr,
    pub direction: SortDirection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_merge_and_len() {
        let a = Span::new(4, 9);
        let b = Span::new(2, 6);
        let m = a.merge(b);
        assert_eq!(m, Span::new(2, 9));
        assert_eq!(m.len(), 7);
        assert!(Span::ZERO.is_empty());
        assert_eq!(format!("{m:?}"), "2..9");
    }

    #[test]
    fn keyword_lookup_ignores_case() {
        assert!(is_keyword("select"));
        assert!(is_keyword("Take"));
        assert!(!is_keyword("Name"));
    }

    #[test]
    fn operator_classes() {
        assert!(BinaryOp::Ge.is_comparison());
        assert!(BinaryOp::Modulo.is_arithmetic());
        assert!(BinaryOp::BitXor.is_bitwise());
        assert!(BinaryOp::Or.is_logical());
        assert!(!BinaryOp::Eq.is_arithmetic());
    }

    #[test]
    fn expr_span_for_every_shape() {
        let col = Expr::Column(ColumnRef::bare("x"), Span::new(0, 1));
        let like = Expr::Like {
            expr: Box::new(col.clone()),
            pattern: Box::new(Expr::Literal(Literal::String("a%".into()), Span::new(7, 11))),
            not: false,
            span: Span::new(0, 11),
        };
        assert_eq!(col.span(), Span::new(0, 1));
        assert_eq!(like.span(), Span::new(0, 11));
    }

    #[test]
    fn from_source_alias() {
        let src = FromSource::SchemaMethod {
            schema: "test".into(),
            method: "entities".into(),
            args: vec![],
            alias: Some("e".into()),
            span: Span::ZERO,
        };
        assert_eq!(src.alias(), Some("e"));
        assert!(JoinKind::OuterApply.is_apply());
        assert!(!JoinKind::LeftOuter.is_apply());
    }
}
