// Query token types.
//
// Every token carries a discriminant and a byte-offset Span.
// Keywords are their own variants so the parser matches them directly.

use musoq_ast::Span;
use rust_decimal::Decimal;

/// A single token produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte-offset span into the original source.
    pub span: Span,
    /// Line number (1-based) at the start of the token.
    pub line: u32,
    /// Column number (1-based) at the start of the token.
    pub col: u32,
}

/// Token discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // === Literals ===
    /// `42`, `7i`, `0xFF`
    Int(i32),
    /// `5000000000`, `7l`
    Long(i64),
    /// `1.5`, `3d`
    Decimal(Decimal),
    /// `2.5f`, `1e3`
    Double(f64),
    /// `'hello'`
    String(String),

    // === Identifiers ===
    Id(String),
    /// `[bracketed name]`
    QuotedId(String),

    // === Operators ===
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Ampersand,
    Pipe,
    Caret,
    Tilde,
    ShiftLeft,
    ShiftRight,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // === Punctuation ===
    Dot,
    Comma,
    Semicolon,
    LeftParen,
    RightParen,
    /// `#` before a schema name.
    Hash,

    // === Keywords ===
    KwAll,
    KwAnd,
    KwApply,
    KwAs,
    KwAsc,
    KwBy,
    KwCase,
    KwCross,
    KwDesc,
    KwDistinct,
    KwElse,
    KwEnd,
    KwExcept,
    KwFalse,
    KwFrom,
    KwGroup,
    KwHaving,
    KwIn,
    KwInner,
    KwIntersect,
    KwIs,
    KwJoin,
    KwLeft,
    KwLike,
    KwNot,
    KwNull,
    KwOn,
    KwOr,
    KwOrder,
    KwOuter,
    KwRight,
    KwSelect,
    KwSkip,
    KwTake,
    KwThen,
    KwTrue,
    KwUnion,
    KwWhen,
    KwWhere,
    KwWith,

    Eof,
}

impl TokenKind {
    /// Case-insensitive keyword lookup.
    #[must_use]
    pub fn lookup_keyword(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Some(Self::KwAll),
            "AND" => Some(Self::KwAnd),
            "APPLY" => Some(Self::KwApply),
            "AS" => Some(Self::KwAs),
            "ASC" => Some(Self::KwAsc),
            "BY" => Some(Self::KwBy),
            "CASE" => Some(Self::KwCase),
            "CROSS" => Some(Self::KwCross),
            "DESC" => Some(Self::KwDesc),
            "DISTINCT" => Some(Self::KwDistinct),
            "ELSE" => Some(Self::KwElse),
            "END" => Some(Self::KwEnd),
            "EXCEPT" => Some(Self::KwExcept),
            "FALSE" => Some(Self::KwFalse),
            "FROM" => Some(Self::KwFrom),
            "GROUP" => Some(Self::KwGroup),
            "HAVING" => Some(Self::KwHaving),
            "IN" => Some(Self::KwIn),
            "INNER" => Some(Self::KwInner),
            "INTERSECT" => Some(Self::KwIntersect),
            "IS" => Some(Self::KwIs),
            "JOIN" => Some(Self::KwJoin),
            "LEFT" => Some(Self::KwLeft),
            "LIKE" => Some(Self::KwLike),
            "NOT" => Some(Self::KwNot),
            "NULL" => Some(Self::KwNull),
            "ON" => Some(Self::KwOn),
            "OR" => Some(Self::KwOr),
            "ORDER" => Some(Self::KwOrder),
            "OUTER" => Some(Self::KwOuter),
            "RIGHT" => Some(Self::KwRight),
            "SELECT" => Some(Self::KwSelect),
            "SKIP" => Some(Self::KwSkip),
            "TAKE" => Some(Self::KwTake),
            "THEN" => Some(Self::KwThen),
            "TRUE" => Some(Self::KwTrue),
            "UNION" => Some(Self::KwUnion),
            "WHEN" => Some(Self::KwWhen),
            "WHERE" => Some(Self::KwWhere),
            "WITH" => Some(Self::KwWith),
            _ => None,
        }
    }

    /// Human-readable rendering for diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Long(n) => format!("{n}l"),
            Self::Decimal(d) => d.to_string(),
            Self::Double(v) => format!("{v}f"),
            Self::String(s) => format!("'{s}'"),
            Self::Id(s) => s.clone(),
            Self::QuotedId(s) => format!("[{s}]"),
            Self::Eof => "end of input".to_owned(),
            Self::Plus => "'+'".to_owned(),
            Self::Minus => "'-'".to_owned(),
            Self::Star => "'*'".to_owned(),
            Self::Slash => "'/'".to_owned(),
            Self::Percent => "'%'".to_owned(),
            Self::Ampersand => "'&'".to_owned(),
            Self::Pipe => "'|'".to_owned(),
            Self::Caret => "'^'".to_owned(),
            Self::Tilde => "'~'".to_owned(),
            Self::ShiftLeft => "'<<'".to_owned(),
            Self::ShiftRight => "'>>'".to_owned(),
            Self::Eq => "'='".to_owned(),
            Self::Ne => "'<>'".to_owned(),
            Self::Lt => "'<'".to_owned(),
            Self::Le => "'<='".to_owned(),
            Self::Gt => "'>'".to_owned(),
            Self::Ge => "'>='".to_owned(),
            Self::Dot => "'.'".to_owned(),
            Self::Comma => "','".to_owned(),
            Self::Semicolon => "';'".to_owned(),
            Self::LeftParen => "'('".to_owned(),
            Self::RightParen => "')'".to_owned(),
            Self::Hash => "'#'".to_owned(),
            kw => format!("{kw:?}")
                .strip_prefix("Kw")
                .map_or_else(String::new, str::to_ascii_uppercase),
        }
    }

    /// Whether this token can begin a set-operation branch or clause that
    /// ends the current select list.
    #[must_use]
    pub const fn is_clause_start(&self) -> bool {
        matches!(
            self,
            Self::KwFrom
                | Self::KwWhere
                | Self::KwGroup
                | Self::KwHaving
                | Self::KwOrder
                | Self::KwSkip
                | Self::KwTake
                | Self::KwUnion
                | Self::KwIntersect
                | Self::KwExcept
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_reserved_word_is_a_keyword_token() {
        for kw in musoq_ast::KEYWORDS {
            assert!(
                TokenKind::lookup_keyword(kw).is_some(),
                "{kw} missing from lookup_keyword"
            );
        }
    }

    #[test]
    fn keyword_lookup_is_case_insensitive() {
        assert_eq!(TokenKind::lookup_keyword("select"), Some(TokenKind::KwSelect));
        assert_eq!(TokenKind::lookup_keyword("TaKe"), Some(TokenKind::KwTake));
        assert_eq!(TokenKind::lookup_keyword("Name"), None);
    }

    #[test]
    fn describe_keywords_and_literals() {
        assert_eq!(TokenKind::KwSelect.describe(), "SELECT");
        assert_eq!(TokenKind::Int(3).describe(), "3");
        assert_eq!(TokenKind::Eof.describe(), "end of input");
        assert_eq!(TokenKind::Ge.describe(), "'>='");
    }
}
