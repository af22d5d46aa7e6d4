// Query lexer.
//
// Converts query text into a stream of tokens. Uses memchr for accelerated
// string and comment scanning. Tracks line/column for error reporting.

use std::error::Error;
use std::fmt;
use std::str::FromStr;

use memchr::{memchr, memchr2};
use musoq_ast::Span;
use musoq_error::MusoqError;
use rust_decimal::Decimal;

use crate::token::{Token, TokenKind};

/// Input that matches no token rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub span: Span,
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

impl Error for LexError {}

impl From<LexError> for MusoqError {
    fn from(e: LexError) -> Self {
        Self::Lex {
            detail: e.message,
            offset: e.span.start as usize,
            len: e.span.len() as usize,
            line: e.line,
            col: e.col,
        }
    }
}

/// Lexer over query text.
///
/// `next_token` keeps returning `Eof` once the input is exhausted.
pub struct Lexer<'a> {
    src: &'a [u8],
    text: &'a str,
    pos: usize,
    line: u32,
    col: u32,
    current: Option<Token>,
    last: Option<Token>,
}

impl<'a> Lexer<'a> {
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            text: source,
            pos: 0,
            line: 1,
            col: 1,
            current: None,
            last: None,
        }
    }

    /// Tokenize the whole input, ending with a single `Eof` token.
    pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
        let _span = tracing::debug_span!(target: "musoq.lex", "tokenize", len = source.len())
            .entered();
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token()?;
            let is_eof = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        tracing::debug!(target: "musoq.lex", tokens = tokens.len(), "tokenized");
        Ok(tokens)
    }

    /// The most recently produced token.
    #[must_use]
    pub fn current(&self) -> Option<&Token> {
        self.current.as_ref()
    }

    /// The token produced before [`Self::current`].
    #[must_use]
    pub fn last(&self) -> Option<&Token> {
        self.last.as_ref()
    }

    /// Current scan offset in bytes.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Advance and return the next token.
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        if matches!(self.current, Some(Token { kind: TokenKind::Eof, .. })) {
            return Ok(self.make_token(TokenKind::Eof, self.pos, self.pos, self.line, self.col));
        }
        self.skip_whitespace_and_comments()?;

        let start = self.pos;
        let line = self.line;
        let col = self.col;

        let kind = if self.pos >= self.src.len() {
            TokenKind::Eof
        } else {
            self.lex_kind(start, line, col)?
        };

        let tok = self.make_token(kind, start, self.pos, line, col);
        self.last = self.current.replace(tok.clone());
        Ok(tok)
    }

    fn lex_kind(&mut self, start: usize, line: u32, col: u32) -> Result<TokenKind, LexError> {
        let ch = self.src[self.pos];
        let kind = match ch {
            b'\'' => self.lex_string(start, line, col)?,
            b'[' => self.lex_bracket_id(start, line, col)?,
            b'0'..=b'9' => self.lex_number(start, line, col)?,
            b if b.is_ascii_alphabetic() || b == b'_' || b >= 0x80 => self.lex_identifier(),
            b'+' => self.single(TokenKind::Plus),
            b'-' => self.single(TokenKind::Minus),
            b'*' => self.single(TokenKind::Star),
            b'/' => self.single(TokenKind::Slash),
            b'%' => self.single(TokenKind::Percent),
            b'&' => self.single(TokenKind::Ampersand),
            b'|' => self.single(TokenKind::Pipe),
            b'^' => self.single(TokenKind::Caret),
            b'~' => self.single(TokenKind::Tilde),
            b'.' => self.single(TokenKind::Dot),
            b',' => self.single(TokenKind::Comma),
            b';' => self.single(TokenKind::Semicolon),
            b'(' => self.single(TokenKind::LeftParen),
            b')' => self.single(TokenKind::RightParen),
            b'#' => self.single(TokenKind::Hash),
            b'<' => self.lex_lt(),
            b'>' => self.lex_gt(),
            b'=' => self.lex_eq(),
            b'!' => self.lex_bang(start, line, col)?,
            _ => {
                let c = self.text[start..].chars().next().unwrap_or('?');
                return Err(self.error(format!("unexpected character '{c}'"), start, start + 1, line, col));
            }
        };
        Ok(kind)
    }

    // -----------------------------------------------------------------------
    // Cursor helpers
    // -----------------------------------------------------------------------

    fn advance(&mut self) -> u8 {
        let b = self.src[self.pos];
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else if b & 0xC0 != 0x80 {
            // Continuation bytes do not start a new column.
            self.col += 1;
        }
        b
    }

    fn advance_to(&mut self, target: usize) {
        while self.pos < target {
            self.advance();
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    #[allow(clippy::cast_possible_truncation)]
    fn make_token(&self, kind: TokenKind, start: usize, end: usize, line: u32, col: u32) -> Token {
        Token {
            kind,
            span: Span::new(start as u32, end as u32),
            line,
            col,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn error(&self, message: impl Into<String>, start: usize, end: usize, line: u32, col: u32) -> LexError {
        LexError {
            message: message.into(),
            span: Span::new(start as u32, end as u32),
            line,
            col,
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\n' | b'\r') => {
                    self.advance();
                }
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    let end = memchr(b'\n', &self.src[self.pos..])
                        .map_or(self.src.len(), |i| self.pos + i);
                    self.advance_to(end);
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let (start, line, col) = (self.pos, self.line, self.col);
                    self.advance();
                    self.advance();
                    loop {
                        let Some(i) = memchr(b'*', &self.src[self.pos..]) else {
                            return Err(self.error(
                                "unterminated block comment",
                                start,
                                self.src.len(),
                                line,
                                col,
                            ));
                        };
                        self.advance_to(self.pos + i + 1);
                        if self.peek() == Some(b'/') {
                            self.advance();
                            break;
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Literals and identifiers
    // -----------------------------------------------------------------------

    fn lex_string(&mut self, start: usize, line: u32, col: u32) -> Result<TokenKind, LexError> {
        self.advance(); // opening quote
        let mut out = String::new();
        loop {
            let Some(i) = memchr2(b'\'', b'\\', &self.src[self.pos..]) else {
                return Err(self.error("unterminated string literal", start, self.src.len(), line, col));
            };
            out.push_str(&self.text[self.pos..self.pos + i]);
            self.advance_to(self.pos + i);
            if self.advance() == b'\'' {
                // '' is an escaped quote
                if self.peek() == Some(b'\'') {
                    self.advance();
                    out.push('\'');
                    continue;
                }
                return Ok(TokenKind::String(out));
            }
            let esc_start = self.pos - 1;
            let Some(esc) = self.peek() else {
                return Err(self.error("unterminated string literal", start, self.src.len(), line, col));
            };
            self.advance();
            match esc {
                b'\'' => out.push('\''),
                b'\\' => out.push('\\'),
                b'n' => out.push('\n'),
                b'r' => out.push('\r'),
                b't' => out.push('\t'),
                b'0' => out.push('\0'),
                b'u' => {
                    let hex_end = self.pos + 4;
                    let code = self
                        .text
                        .get(self.pos..hex_end)
                        .and_then(|h| u32::from_str_radix(h, 16).ok())
                        .and_then(char::from_u32);
                    let Some(c) = code else {
                        return Err(self.error("invalid unicode escape", esc_start, hex_end.min(self.src.len()), line, col));
                    };
                    self.advance_to(hex_end);
                    out.push(c);
                }
                other => {
                    return Err(self.error(
                        format!("invalid escape sequence '\\{}'", char::from(other)),
                        esc_start,
                        self.pos,
                        line,
                        col,
                    ));
                }
            }
        }
    }

    fn lex_bracket_id(&mut self, start: usize, line: u32, col: u32) -> Result<TokenKind, LexError> {
        self.advance(); // [
        let Some(i) = memchr(b']', &self.src[self.pos..]) else {
            return Err(self.error("unterminated bracketed identifier", start, self.src.len(), line, col));
        };
        let name = self.text[self.pos..self.pos + i].to_owned();
        self.advance_to(self.pos + i + 1);
        Ok(TokenKind::QuotedId(name))
    }

    fn is_ident_byte(b: u8) -> bool {
        b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
    }

    fn lex_identifier(&mut self) -> TokenKind {
        let start = self.pos;
        while self.peek().is_some_and(Self::is_ident_byte) {
            self.advance();
        }
        let word = &self.text[start..self.pos];
        TokenKind::lookup_keyword(word).unwrap_or_else(|| TokenKind::Id(word.to_owned()))
    }

    fn lex_number(&mut self, start: usize, line: u32, col: u32) -> Result<TokenKind, LexError> {
        // Radix-prefixed integers.
        if self.peek() == Some(b'0') {
            let radix = match self.peek_at(1) {
                Some(b'x' | b'X') => Some(16),
                Some(b'b' | b'B') => Some(2),
                Some(b'o' | b'O') => Some(8),
                _ => None,
            };
            if let Some(radix) = radix {
                self.advance();
                self.advance();
                let text = self.text;
                let digits_start = self.pos;
                while self.peek().is_some_and(|b| b.is_ascii_alphanumeric()) {
                    self.advance();
                }
                let mut digits = &text[digits_start..self.pos];
                let suffix = match digits.as_bytes().last() {
                    Some(b'l' | b'L') => {
                        digits = &digits[..digits.len() - 1];
                        Some(b'l')
                    }
                    Some(b'i' | b'I') => {
                        digits = &digits[..digits.len() - 1];
                        Some(b'i')
                    }
                    _ => None,
                };
                let value = i64::from_str_radix(digits, radix).map_err(|_| {
                    self.error("invalid radix integer literal", start, self.pos, line, col)
                })?;
                return self.integer_kind(value, suffix, start, line, col);
            }
        }

        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.advance();
        }
        let mut fractional = false;
        let mut exponent = false;
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            fractional = true;
            self.advance();
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some(b'+' | b'-')));
            if self.peek_at(1 + sign).is_some_and(|b| b.is_ascii_digit()) {
                exponent = true;
                for _ in 0..=sign {
                    self.advance();
                }
                while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                    self.advance();
                }
            }
        }
        let text = self.text;
        let body = &text[start..self.pos];

        let suffix = match self.peek() {
            Some(s @ (b'd' | b'D' | b'f' | b'F' | b'l' | b'L' | b'i' | b'I'))
                if !self.peek_at(1).is_some_and(Self::is_ident_byte) =>
            {
                self.advance();
                Some(s.to_ascii_lowercase())
            }
            Some(b) if Self::is_ident_byte(b) => {
                return Err(self.error("invalid number literal", start, self.pos + 1, line, col));
            }
            _ => None,
        };

        let bad = |lexer: &Self| lexer.error(format!("invalid number literal '{body}'"), start, lexer.pos, line, col);
        match suffix {
            Some(b'f') => parse_double(body).map(TokenKind::Double).ok_or_else(|| bad(self)),
            Some(b'd') => parse_decimal(body, exponent).map(TokenKind::Decimal).ok_or_else(|| bad(self)),
            None if exponent => parse_double(body).map(TokenKind::Double).ok_or_else(|| bad(self)),
            None if fractional => parse_decimal(body, false).map(TokenKind::Decimal).ok_or_else(|| bad(self)),
            _ if fractional || exponent => Err(self.error(
                "integer suffix on fractional literal",
                start,
                self.pos,
                line,
                col,
            )),
            suffix => {
                let value = body.parse::<i64>().map_err(|_| {
                    self.error("integer literal out of range", start, self.pos, line, col)
                })?;
                self.integer_kind(value, suffix, start, line, col)
            }
        }
    }

    fn integer_kind(
        &self,
        value: i64,
        suffix: Option<u8>,
        start: usize,
        line: u32,
        col: u32,
    ) -> Result<TokenKind, LexError> {
        match suffix {
            Some(b'l') => Ok(TokenKind::Long(value)),
            Some(b'i') => i32::try_from(value)
                .map(TokenKind::Int)
                .map_err(|_| self.error("integer literal out of range for int", start, self.pos, line, col)),
            _ => Ok(i32::try_from(value).map_or(TokenKind::Long(value), TokenKind::Int)),
        }
    }

    // -----------------------------------------------------------------------
    // Operators (greedy, longest match first)
    // -----------------------------------------------------------------------

    fn lex_lt(&mut self) -> TokenKind {
        self.advance();
        match self.peek() {
            Some(b'=') => self.single(TokenKind::Le),
            Some(b'>') => self.single(TokenKind::Ne),
            Some(b'<') => self.single(TokenKind::ShiftLeft),
            _ => TokenKind::Lt,
        }
    }

    fn lex_gt(&mut self) -> TokenKind {
        self.advance();
        match self.peek() {
            Some(b'=') => self.single(TokenKind::Ge),
            Some(b'>') => self.single(TokenKind::ShiftRight),
            _ => TokenKind::Gt,
        }
    }

    fn lex_eq(&mut self) -> TokenKind {
        self.advance();
        if self.peek() == Some(b'=') {
            self.advance();
        }
        TokenKind::Eq
    }

    fn lex_bang(&mut self, start: usize, line: u32, col: u32) -> Result<TokenKind, LexError> {
        self.advance();
        if self.peek() == Some(b'=') {
            self.advance();
            Ok(TokenKind::Ne)
        } else {
            Err(self.error("expected '=' after '!'", start, self.pos, line, col))
        }
    }
}

/// Finite doubles only: overflowing literals have no printable form.
fn parse_double(body: &str) -> Option<f64> {
    body.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_decimal(body: &str, exponent: bool) -> Option<Decimal> {
    if exponent {
        Decimal::from_scientific(body).ok()
    } else {
        Decimal::from_str(body).ok()
    }
}
