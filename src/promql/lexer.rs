//! Byte-level PromQL tokenizer.
//!
//! Only as much of the grammar as selector rewriting needs: every byte of the
//! input either lands in a token, is whitespace, or is part of a comment. Any
//! other byte fails the whole expression.

use std::ops::Range;

use super::RewriteError;

/// Token categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Metric name, label name, function name, or keyword
    Ident,
    /// Number or duration literal (`5`, `0.5`, `1e3`, `5m`, `1h30m`, `0x1f`)
    Number,
    /// Double-, single-, or backtick-quoted string
    Str,
    /// `(`
    LeftParen,
    /// `)`
    RightParen,
    /// `{`
    LeftBrace,
    /// `}`
    RightBrace,
    /// `[`
    LeftBracket,
    /// `]`
    RightBracket,
    /// `,`
    Comma,
    /// `:` inside a range or subquery bracket
    Colon,
    /// `@`
    At,
    /// `=`
    Eq,
    /// `!=`
    Neq,
    /// `=~`
    EqRegex,
    /// `!~`
    NeqRegex,
    /// Arithmetic and comparison operators
    Operator,
}

impl TokenKind {
    /// True for the four label matching operators
    #[must_use]
    pub fn is_match_op(self) -> bool {
        matches!(self, Self::Eq | Self::Neq | Self::EqRegex | Self::NeqRegex)
    }
}

/// A token and its byte range in the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Category
    pub kind: TokenKind,
    /// Byte range in the lexed input
    pub span: Range<usize>,
}

impl Token {
    /// Source text of this token
    #[must_use]
    pub fn text<'a>(&self, input: &'a str) -> &'a str {
        &input[self.span.clone()]
    }
}

/// Split `input` into tokens, dropping whitespace and comments.
pub fn tokenize(input: &str) -> Result<Vec<Token>, RewriteError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    let mut bracket_depth = 0usize;

    while pos < bytes.len() {
        let b = bytes[pos];
        let start = pos;

        let kind = match b {
            b' ' | b'\t' | b'\n' | b'\r' => {
                pos += 1;
                continue;
            }
            b'#' => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
                continue;
            }
            b'"' | b'\'' | b'`' => {
                pos = scan_string(bytes, pos)?;
                tokens.push(Token {
                    kind: TokenKind::Str,
                    span: start..pos,
                });
                continue;
            }
            b'(' => TokenKind::LeftParen,
            b')' => TokenKind::RightParen,
            b'{' => TokenKind::LeftBrace,
            b'}' => TokenKind::RightBrace,
            b'[' => {
                bracket_depth += 1;
                TokenKind::LeftBracket
            }
            b']' => {
                bracket_depth = bracket_depth.saturating_sub(1);
                TokenKind::RightBracket
            }
            b',' => TokenKind::Comma,
            b'@' => TokenKind::At,
            b':' if bracket_depth > 0 => TokenKind::Colon,
            b'=' => match bytes.get(pos + 1) {
                Some(b'~') => {
                    pos += 1;
                    TokenKind::EqRegex
                }
                Some(b'=') => {
                    pos += 1;
                    TokenKind::Operator
                }
                _ => TokenKind::Eq,
            },
            b'!' => match bytes.get(pos + 1) {
                Some(b'=') => {
                    pos += 1;
                    TokenKind::Neq
                }
                Some(b'~') => {
                    pos += 1;
                    TokenKind::NeqRegex
                }
                _ => return Err(unexpected(input, pos)),
            },
            b'<' | b'>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 1;
                }
                TokenKind::Operator
            }
            b'+' | b'-' | b'*' | b'/' | b'%' | b'^' => TokenKind::Operator,
            b'0'..=b'9' => {
                pos = scan_number(bytes, pos);
                tokens.push(Token {
                    kind: TokenKind::Number,
                    span: start..pos,
                });
                continue;
            }
            b'.' if bytes.get(pos + 1).is_some_and(u8::is_ascii_digit) => {
                pos = scan_number(bytes, pos);
                tokens.push(Token {
                    kind: TokenKind::Number,
                    span: start..pos,
                });
                continue;
            }
            b if is_ident_start(b) => {
                let allow_colon = bracket_depth == 0;
                pos += 1;
                while pos < bytes.len() && is_ident_continue(bytes[pos], allow_colon) {
                    pos += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident,
                    span: start..pos,
                });
                continue;
            }
            _ => return Err(unexpected(input, pos)),
        };

        pos += 1;
        tokens.push(Token {
            kind,
            span: start..pos,
        });
    }

    Ok(tokens)
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':'
}

fn is_ident_continue(b: u8, allow_colon: bool) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || (allow_colon && b == b':')
}

/// Returns the offset just past the closing quote.
fn scan_string(bytes: &[u8], start: usize) -> Result<usize, RewriteError> {
    let quote = bytes[start];
    let mut pos = start + 1;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' if quote != b'`' => pos += 2,
            b if b == quote => return Ok(pos + 1),
            _ => pos += 1,
        }
    }
    Err(RewriteError::UnterminatedString(start))
}

/// Numbers and durations share one loose token; neither can contain
/// anything selector-relevant.
fn scan_number(bytes: &[u8], start: usize) -> usize {
    let hex = bytes[start..].starts_with(b"0x") || bytes[start..].starts_with(b"0X");
    let mut pos = start + 1;
    while pos < bytes.len() {
        let b = bytes[pos];
        let exponent_sign =
            !hex && (b == b'+' || b == b'-') && matches!(bytes[pos - 1], b'e' | b'E');
        if b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || exponent_sign {
            pos += 1;
        } else {
            break;
        }
    }
    pos
}

fn unexpected(input: &str, pos: usize) -> RewriteError {
    RewriteError::UnexpectedChar {
        pos,
        ch: input[pos..].chars().next().unwrap_or('\u{fffd}'),
    }
}
