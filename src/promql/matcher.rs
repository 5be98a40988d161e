//! Label matchers and per-client constraints.

use std::fmt;

use super::RewriteError;
use super::lexer::{Token, TokenKind, tokenize};

/// One `name op "value"` term
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    /// Label name
    pub name: String,
    /// `=`, `!=`, `=~` or `!~`
    pub op: String,
    /// Value literal exactly as written, quotes included
    pub value: String,
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.name, self.op, self.value)
    }
}

/// A label constraint enforced for one client.
///
/// Accepts `team="a"`, `{team="a"}` and multi-term forms such as
/// `team="a", env=~"prod|staging"`. All terms are ANDed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    matchers: Vec<LabelMatcher>,
}

impl Constraint {
    /// Parse a configured constraint
    pub fn parse(source: &str) -> Result<Self, RewriteError> {
        let trimmed = source.trim();
        let inner = trimmed
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(trimmed);
        let block = format!("{{{inner}}}");
        let tokens = tokenize(&block)?;

        let parsed = parse_matcher_block(&block, &tokens, 0)?;
        if parsed.close + 1 != tokens.len() {
            return Err(RewriteError::Syntax(
                "unexpected input after matchers",
                tokens[parsed.close + 1].span.start,
            ));
        }
        if parsed.matchers.is_empty() {
            return Err(RewriteError::Syntax("constraint has no label matchers", 0));
        }

        Ok(Self {
            matchers: parsed.matchers,
        })
    }

    /// Individual terms
    #[must_use]
    pub fn matchers(&self) -> &[LabelMatcher] {
        &self.matchers
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, m) in self.matchers.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{m}")?;
        }
        Ok(())
    }
}

/// Result of parsing one `{ ... }` block
#[derive(Debug)]
pub(super) struct MatcherBlock {
    /// Token index of the closing brace
    pub close: usize,
    /// Whether the last matcher is followed by a comma
    pub trailing_comma: bool,
    /// Parsed terms
    pub matchers: Vec<LabelMatcher>,
}

/// Parse the brace block whose `{` is at `tokens[open]`.
///
/// Only plain `label op string` terms separated by commas are accepted.
pub(super) fn parse_matcher_block(
    input: &str,
    tokens: &[Token],
    open: usize,
) -> Result<MatcherBlock, RewriteError> {
    let open_pos = tokens[open].span.start;
    let at = |i: usize| tokens.get(i).ok_or(RewriteError::Unbalanced('{', open_pos));

    let mut i = open + 1;
    let mut matchers = Vec::new();
    let mut trailing_comma = false;

    loop {
        let tok = at(i)?;
        match tok.kind {
            TokenKind::RightBrace => break,
            TokenKind::Ident => {
                let name = tok.text(input);
                if !is_label_name(name) {
                    return Err(RewriteError::Syntax("invalid label name", tok.span.start));
                }
                let op = at(i + 1)?;
                if !op.kind.is_match_op() {
                    return Err(RewriteError::Syntax(
                        "expected label matching operator",
                        op.span.start,
                    ));
                }
                let value = at(i + 2)?;
                if value.kind != TokenKind::Str {
                    return Err(RewriteError::Syntax(
                        "expected quoted label value",
                        value.span.start,
                    ));
                }
                matchers.push(LabelMatcher {
                    name: name.to_string(),
                    op: op.text(input).to_string(),
                    value: value.text(input).to_string(),
                });
                i += 3;

                let sep = at(i)?;
                match sep.kind {
                    TokenKind::Comma => {
                        trailing_comma = true;
                        i += 1;
                    }
                    TokenKind::RightBrace => {
                        trailing_comma = false;
                    }
                    _ => {
                        return Err(RewriteError::Syntax(
                            "expected ',' or '}' after label matcher",
                            sep.span.start,
                        ));
                    }
                }
            }
            _ => {
                return Err(RewriteError::Syntax("expected label matcher", tok.span.start));
            }
        }
    }

    Ok(MatcherBlock {
        close: i,
        trailing_comma,
        matchers,
    })
}

fn is_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_braced_forms() {
        let bare = Constraint::parse(r#"team="a""#).unwrap();
        let braced = Constraint::parse(r#" {team="a"} "#).unwrap();
        assert_eq!(bare, braced);
        assert_eq!(bare.to_string(), r#"team="a""#);
    }

    #[test]
    fn multiple_terms_render_without_spaces() {
        let c = Constraint::parse(r#"team="a", env=~'prod|stg' ,"#).unwrap();
        assert_eq!(c.matchers().len(), 2);
        assert_eq!(c.to_string(), r#"team="a",env=~'prod|stg'"#);
    }

    #[test]
    fn rejects_malformed_constraints() {
        for bad in [
            "",
            "{}",
            "team",
            r#"team="a" or vector(1)"#,
            r#"team="a"} or {x="y""#,
            r#"team=a"#,
            r#"te:am="a""#,
            r#"team=="a""#,
            r#"team="a"#,
            r#"up{team="a"}"#,
        ] {
            assert!(Constraint::parse(bad).is_err(), "accepted {bad:?}");
        }
    }
}
