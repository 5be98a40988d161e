//! Locating vector selectors and splicing constraints into them.

use std::ops::Range;

use super::RewriteError;
use super::lexer::{Token, TokenKind, tokenize};
use super::matcher::{Constraint, parse_matcher_block};

/// Set operators and `atan2`, binary only between two operands
const BINARY_KEYWORDS: &[&str] = &["and", "or", "unless", "atan2"];

/// Words that may only appear in modifier position; an operand slot never
/// holds one as a function name
const MODIFIER_KEYWORDS: &[&str] = &[
    "by",
    "without",
    "on",
    "ignoring",
    "group_left",
    "group_right",
    "bool",
    "offset",
    "and",
    "or",
    "unless",
    "atan2",
];

/// Aggregation operators, which may be followed by `by`/`without` before
/// their argument list
const AGGREGATORS: &[&str] = &[
    "sum",
    "avg",
    "count",
    "min",
    "max",
    "group",
    "stddev",
    "stdvar",
    "topk",
    "bottomk",
    "count_values",
    "quantile",
    "limitk",
    "limit_ratio",
];

/// Where and how constraints go into one selector
#[derive(Debug, Clone, PartialEq, Eq)]
struct SelectorSite {
    /// Byte range of the selector (name and brace block)
    span: Range<usize>,
    /// Byte offset the constraint text is inserted at
    insert_at: usize,
    /// How to wrap the constraint text
    mode: Insertion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Insertion {
    /// Name without braces: insert `{c}`
    NewBlock,
    /// Existing block with matchers and no trailing comma: insert `,c`
    AfterMatcher,
    /// Empty block or trailing comma: insert `c`
    Bare,
}

/// AND `constraints` into every vector selector of a full PromQL expression.
///
/// Returns the expression unchanged when `constraints` is empty. Fails when
/// any part of the expression cannot be classified with certainty.
pub fn inject_expression(expr: &str, constraints: &[Constraint]) -> Result<String, RewriteError> {
    if constraints.is_empty() {
        return Ok(expr.to_string());
    }
    let tokens = tokenize(expr)?;
    let sites = find_selectors(expr, &tokens)?;
    Ok(splice(expr, &sites, constraints))
}

/// AND `constraints` into a value that must be exactly one series selector,
/// as used by `match[]`.
pub fn inject_selector(selector: &str, constraints: &[Constraint]) -> Result<String, RewriteError> {
    let tokens = tokenize(selector)?;
    let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
        return Err(RewriteError::NotASeriesSelector(selector.to_string()));
    };
    let sites = find_selectors(selector, &tokens)?;
    match sites.as_slice() {
        [site] if site.span == (first.span.start..last.span.end) => {
            if constraints.is_empty() {
                return Ok(selector.to_string());
            }
            Ok(splice(selector, &sites, constraints))
        }
        _ => Err(RewriteError::NotASeriesSelector(selector.to_string())),
    }
}

/// A selector consisting solely of `constraints`
#[must_use]
pub fn synthesize_selector(constraints: &[Constraint]) -> String {
    format!("{{{}}}", join(constraints))
}

fn join(constraints: &[Constraint]) -> String {
    constraints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn splice(input: &str, sites: &[SelectorSite], constraints: &[Constraint]) -> String {
    let terms = join(constraints);
    let mut out = String::with_capacity(input.len() + sites.len() * (terms.len() + 3));
    let mut last = 0;
    for site in sites {
        out.push_str(&input[last..site.insert_at]);
        match site.mode {
            Insertion::NewBlock => {
                out.push('{');
                out.push_str(&terms);
                out.push('}');
            }
            Insertion::AfterMatcher => {
                out.push(',');
                out.push_str(&terms);
            }
            Insertion::Bare => out.push_str(&terms),
        }
        last = site.insert_at;
    }
    out.push_str(&input[last..]);
    out
}

/// What the walker expects at the current token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// An operand must come next
    Operand,
    /// Right after a binary operator: `bool`, `on`, `ignoring` may follow
    AfterBinary,
    /// After `on(...)`/`ignoring(...)`: `group_left`/`group_right` may follow
    AfterMatching,
    /// After a complete operand
    Complete,
    /// After the argument list of an aggregation: `by`/`without` may follow
    AfterAggregation,
}

impl Position {
    fn wants_operand(self) -> bool {
        matches!(self, Self::Operand | Self::AfterBinary | Self::AfterMatching)
    }
}

/// Walk the token stream and return every vector selector in source order.
///
/// Keywords are only recognised where the grammar leaves no doubt; in
/// operand position any other identifier is a metric name, so words like
/// `offset` or `by` used as metric names still get constrained.
fn find_selectors(input: &str, tokens: &[Token]) -> Result<Vec<SelectorSite>, RewriteError> {
    let mut sites = Vec::new();
    // Open parentheses and whether each one holds aggregation arguments
    let mut nesting: Vec<(&Token, bool)> = Vec::new();
    let mut position = Position::Operand;
    let mut i = 0;

    let kind_at = |j: usize| tokens.get(j).map(|t| t.kind);
    let word_at = |j: usize| {
        tokens
            .get(j)
            .filter(|t| t.kind == TokenKind::Ident)
            .map(|t| t.text(input).to_ascii_lowercase())
    };

    while i < tokens.len() {
        let tok = &tokens[i];

        match tok.kind {
            TokenKind::Ident if position.wants_operand() => {
                let word = tok.text(input).to_ascii_lowercase();
                let call = kind_at(i + 1) == Some(TokenKind::LeftParen);

                if position == Position::AfterBinary && word == "bool" {
                    i += 1;
                } else if position == Position::AfterBinary
                    && call
                    && matches!(word.as_str(), "on" | "ignoring")
                {
                    i = skip_label_list(tokens, i + 1)?;
                    position = Position::AfterMatching;
                } else if position == Position::AfterMatching
                    && matches!(word.as_str(), "group_left" | "group_right")
                {
                    i = if call { skip_label_list(tokens, i + 1)? } else { i + 1 };
                    position = Position::Operand;
                } else if matches!(word.as_str(), "inf" | "nan") {
                    i += 1;
                    position = Position::Complete;
                } else if AGGREGATORS.contains(&word.as_str())
                    && word_at(i + 1).is_some_and(|w| w == "by" || w == "without")
                    && kind_at(i + 2) == Some(TokenKind::LeftParen)
                {
                    let open = skip_label_list(tokens, i + 2)?;
                    let Some(paren) = tokens.get(open).filter(|t| t.kind == TokenKind::LeftParen)
                    else {
                        return Err(RewriteError::Syntax(
                            "expected aggregation arguments",
                            tokens.get(open).map_or(input.len(), |t| t.span.start),
                        ));
                    };
                    nesting.push((paren, true));
                    i = open + 1;
                    position = Position::Operand;
                } else if call {
                    if MODIFIER_KEYWORDS.contains(&word.as_str()) {
                        return Err(RewriteError::Syntax(
                            "keyword used as a function",
                            tok.span.start,
                        ));
                    }
                    nesting.push((&tokens[i + 1], AGGREGATORS.contains(&word.as_str())));
                    i += 2;
                    position = Position::Operand;
                } else {
                    // Metric name
                    if kind_at(i + 1) == Some(TokenKind::LeftBrace) {
                        let block = parse_matcher_block(input, tokens, i + 1)?;
                        let close = &tokens[block.close];
                        sites.push(SelectorSite {
                            span: tok.span.start..close.span.end,
                            insert_at: close.span.start,
                            mode: block_insertion(block.matchers.is_empty(), block.trailing_comma),
                        });
                        i = block.close + 1;
                    } else {
                        sites.push(SelectorSite {
                            span: tok.span.clone(),
                            insert_at: tok.span.end,
                            mode: Insertion::NewBlock,
                        });
                        i += 1;
                    }
                    position = Position::Complete;
                }
            }
            TokenKind::Ident => {
                let word = tok.text(input).to_ascii_lowercase();

                if BINARY_KEYWORDS.contains(&word.as_str()) {
                    i += 1;
                    position = Position::AfterBinary;
                } else if position == Position::AfterAggregation
                    && matches!(word.as_str(), "by" | "without")
                    && kind_at(i + 1) == Some(TokenKind::LeftParen)
                {
                    i = skip_label_list(tokens, i + 1)?;
                    position = Position::Complete;
                } else if word == "offset" {
                    i = skip_offset(tokens, input, i + 1)?;
                    position = Position::Complete;
                } else {
                    return Err(RewriteError::Syntax("unexpected identifier", tok.span.start));
                }
            }
            TokenKind::LeftBrace if position.wants_operand() => {
                let block = parse_matcher_block(input, tokens, i)?;
                let close = &tokens[block.close];
                sites.push(SelectorSite {
                    span: tok.span.start..close.span.end,
                    insert_at: close.span.start,
                    mode: block_insertion(block.matchers.is_empty(), block.trailing_comma),
                });
                i = block.close + 1;
                position = Position::Complete;
            }
            TokenKind::LeftBrace => {
                return Err(RewriteError::Syntax("unexpected selector", tok.span.start));
            }
            TokenKind::RightBrace => {
                return Err(RewriteError::Unbalanced('}', tok.span.start));
            }
            TokenKind::Number | TokenKind::Str if position.wants_operand() => {
                i += 1;
                position = Position::Complete;
            }
            TokenKind::LeftParen if position.wants_operand() => {
                nesting.push((tok, false));
                i += 1;
                position = Position::Operand;
            }
            TokenKind::RightParen => match nesting.pop() {
                Some((_, aggregation)) => {
                    i += 1;
                    position = if aggregation {
                        Position::AfterAggregation
                    } else {
                        Position::Complete
                    };
                }
                None => return Err(RewriteError::Unbalanced(')', tok.span.start)),
            },
            TokenKind::LeftBracket if !position.wants_operand() => {
                i = skip_range(tokens, i)?;
                position = Position::Complete;
            }
            TokenKind::RightBracket => {
                return Err(RewriteError::Unbalanced(']', tok.span.start));
            }
            TokenKind::Comma if !nesting.is_empty() => {
                i += 1;
                position = Position::Operand;
            }
            TokenKind::At if !position.wants_operand() => {
                i += 1;
                position = Position::Operand;
            }
            TokenKind::Operator if position.wants_operand() => {
                // Unary sign
                i += 1;
                position = Position::Operand;
            }
            TokenKind::Operator | TokenKind::Neq => {
                i += 1;
                position = Position::AfterBinary;
            }
            _ => {
                return Err(RewriteError::Syntax("unexpected token", tok.span.start));
            }
        }
    }

    if let Some((open, _)) = nesting.pop() {
        return Err(RewriteError::Unbalanced('(', open.span.start));
    }
    if position.wants_operand() && !tokens.is_empty() {
        return Err(RewriteError::Syntax("expression ends without operand", input.len()));
    }

    Ok(sites)
}

/// Skip a range or subquery bracket starting at the `[` at `open`; returns
/// the index after the `]`. Only durations and `:` may appear inside.
fn skip_range(tokens: &[Token], open: usize) -> Result<usize, RewriteError> {
    let open_pos = tokens[open].span.start;
    let mut i = open + 1;
    loop {
        let tok = tokens
            .get(i)
            .ok_or(RewriteError::Unbalanced('[', open_pos))?;
        match tok.kind {
            TokenKind::RightBracket => return Ok(i + 1),
            TokenKind::Number | TokenKind::Colon => i += 1,
            _ => {
                return Err(RewriteError::Syntax(
                    "unexpected token in range",
                    tok.span.start,
                ));
            }
        }
    }
}

/// Skip the duration after `offset`, which starts at `at`; returns the
/// index after it.
fn skip_offset(tokens: &[Token], input: &str, at: usize) -> Result<usize, RewriteError> {
    let mut i = at;
    if tokens
        .get(i)
        .is_some_and(|t| t.kind == TokenKind::Operator && t.text(input) == "-")
    {
        i += 1;
    }
    match tokens.get(i) {
        Some(t) if t.kind == TokenKind::Number => Ok(i + 1),
        other => Err(RewriteError::Syntax(
            "expected duration after offset",
            other.map_or(input.len(), |t| t.span.start),
        )),
    }
}

fn block_insertion(empty: bool, trailing_comma: bool) -> Insertion {
    if empty || trailing_comma {
        Insertion::Bare
    } else {
        Insertion::AfterMatcher
    }
}

/// Skip `( label, "label", ... )` starting at the `(` at `open`; returns the
/// index after the `)`.
fn skip_label_list(tokens: &[Token], open: usize) -> Result<usize, RewriteError> {
    let open_pos = tokens[open].span.start;
    let mut i = open + 1;
    let mut expect_label = true;
    loop {
        let tok = tokens
            .get(i)
            .ok_or(RewriteError::Unbalanced('(', open_pos))?;
        match tok.kind {
            TokenKind::RightParen => return Ok(i + 1),
            TokenKind::Ident | TokenKind::Str if expect_label => expect_label = false,
            TokenKind::Comma if !expect_label => expect_label = true,
            _ => {
                return Err(RewriteError::Syntax(
                    "unexpected token in grouping label list",
                    tok.span.start,
                ));
            }
        }
        i += 1;
    }
}
