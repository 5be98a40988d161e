//! Label-constraint injection into PromQL.
//!
//! The rewriter is deliberately conservative. It tokenizes the whole
//! expression, classifies every identifier, and only then splices the
//! constraint terms into each vector selector's brace block. Anything it
//! cannot classify is rejected rather than forwarded unfiltered.
//!
//! ```
//! use prom_tenant_gateway::promql::{Constraint, inject_expression};
//!
//! let team = Constraint::parse(r#"team="a""#).unwrap();
//! let out = inject_expression(r#"up{instance="x"}"#, &[team]).unwrap();
//! assert_eq!(out, r#"up{instance="x",team="a"}"#);
//! ```

mod lexer;
mod matcher;
mod rewrite;

use thiserror::Error;

pub use matcher::{Constraint, LabelMatcher};
pub use rewrite::{inject_expression, inject_selector, synthesize_selector};

/// Why a query or constraint could not be rewritten safely
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    /// A byte outside the supported grammar
    #[error("unexpected character {ch:?} at position {pos}")]
    UnexpectedChar {
        /// Byte offset
        pos: usize,
        /// Offending character
        ch: char,
    },

    /// String literal without closing quote
    #[error("unterminated string starting at position {0}")]
    UnterminatedString(usize),

    /// Bracket without partner
    #[error("unbalanced {0:?} at position {1}")]
    Unbalanced(char, usize),

    /// Structurally unexpected token
    #[error("{0} at position {1}")]
    Syntax(&'static str, usize),

    /// A `match[]` value that is not a single series selector
    #[error("expected a single series selector, got {0:?}")]
    NotASeriesSelector(String),
}
