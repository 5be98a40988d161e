//! Error types for the tenant gateway

use std::io;

use thiserror::Error;

use crate::snapshot::ClientId;

/// Result type alias for the tenant gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors outside the per-request path
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (file missing, undecodable, inconsistent)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configuration snapshot failed table validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A configuration snapshot cannot be turned into credential or match tables.
///
/// Fatal at startup; at reload time the reload is aborted and the live tables
/// stay in place.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The snapshot defines no clients at all
    #[error("the set of clients is empty")]
    EmptyClientSet,

    /// One base64 Basic credential is claimed by two clients
    #[error("duplicate basic base64 value: current ID={current}, new ID={existing}")]
    DuplicateBasic {
        /// Client that already owns the credential
        existing: ClientId,
        /// Client that tried to claim it again
        current: ClientId,
    },

    /// One Bearer token is claimed by two clients
    #[error("duplicate bearer token value: current ID={current}, new ID={existing}")]
    DuplicateBearer {
        /// Client that already owns the token
        existing: ClientId,
        /// Client that tried to claim it again
        current: ClientId,
    },

    /// A match constraint is not a well-formed label matcher list
    #[error("invalid match constraint {constraint:?} for client {client}: {reason}")]
    InvalidConstraint {
        /// Owning client
        client: ClientId,
        /// The constraint as configured
        constraint: String,
        /// Parser detail
        reason: String,
    },

    /// A client ID cannot be carried in the trust header
    #[error("client ID {0:?} is not a valid header value")]
    InvalidClientId(ClientId),

    /// The trust header name is not a valid HTTP header name
    #[error("invalid id header name {0:?}")]
    InvalidTrustHeader(String),
}
