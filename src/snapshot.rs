//! Configuration snapshot consumed by the identification and enforcement core.
//!
//! A [`Snapshot`] is produced by a [`SnapshotSource`](crate::reload::SnapshotSource)
//! once at startup and again on every reload. It is immutable; both the
//! credential table and the match table are built from it wholesale.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Default trust header name
pub const DEFAULT_TRUST_HEADER: &str = "X-Prom-Liver-Id";

/// Opaque tenant identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Borrow the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Authentication schemes a client may use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientAuth {
    /// Client may self-assert its ID through the trust header
    pub header: bool,
    /// Raw base64 `user:password` values accepted for HTTP Basic
    pub basic: Vec<String>,
    /// Bearer tokens
    pub bearer: Vec<String>,
}

/// Everything the core needs to know about one client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSpec {
    /// Accepted credentials
    pub auth: ClientAuth,
    /// Label constraints ANDed into every query; empty means unrestricted
    pub matches: Vec<String>,
}

impl ClientSpec {
    /// Allow header self-assertion
    #[must_use]
    pub fn header_trust(mut self) -> Self {
        self.auth.header = true;
        self
    }

    /// Add a raw base64 Basic credential
    #[must_use]
    pub fn basic(mut self, base64: impl Into<String>) -> Self {
        self.auth.basic.push(base64.into());
        self
    }

    /// Add a Bearer token
    #[must_use]
    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.auth.bearer.push(token.into());
        self
    }

    /// Add a match constraint
    #[must_use]
    pub fn matching(mut self, constraint: impl Into<String>) -> Self {
        self.matches.push(constraint.into());
        self
    }
}

/// Validated, immutable configuration snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Name of the header carrying asserted or resolved identity
    pub trust_header: String,
    /// Clients ordered by ID so table builds are deterministic
    pub clients: BTreeMap<ClientId, ClientSpec>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new(DEFAULT_TRUST_HEADER)
    }
}

impl Snapshot {
    /// Create an empty snapshot using `trust_header`
    #[must_use]
    pub fn new(trust_header: impl Into<String>) -> Self {
        Self {
            trust_header: trust_header.into(),
            clients: BTreeMap::new(),
        }
    }

    /// Add or replace a client
    #[must_use]
    pub fn with_client(mut self, id: impl Into<ClientId>, spec: ClientSpec) -> Self {
        self.clients.insert(id.into(), spec);
        self
    }

    /// Checks that hold regardless of which table is being built.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.clients.is_empty() {
            return Err(ValidationError::EmptyClientSet);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_fails_validation() {
        assert_eq!(
            Snapshot::default().validate(),
            Err(ValidationError::EmptyClientSet)
        );
    }

    #[test]
    fn builder_accumulates_credentials() {
        let snap = Snapshot::default().with_client(
            "teamA",
            ClientSpec::default()
                .bearer("tok-A")
                .bearer("tok-A2")
                .basic("dXNlcjpwYXNz")
                .matching(r#"team="a""#),
        );
        let spec = &snap.clients["teamA"];
        assert_eq!(spec.auth.bearer, vec!["tok-A", "tok-A2"]);
        assert_eq!(spec.auth.basic, vec!["dXNlcjpwYXNz"]);
        assert!(!spec.auth.header);
        assert_eq!(spec.matches.len(), 1);
        assert!(snap.validate().is_ok());
    }
}
