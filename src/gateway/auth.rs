//! Authentication gate
//!
//! Resolves every tenant request to exactly one [`ClientId`], trying in order:
//! - the trust header, for clients whitelisted to self-assert
//! - HTTP Basic, compared as the raw transmitted base64 value
//! - Bearer token
//!
//! On success the trust header of the downstream request is overwritten with
//! the resolved ID, so later stages see a single identity channel.
//!
//! The trust-header branch must only be enabled for clients behind a
//! component that authenticates callers and sets the header itself. Exposed
//! directly to untrusted callers, anyone can claim a whitelisted ID.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode,
        header::{AUTHORIZATION, WWW_AUTHENTICATE},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, error};

use super::response::api_error;
use crate::error::ValidationError;
use crate::snapshot::{ClientId, Snapshot};

/// Which credential resolved the identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// Whitelisted self-assertion via the trust header
    HeaderTrust,
    /// HTTP Basic
    Basic,
    /// Bearer token
    Bearer,
}

/// Identity attached to an authenticated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Resolved tenant
    pub client: ClientId,
    /// Scheme that matched
    pub scheme: AuthScheme,
}

/// No credential on the request matched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Neither trust header nor `Authorization` was present
    #[error("missing credentials")]
    MissingCredentials,
    /// Credentials were present but none matched
    #[error("invalid credentials")]
    InvalidCredentials,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let mut response = api_error(StatusCode::UNAUTHORIZED, "unauthorized", self.to_string());
        response.headers_mut().insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"prometheus\", Bearer"),
        );
        response
    }
}

/// Immutable credential lookup tables for one configuration generation
#[derive(Debug)]
pub struct CredentialTable {
    trust_header: HeaderName,
    header_trusted: HashSet<ClientId>,
    basic: HashMap<String, ClientId>,
    bearer: HashMap<String, ClientId>,
}

impl CredentialTable {
    /// Build the tables, rejecting any credential shared by two clients.
    pub fn build(snapshot: &Snapshot) -> Result<Self, ValidationError> {
        snapshot.validate()?;

        let trust_header = HeaderName::try_from(snapshot.trust_header.as_str())
            .map_err(|_| ValidationError::InvalidTrustHeader(snapshot.trust_header.clone()))?;

        let mut header_trusted = HashSet::new();
        let mut basic: HashMap<String, ClientId> = HashMap::new();
        let mut bearer: HashMap<String, ClientId> = HashMap::new();

        for (id, spec) in &snapshot.clients {
            if HeaderValue::from_str(id.as_str()).is_err() {
                return Err(ValidationError::InvalidClientId(id.clone()));
            }

            if spec.auth.header {
                header_trusted.insert(id.clone());
                debug!(client = %id, auth = "header", "Prepared credentials");
            }

            for value in &spec.auth.basic {
                match basic.get(value) {
                    Some(existing) if existing != id => {
                        return Err(ValidationError::DuplicateBasic {
                            existing: existing.clone(),
                            current: id.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        basic.insert(value.clone(), id.clone());
                    }
                }
            }

            for token in &spec.auth.bearer {
                match bearer.get(token) {
                    Some(existing) if existing != id => {
                        return Err(ValidationError::DuplicateBearer {
                            existing: existing.clone(),
                            current: id.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        bearer.insert(token.clone(), id.clone());
                    }
                }
            }

            debug!(
                client = %id,
                basic = spec.auth.basic.len(),
                bearer = spec.auth.bearer.len(),
                "Prepared credentials"
            );
        }

        Ok(Self {
            trust_header,
            header_trusted,
            basic,
            bearer,
        })
    }

    /// Header carrying asserted or resolved identity
    #[must_use]
    pub fn trust_header(&self) -> &HeaderName {
        &self.trust_header
    }

    /// Resolve a request's headers to a client, first match wins.
    pub fn identify(&self, headers: &HeaderMap) -> Result<ResolvedIdentity, AuthError> {
        let asserted = headers.get(&self.trust_header);
        if let Some(id) = asserted
            .and_then(|v| v.to_str().ok())
            .and_then(|v| self.header_trusted.get(v))
        {
            return Ok(ResolvedIdentity {
                client: id.clone(),
                scheme: AuthScheme::HeaderTrust,
            });
        }

        if let Some(value) = authorization(headers, "Basic") {
            return self
                .basic
                .get(value)
                .map(|id| ResolvedIdentity {
                    client: id.clone(),
                    scheme: AuthScheme::Basic,
                })
                .ok_or(AuthError::InvalidCredentials);
        }

        if let Some(token) = authorization(headers, "Bearer") {
            return self
                .bearer
                .get(token)
                .map(|id| ResolvedIdentity {
                    client: id.clone(),
                    scheme: AuthScheme::Bearer,
                })
                .ok_or(AuthError::InvalidCredentials);
        }

        if asserted.is_some() || headers.contains_key(AUTHORIZATION) {
            Err(AuthError::InvalidCredentials)
        } else {
            Err(AuthError::MissingCredentials)
        }
    }
}

/// Credentials following `scheme` in the `Authorization` header
fn authorization<'a>(headers: &'a HeaderMap, scheme: &str) -> Option<&'a str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (given, credentials) = value.split_once(' ')?;
    given
        .eq_ignore_ascii_case(scheme)
        .then(|| credentials.trim())
        .filter(|c| !c.is_empty())
}

/// Owns the live [`CredentialTable`] and swaps it on reload.
pub struct AuthManager {
    table: RwLock<Arc<CredentialTable>>,
}

impl AuthManager {
    /// Create a manager serving `table`
    #[must_use]
    pub fn new(table: CredentialTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    /// Build a table from `snapshot` without publishing it
    pub fn build(snapshot: &Snapshot) -> Result<CredentialTable, ValidationError> {
        CredentialTable::build(snapshot)
    }

    /// The table current at the time of the call
    #[must_use]
    pub fn current(&self) -> Arc<CredentialTable> {
        Arc::clone(&self.table.read())
    }

    /// Atomically replace the whole table
    pub fn publish(&self, table: CredentialTable) {
        *self.table.write() = Arc::new(table);
    }

    /// Resolve against the current table
    pub fn identify(&self, headers: &HeaderMap) -> Result<ResolvedIdentity, AuthError> {
        self.current().identify(headers)
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    State(auth): State<Arc<AuthManager>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let table = auth.current();
    let path = request.uri().path().to_string();

    let identity = match table.identify(request.headers()) {
        Ok(identity) => identity,
        Err(e) => {
            debug!(path = %path, reason = %e, "Rejected unauthenticated request");
            return e.into_response();
        }
    };

    // Validated at build time; a failure here means the table is corrupt.
    let Ok(value) = HeaderValue::from_str(identity.client.as_str()) else {
        error!(client = %identity.client, "Resolved client ID is not a valid header value");
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "cannot propagate identity",
        );
    };

    debug!(client = %identity.client, scheme = ?identity.scheme, path = %path, "Authenticated request");
    request
        .headers_mut()
        .insert(table.trust_header().clone(), value);
    request.extensions_mut().insert(identity);
    next.run(request).await
}
