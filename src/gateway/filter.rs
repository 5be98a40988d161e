//! Query filtering gate
//!
//! Rewrites the tenant's query parameter so every vector selector carries the
//! client's configured label constraints. Identity comes from the
//! authentication gate's resolved identity; only when that gate is off is
//! the trust header read instead.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, Request, StatusCode, Uri, uri::PathAndQuery},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use super::auth::ResolvedIdentity;
use super::response::api_error;
use crate::error::ValidationError;
use crate::promql::{
    Constraint, RewriteError, inject_expression, inject_selector, synthesize_selector,
};
use crate::snapshot::{ClientId, Snapshot};

/// Which parameter a route filters and how its values are shaped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryParam {
    /// Repeated `match[]` series selectors (series, federate)
    SeriesMatch,
    /// A full PromQL expression under `query` (query, `query_range`)
    Expression,
}

impl QueryParam {
    /// Name of the URL parameter
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::SeriesMatch => "match[]",
            Self::Expression => "query",
        }
    }
}

/// A request could not be filtered
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// No identity on the request
    #[error("no client identity on request")]
    MissingIdentity,

    /// Identity has no entry in the match table
    #[error("client {0:?} is not permitted")]
    UnknownClient(String),

    /// A value could not be rewritten safely
    #[error("cannot enforce label constraints on {param}: {source}")]
    Rewrite {
        /// Parameter name
        param: &'static str,
        /// Rewriter detail
        #[source]
        source: RewriteError,
    },

    /// The rewritten URI could not be assembled
    #[error("invalid request URI: {0}")]
    InvalidUri(String),
}

impl IntoResponse for FilterError {
    fn into_response(self) -> Response {
        match self {
            Self::MissingIdentity | Self::UnknownClient(_) => {
                api_error(StatusCode::FORBIDDEN, "forbidden", self.to_string())
            }
            Self::Rewrite { .. } | Self::InvalidUri(_) => {
                api_error(StatusCode::BAD_REQUEST, "bad_data", self.to_string())
            }
        }
    }
}

/// Immutable per-client constraint lists for one configuration generation
#[derive(Debug)]
pub struct MatchTable {
    trust_header: HeaderName,
    constraints: HashMap<ClientId, Vec<Constraint>>,
}

impl MatchTable {
    /// Build the table, parsing every constraint up front.
    pub fn build(snapshot: &Snapshot) -> Result<Self, ValidationError> {
        snapshot.validate()?;

        let trust_header = HeaderName::try_from(snapshot.trust_header.as_str())
            .map_err(|_| ValidationError::InvalidTrustHeader(snapshot.trust_header.clone()))?;

        let mut constraints = HashMap::with_capacity(snapshot.clients.len());
        for (id, spec) in &snapshot.clients {
            let parsed = spec
                .matches
                .iter()
                .map(|source| {
                    Constraint::parse(source).map_err(|e| ValidationError::InvalidConstraint {
                        client: id.clone(),
                        constraint: source.clone(),
                        reason: e.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            debug!(client = %id, constraints = parsed.len(), "Prepared match constraints");
            constraints.insert(id.clone(), parsed);
        }

        Ok(Self {
            trust_header,
            constraints,
        })
    }

    /// Header the identity is read from
    #[must_use]
    pub fn trust_header(&self) -> &HeaderName {
        &self.trust_header
    }

    /// Constraints for `client`, `None` if unknown
    #[must_use]
    pub fn constraints(&self, client: &str) -> Option<&[Constraint]> {
        self.constraints.get(client).map(Vec::as_slice)
    }

    /// Rewrite all values of `param` for `client`.
    pub fn filter(
        &self,
        client: &str,
        param: QueryParam,
        values: &[String],
    ) -> Result<Vec<String>, FilterError> {
        let constraints = self
            .constraints(client)
            .ok_or_else(|| FilterError::UnknownClient(client.to_string()))?;

        if constraints.is_empty() {
            return Ok(values.to_vec());
        }

        let rewrite_err = |source| FilterError::Rewrite {
            param: param.name(),
            source,
        };

        match param {
            QueryParam::SeriesMatch if values.is_empty() => {
                Ok(vec![synthesize_selector(constraints)])
            }
            QueryParam::SeriesMatch => values
                .iter()
                .map(|v| inject_selector(v, constraints).map_err(rewrite_err))
                .collect(),
            QueryParam::Expression => values
                .iter()
                .map(|v| inject_expression(v, constraints).map_err(rewrite_err))
                .collect(),
        }
    }
}

/// Owns the live [`MatchTable`] and swaps it on reload.
pub struct FilterManager {
    table: RwLock<Arc<MatchTable>>,
}

impl FilterManager {
    /// Create a manager serving `table`
    #[must_use]
    pub fn new(table: MatchTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    /// Build a table from `snapshot` without publishing it
    pub fn build(snapshot: &Snapshot) -> Result<MatchTable, ValidationError> {
        MatchTable::build(snapshot)
    }

    /// The table current at the time of the call
    #[must_use]
    pub fn current(&self) -> Arc<MatchTable> {
        Arc::clone(&self.table.read())
    }

    /// Atomically replace the whole table
    pub fn publish(&self, table: MatchTable) {
        *self.table.write() = Arc::new(table);
    }

    /// Rewrite against the current table
    pub fn filter(
        &self,
        client: &str,
        param: QueryParam,
        values: &[String],
    ) -> Result<Vec<String>, FilterError> {
        self.current().filter(client, param, values)
    }
}

/// Middleware state: the manager plus the parameter this route filters
#[derive(Clone)]
pub struct FilterGate {
    /// Live match table owner
    pub filter: Arc<FilterManager>,
    /// Parameter rewritten on this route
    pub param: QueryParam,
}

/// Query filtering middleware
pub async fn filter_middleware(
    State(gate): State<FilterGate>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let table = gate.filter.current();

    match rewrite_request(&table, gate.param, &mut request) {
        Ok(client) => {
            debug!(client = %client, param = gate.param.name(), "Filtered query");
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %request.uri().path(), error = %e, "Rejected query");
            e.into_response()
        }
    }
}

/// Rewrite `request`'s URI in place; returns the client it was filtered for.
fn rewrite_request(
    table: &MatchTable,
    param: QueryParam,
    request: &mut Request<Body>,
) -> Result<String, FilterError> {
    // The header name may differ between the live auth and match tables
    // while a reload is being published.
    let client = match request.extensions().get::<ResolvedIdentity>() {
        Some(identity) => identity.client.as_str().to_string(),
        None => request
            .headers()
            .get(table.trust_header())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(FilterError::MissingIdentity)?
            .to_string(),
    };

    let uri = request.uri();
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .into_owned()
        .collect();

    let (targets, mut others): (Vec<_>, Vec<_>) =
        pairs.into_iter().partition(|(k, _)| k == param.name());
    let values: Vec<String> = targets.into_iter().map(|(_, v)| v).collect();

    let rewritten = table.filter(&client, param, &values)?;
    others.extend(rewritten.into_iter().map(|v| (param.name().to_string(), v)));

    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(&others)
        .finish();
    let path_and_query = if query.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{query}", uri.path())
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        PathAndQuery::try_from(path_and_query).map_err(|e| FilterError::InvalidUri(e.to_string()))?,
    );
    *request.uri_mut() = Uri::from_parts(parts).map_err(|e| FilterError::InvalidUri(e.to_string()))?;

    Ok(client)
}
