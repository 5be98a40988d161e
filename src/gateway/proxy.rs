//! Upstream forwarding
//!
//! Sends an already-filtered request to the Prometheus server and streams the
//! response back unchanged.

use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use reqwest::Client;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::response::api_error;
use crate::Result;

/// Headers that describe a single connection and never cross a proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Upstream could not answer
#[derive(Error, Debug)]
pub enum ForwardError {
    /// Connection or protocol failure
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// No answer within the upstream timeout
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        api_error(status, "unavailable", self.to_string())
    }
}

/// Final stage of the tenant pipeline
#[async_trait]
pub trait Forward: Send + Sync {
    /// Forward `request` and return the upstream's answer
    async fn forward(&self, request: Request<Body>) -> std::result::Result<Response, ForwardError>;
}

/// Forwards to a Prometheus server over HTTP
pub struct HttpForwarder {
    client: Client,
    upstream: Url,
    timeout: Duration,
}

impl HttpForwarder {
    /// Create a forwarder for `upstream` with a per-request `timeout`
    pub fn new(upstream: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            upstream,
            timeout,
        })
    }

    /// Join the upstream path prefix with the request path and query.
    #[must_use]
    pub fn target_url(&self, uri: &Uri) -> Url {
        let mut url = self.upstream.clone();
        let prefix = self.upstream.path().trim_end_matches('/');
        url.set_path(&format!("{prefix}{}", uri.path()));
        url.set_query(uri.query());
        url
    }
}

#[async_trait]
impl Forward for HttpForwarder {
    async fn forward(&self, request: Request<Body>) -> std::result::Result<Response, ForwardError> {
        let target = self.target_url(request.uri());
        let headers = upstream_headers(request.headers(), request.uri());
        debug!(method = %request.method(), url = %target, "Forwarding to upstream");

        let upstream = self
            .client
            .request(request.method().clone(), target)
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ForwardError::Timeout(self.timeout)
                } else {
                    ForwardError::Upstream(e.to_string())
                }
            })?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(out) = response.headers_mut() {
            copy_headers(upstream.headers(), out);
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| ForwardError::Upstream(e.to_string()))
    }
}

/// Request headers as sent upstream: no hop-by-hop, no credentials, no Host.
///
/// `X-Forwarded-Host` always reflects the host this request was sent to,
/// taken from `Host` or, for HTTP/2, the URI authority.
fn upstream_headers(incoming: &HeaderMap, uri: &Uri) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(incoming.len());
    copy_headers(incoming, &mut out);
    out.remove(header::AUTHORIZATION);
    out.remove(X_FORWARDED_HOST);

    let host = out.remove(header::HOST).or_else(|| {
        uri.authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
    });
    if let Some(host) = host {
        out.insert(X_FORWARDED_HOST, host);
    }
    out
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap<HeaderValue>) {
    let named_in_connection: Vec<String> = from
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .collect();

    for (name, value) in from {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || named_in_connection.iter().any(|n| n == lower) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}
