//! End-to-end tenant pipeline tests
//!
//! Drives the tenant router without a socket and records what reaches the
//! forwarding stage:
//! - identification by bearer, basic and trusted header
//! - constraint injection into `query` and `match[]`
//! - fail-closed rejections never reaching upstream

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

use prom_tenant_gateway::gateway::{
    AppState, AuthManager, FilterManager, Forward, ForwardError, create_router,
};
use prom_tenant_gateway::snapshot::{ClientSpec, Snapshot};

const ID_HEADER: &str = "X-Prom-Liver-Id";

/// Forwarding stage that records requests instead of dialing upstream
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(Uri, HeaderMap)>>,
    fail: bool,
}

impl Recorder {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn count(&self) -> usize {
        self.seen.lock().len()
    }

    fn last(&self) -> (Uri, HeaderMap) {
        self.seen.lock().last().cloned().expect("nothing was forwarded")
    }
}

#[async_trait]
impl Forward for Recorder {
    async fn forward(&self, request: Request<Body>) -> Result<Response, ForwardError> {
        self.seen
            .lock()
            .push((request.uri().clone(), request.headers().clone()));
        if self.fail {
            return Err(ForwardError::Upstream("connection refused".to_string()));
        }
        Ok((StatusCode::OK, r#"{"status":"success","data":[]}"#).into_response())
    }
}

fn snapshot() -> Snapshot {
    snapshot_with_header(ID_HEADER)
}

fn snapshot_with_header(id_header: &str) -> Snapshot {
    Snapshot::new(id_header)
        .with_client(
            "teamA",
            ClientSpec::default()
                .bearer("tok-A")
                .basic("YTpwYXNz")
                .matching(r#"team="a""#),
        )
        .with_client(
            "teamB",
            ClientSpec::default()
                .bearer("tok-B")
                .matching(r#"team="b""#)
                .matching(r#"env=~"prod|staging""#),
        )
        .with_client(
            "proxied",
            ClientSpec::default()
                .header_trust()
                .matching(r#"team="p""#),
        )
        .with_client("ops", ClientSpec::default().bearer("tok-ops"))
}

struct Options {
    authentication: bool,
    api: bool,
    federate: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            authentication: true,
            api: true,
            federate: true,
        }
    }
}

fn router(recorder: Arc<Recorder>, options: Options) -> Router {
    let snapshot = snapshot();
    create_router(Arc::new(AppState {
        auth: Arc::new(AuthManager::new(AuthManager::build(&snapshot).unwrap())),
        filter: Arc::new(FilterManager::new(FilterManager::build(&snapshot).unwrap())),
        forwarder: recorder,
        authentication: options.authentication,
        api_enabled: options.api,
        federate_enabled: options.federate,
        timeout: Duration::from_secs(5),
    }))
}

fn uri(path: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return path.to_string();
    }
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();
    format!("{path}?{query}")
}

fn get(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).unwrap()
}

fn params(uri: &Uri, name: &str) -> Vec<String> {
    url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .into_owned()
        .filter(|(k, _)| k == name)
        .map(|(_, v)| v)
        .collect()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// A caller-set header under a stale trust header name cannot replace the
/// authenticated identity
#[tokio::test]
async fn test_renamed_trust_header_cannot_spoof_identity() {
    let recorder = Arc::new(Recorder::default());
    let snapshot = snapshot();
    let auth = Arc::new(AuthManager::new(AuthManager::build(&snapshot).unwrap()));
    let app = create_router(Arc::new(AppState {
        auth: Arc::clone(&auth),
        filter: Arc::new(FilterManager::new(FilterManager::build(&snapshot).unwrap())),
        forwarder: Arc::clone(&recorder) as Arc<dyn Forward>,
        authentication: true,
        api_enabled: true,
        federate_enabled: true,
        timeout: Duration::from_secs(5),
    }));

    // Only the credential table has moved to the new header name so far
    auth.publish(AuthManager::build(&snapshot_with_header("X-Tenant")).unwrap());

    let response = app
        .oneshot(get(
            &uri("/api/v1/query", &[("query", "up")]),
            &[("authorization", "Bearer tok-A"), (ID_HEADER, "ops")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let (forwarded, headers) = recorder.last();
    assert_eq!(params(&forwarded, "query"), vec![r#"up{team="a"}"#]);
    assert_eq!(headers["x-tenant"], "teamA");
}

/// Bearer client querying `up` gets its constraint injected
#[tokio::test]
async fn test_bearer_query_is_constrained() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get(
            &uri("/api/v1/query", &[("query", "up")]),
            &[("authorization", "Bearer tok-A")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let (forwarded, headers) = recorder.last();
    assert_eq!(forwarded.path(), "/api/v1/query");
    assert_eq!(params(&forwarded, "query"), vec![r#"up{team="a"}"#]);
    assert_eq!(headers[ID_HEADER], "teamA");
}

/// Existing matchers are kept and the constraint joins the same braces
#[tokio::test]
async fn test_constraint_is_and_merged_into_existing_selector() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get(
            &uri(
                "/api/v1/query_range",
                &[
                    ("query", r#"up{instance="x"}"#),
                    ("start", "1700000000"),
                    ("end", "1700003600"),
                    ("step", "60"),
                ],
            ),
            &[("authorization", "Bearer tok-A")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let (forwarded, _) = recorder.last();
    assert_eq!(params(&forwarded, "query"), vec![r#"up{instance="x",team="a"}"#]);
    assert_eq!(params(&forwarded, "step"), vec!["60"]);
}

/// Every selector in a compound expression is constrained
#[tokio::test]
async fn test_every_selector_in_expression_is_constrained() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let query = r#"sum by (job) (rate(http_requests_total{code="500"}[5m])) / on(job) sum by (job) (rate(http_requests_total[5m]))"#;
    let response = app
        .oneshot(get(
            &uri("/api/v1/query", &[("query", query)]),
            &[("authorization", "Bearer tok-B")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let (forwarded, _) = recorder.last();
    assert_eq!(
        params(&forwarded, "query"),
        vec![
            r#"sum by (job) (rate(http_requests_total{code="500",team="b",env=~"prod|staging"}[5m])) / on(job) sum by (job) (rate(http_requests_total{team="b",env=~"prod|staging"}[5m]))"#
        ]
    );
}

/// Unknown bearer token is rejected before anything is forwarded
#[tokio::test]
async fn test_unknown_token_is_unauthorized() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get(
            &uri("/api/v1/query", &[("query", "up")]),
            &[("authorization", "Bearer tok-Z")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    let body = json_body(response).await;
    assert_eq!(body["status"], "error");
    assert_eq!(recorder.count(), 0);
}

/// No credentials at all is a 401 too
#[tokio::test]
async fn test_missing_credentials_is_unauthorized() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get(&uri("/federate", &[("match[]", "up")]), &[]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(recorder.count(), 0);
}

/// A caller cannot claim another client's ID through the trust header
#[tokio::test]
async fn test_trust_header_is_overwritten_with_resolved_identity() {
    // GIVEN teamB's token and a forged trust header naming teamA
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    // WHEN the request passes the gates
    let response = app
        .oneshot(get(
            &uri("/api/v1/query", &[("query", "up")]),
            &[("authorization", "Bearer tok-B"), (ID_HEADER, "teamA")],
        ))
        .await
        .unwrap();

    // THEN teamB's identity and constraints are what reach upstream
    assert_eq!(response.status(), StatusCode::OK);
    let (forwarded, headers) = recorder.last();
    assert_eq!(headers[ID_HEADER], "teamB");
    assert_eq!(
        params(&forwarded, "query"),
        vec![r#"up{team="b",env=~"prod|staging"}"#]
    );
}

/// Whitelisted clients may self-assert through the trust header
#[tokio::test]
async fn test_whitelisted_header_identity() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get(
            &uri("/api/v1/series", &[("match[]", "up")]),
            &[(ID_HEADER, "proxied")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let (forwarded, _) = recorder.last();
    assert_eq!(params(&forwarded, "match[]"), vec![r#"up{team="p"}"#]);
}

/// A non-whitelisted ID in the trust header is not a credential
#[tokio::test]
async fn test_non_whitelisted_header_identity_is_unauthorized() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get(
            &uri("/api/v1/query", &[("query", "up")]),
            &[(ID_HEADER, "teamA")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(recorder.count(), 0);
}

/// Basic credentials are compared as the raw base64 value
#[tokio::test]
async fn test_basic_auth_by_raw_base64() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .clone()
        .oneshot(get(
            &uri("/api/v1/query", &[("query", "up")]),
            &[("authorization", "Basic YTpwYXNz")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(recorder.last().1[ID_HEADER], "teamA");

    // Same user:pass, different base64 padding/encoding is not accepted
    let response = app
        .oneshot(get(
            &uri("/api/v1/query", &[("query", "up")]),
            &[("authorization", "Basic YTpwYXNz=")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(recorder.count(), 1);
}

/// Every match[] value is constrained
#[tokio::test]
async fn test_series_match_values_are_each_constrained() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get(
            &uri(
                "/api/v1/series",
                &[("match[]", "up"), ("match[]", r#"{__name__=~"node_.*"}"#)],
            ),
            &[("authorization", "Bearer tok-A")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let (forwarded, _) = recorder.last();
    assert_eq!(
        params(&forwarded, "match[]"),
        vec![r#"up{team="a"}"#, r#"{__name__=~"node_.*",team="a"}"#]
    );
}

/// Federate without match[] gets a selector made of the constraint alone
#[tokio::test]
async fn test_federate_without_match_is_synthesized() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get("/federate", &[("authorization", "Bearer tok-B")]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let (forwarded, _) = recorder.last();
    assert_eq!(
        params(&forwarded, "match[]"),
        vec![r#"{team="b",env=~"prod|staging"}"#]
    );
}

/// Unrestricted clients are forwarded unchanged
#[tokio::test]
async fn test_unrestricted_client_passes_through() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get(
            &uri("/api/v1/query", &[("query", "count(up) by (team)")]),
            &[("authorization", "Bearer tok-ops")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(params(&recorder.last().0, "query"), vec!["count(up) by (team)"]);
}

/// A query the rewriter cannot handle safely is rejected, not forwarded
#[tokio::test]
async fn test_unparsable_query_is_bad_request() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get(
            &uri("/api/v1/query", &[("query", r#"up{team="a"} or up{"#)]),
            &[("authorization", "Bearer tok-A")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["errorType"], "bad_data");
    assert_eq!(recorder.count(), 0);
}

/// match[] values must be plain selectors
#[tokio::test]
async fn test_match_expression_is_bad_request() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get(
            &uri("/api/v1/series", &[("match[]", "up or vector(1)")]),
            &[("authorization", "Bearer tok-A")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(recorder.count(), 0);
}

/// Only GET reaches tenant routes
#[tokio::test]
async fn test_non_get_is_rejected() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/query")
        .header("authorization", "Bearer tok-A")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("query=up"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let request = Request::builder()
        .method("HEAD")
        .uri("/api/v1/query?query=up")
        .header("authorization", "Bearer tok-A")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    assert_eq!(recorder.count(), 0);
}

/// Unknown paths are 404 even without credentials
#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get("/api/v1/labels", &[("authorization", "Bearer tok-A")]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(recorder.count(), 0);
}

/// Disabled route groups are not served
#[tokio::test]
async fn test_route_toggles() {
    let recorder = Arc::new(Recorder::default());
    let app = router(
        Arc::clone(&recorder),
        Options {
            federate: false,
            ..Options::default()
        },
    );

    let response = app
        .clone()
        .oneshot(get("/federate", &[("authorization", "Bearer tok-A")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let app_only_federate = router(
        Arc::clone(&recorder),
        Options {
            api: false,
            ..Options::default()
        },
    );
    let response = app_only_federate
        .oneshot(get(
            &uri("/api/v1/query", &[("query", "up")]),
            &[("authorization", "Bearer tok-A")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(recorder.count(), 0);
}

/// Without authentication the trust header is taken as sent, and the
/// filter still fails closed
#[tokio::test]
async fn test_authentication_disabled() {
    let recorder = Arc::new(Recorder::default());
    let app = router(
        Arc::clone(&recorder),
        Options {
            authentication: false,
            ..Options::default()
        },
    );

    let response = app
        .clone()
        .oneshot(get(
            &uri("/api/v1/query", &[("query", "up")]),
            &[(ID_HEADER, "teamA")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(params(&recorder.last().0, "query"), vec![r#"up{team="a"}"#]);

    let response = app
        .clone()
        .oneshot(get(
            &uri("/api/v1/query", &[("query", "up")]),
            &[(ID_HEADER, "nobody")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(get(&uri("/api/v1/query", &[("query", "up")]), &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(recorder.count(), 1);
}

/// Upstream failures surface as 502 after the request was forwarded once
#[tokio::test]
async fn test_upstream_failure_is_bad_gateway() {
    let recorder = Arc::new(Recorder::failing());
    let app = router(Arc::clone(&recorder), Options::default());

    let response = app
        .oneshot(get(
            &uri("/api/v1/query", &[("query", "up")]),
            &[("authorization", "Bearer tok-A")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(recorder.count(), 1);
}

/// Presenting one client's credential never resolves to another client
#[tokio::test]
async fn test_credentials_resolve_to_their_own_client() {
    let recorder = Arc::new(Recorder::default());
    let app = router(Arc::clone(&recorder), Options::default());

    let expected: HashMap<&str, &str> =
        [("tok-A", "teamA"), ("tok-B", "teamB"), ("tok-ops", "ops")].into();
    for (token, client) in &expected {
        let authorization = format!("Bearer {token}");
        let response = app
            .clone()
            .oneshot(get(
                &uri("/api/v1/query", &[("query", "up")]),
                &[("authorization", authorization.as_str())],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(recorder.last().1[ID_HEADER], *client);
    }
}
