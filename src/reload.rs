//! Configuration reload.
//!
//! A reload loads a fresh [`Snapshot`], builds a new credential table and a new
//! match table from it, and publishes both into the live managers. Either
//! build failing aborts the reload and leaves both managers untouched.
//!
//! At most one reload runs at a time. Synchronous callers ([`ReloadCoordinator::reload`])
//! arriving while one is in flight wait for it and receive its outcome;
//! asynchronous triggers ([`ReloadCoordinator::trigger`]) are logged and dropped.
//!
//! # Limitations
//!
//! Listener settings (`server.host`, `server.port`, `server.admin-port`) and
//! route toggles are read once at startup. A reload only replaces client
//! credentials, match constraints and the trust header.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::error::ValidationError;
use crate::gateway::{AuthManager, FilterManager};
use crate::snapshot::Snapshot;

// ============================================================================
// Public types
// ============================================================================

/// Produces configuration snapshots on demand
///
/// Called from a blocking thread; implementations may do file I/O.
pub trait SnapshotSource: Send + Sync {
    /// Load the current configuration
    fn load(&self) -> crate::Result<Snapshot>;
}

/// Outcome of a successful reload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Number of successful reloads since startup, this one included
    pub generation: u64,
    /// Clients in the published tables
    pub clients: usize,
}

/// A reload was aborted; the previous tables stay live
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReloadError {
    /// The snapshot could not be loaded
    #[error("{0}")]
    Load(String),

    /// The snapshot was loaded but a table build rejected it
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The reload task itself failed
    #[error("reload task aborted: {0}")]
    Aborted(String),
}

type InFlight = Shared<BoxFuture<'static, Result<ReloadSummary, ReloadError>>>;

// ============================================================================
// Coordinator
// ============================================================================

/// Serializes reloads and republishes both tables
pub struct ReloadCoordinator {
    source: Arc<dyn SnapshotSource>,
    auth: Arc<AuthManager>,
    filter: Arc<FilterManager>,
    in_flight: Mutex<Option<InFlight>>,
    generation: AtomicU64,
}

impl ReloadCoordinator {
    /// Create a coordinator publishing into `auth` and `filter`
    #[must_use]
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        auth: Arc<AuthManager>,
        filter: Arc<FilterManager>,
    ) -> Self {
        Self {
            source,
            auth,
            filter,
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Reload and wait for the outcome.
    ///
    /// Joins the in-flight reload if there is one.
    pub async fn reload(self: &Arc<Self>) -> Result<ReloadSummary, ReloadError> {
        let in_flight = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(running) => running.clone(),
                None => slot.insert(self.start()).clone(),
            }
        };
        in_flight.await
    }

    /// Start a reload in the background unless one is already running.
    ///
    /// Returns `false` if the trigger was dropped.
    pub fn trigger(self: &Arc<Self>) -> bool {
        let mut slot = self.in_flight.lock();
        if slot.is_some() {
            warn!("Reload already in progress, dropping trigger");
            return false;
        }
        *slot = Some(self.start());
        true
    }

    /// Whether a reload is currently running
    #[must_use]
    pub fn is_reloading(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Successful reloads since startup
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Spawn the reload task. Must be called with the slot locked.
    fn start(self: &Arc<Self>) -> InFlight {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _slot = ClearOnDrop(&this.in_flight);
            this.run_once().await
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(ReloadError::Aborted(e.to_string())))
        }
        .boxed()
        .shared()
    }

    async fn run_once(&self) -> Result<ReloadSummary, ReloadError> {
        info!("Reloading configuration");

        let source = Arc::clone(&self.source);
        let outcome = match tokio::task::spawn_blocking(move || source.load()).await {
            Ok(Ok(snapshot)) => self.apply(&snapshot),
            Ok(Err(e)) => Err(ReloadError::Load(e.to_string())),
            Err(e) => Err(ReloadError::Aborted(e.to_string())),
        };

        match &outcome {
            Ok(summary) => info!(
                generation = summary.generation,
                clients = summary.clients,
                "Configuration reloaded"
            ),
            Err(e) => error!(error = %e, "Configuration reload failed, keeping previous tables"),
        }
        outcome
    }

    /// Build both tables, then publish both. Nothing is published unless
    /// both builds succeed.
    fn apply(&self, snapshot: &Snapshot) -> Result<ReloadSummary, ReloadError> {
        let credentials = AuthManager::build(snapshot)?;
        let matches = FilterManager::build(snapshot)?;

        self.auth.publish(credentials);
        self.filter.publish(matches);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(ReloadSummary {
            generation,
            clients: snapshot.clients.len(),
        })
    }
}

/// Frees the in-flight slot when the reload task ends, panics included.
struct ClearOnDrop<'a>(&'a Mutex<Option<InFlight>>);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use axum::http::{HeaderMap, HeaderValue, header::AUTHORIZATION};

    use super::*;
    use crate::gateway::QueryParam;
    use crate::snapshot::ClientSpec;

    const HEADER: &str = "X-Prom-Liver-Id";

    struct TestSource {
        snapshot: Mutex<Snapshot>,
        loads: AtomicUsize,
        delay: Duration,
    }

    impl TestSource {
        fn new(snapshot: Snapshot, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                snapshot: Mutex::new(snapshot),
                loads: AtomicUsize::new(0),
                delay,
            })
        }

        fn set(&self, snapshot: Snapshot) {
            *self.snapshot.lock() = snapshot;
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    impl SnapshotSource for TestSource {
        fn load(&self) -> crate::Result<Snapshot> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(self.snapshot.lock().clone())
        }
    }

    fn team_a() -> Snapshot {
        Snapshot::new(HEADER).with_client(
            "teamA",
            ClientSpec::default().bearer("tok-A").matching(r#"team="a""#),
        )
    }

    fn coordinator(source: Arc<TestSource>) -> Arc<ReloadCoordinator> {
        let initial = source.snapshot.lock().clone();
        let auth = Arc::new(AuthManager::new(AuthManager::build(&initial).unwrap()));
        let filter = Arc::new(FilterManager::new(FilterManager::build(&initial).unwrap()));
        Arc::new(ReloadCoordinator::new(source, auth, filter))
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn reload_publishes_new_tables() {
        let source = TestSource::new(team_a(), Duration::ZERO);
        let coordinator = coordinator(Arc::clone(&source));

        source.set(team_a().with_client(
            "teamB",
            ClientSpec::default().bearer("tok-B").matching(r#"team="b""#),
        ));
        let summary = coordinator.reload().await.unwrap();

        assert_eq!(summary, ReloadSummary { generation: 1, clients: 2 });
        assert_eq!(
            coordinator.auth.identify(&bearer("tok-B")).unwrap().client.as_str(),
            "teamB"
        );
        assert_eq!(
            coordinator
                .filter
                .filter("teamB", QueryParam::Expression, &["up".to_string()])
                .unwrap(),
            vec![r#"up{team="b"}"#.to_string()]
        );
        assert!(!coordinator.is_reloading());
    }

    #[tokio::test]
    async fn failed_build_keeps_previous_tables() {
        let source = TestSource::new(team_a(), Duration::ZERO);
        let coordinator = coordinator(Arc::clone(&source));

        source.set(
            team_a().with_client("teamB", ClientSpec::default().bearer("tok-A")),
        );
        let err = coordinator.reload().await.unwrap_err();

        assert!(matches!(
            err,
            ReloadError::Validation(ValidationError::DuplicateBearer { .. })
        ));
        assert_eq!(
            coordinator.auth.identify(&bearer("tok-A")).unwrap().client.as_str(),
            "teamA"
        );
        assert!(coordinator.filter.current().constraints("teamB").is_none());
        assert_eq!(coordinator.generation(), 0);
    }

    #[tokio::test]
    async fn invalid_constraint_leaves_auth_untouched() {
        let source = TestSource::new(team_a(), Duration::ZERO);
        let coordinator = coordinator(Arc::clone(&source));

        source.set(
            team_a().with_client(
                "teamB",
                ClientSpec::default().bearer("tok-B").matching("team=b"),
            ),
        );
        assert!(coordinator.reload().await.is_err());
        assert!(coordinator.auth.identify(&bearer("tok-B")).is_err());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_reload() {
        let source = TestSource::new(team_a(), Duration::from_millis(100));
        let coordinator = coordinator(Arc::clone(&source));

        let results = futures::future::join_all((0..5).map(|_| coordinator.reload())).await;

        assert_eq!(source.loads(), 1);
        for result in results {
            assert_eq!(result.unwrap().generation, 1);
        }
    }

    #[tokio::test]
    async fn trigger_while_in_flight_is_dropped() {
        let source = TestSource::new(team_a(), Duration::from_millis(100));
        let coordinator = coordinator(Arc::clone(&source));

        assert!(coordinator.trigger());
        assert!(!coordinator.trigger());
        assert!(coordinator.is_reloading());

        while coordinator.is_reloading() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(source.loads(), 1);
        assert_eq!(coordinator.generation(), 1);

        // Slot is free again
        assert!(coordinator.trigger());
    }

    #[tokio::test]
    async fn reloading_an_unchanged_snapshot_is_idempotent() {
        let source = TestSource::new(team_a(), Duration::ZERO);
        let coordinator = coordinator(Arc::clone(&source));
        let query = ["rate(http_requests_total[5m])".to_string()];

        let before = coordinator
            .filter
            .filter("teamA", QueryParam::Expression, &query)
            .unwrap();
        coordinator.reload().await.unwrap();
        coordinator.reload().await.unwrap();

        assert_eq!(
            coordinator
                .filter
                .filter("teamA", QueryParam::Expression, &query)
                .unwrap(),
            before
        );
        assert_eq!(
            coordinator.auth.identify(&bearer("tok-A")).unwrap().client.as_str(),
            "teamA"
        );
        assert_eq!(coordinator.generation(), 2);
    }

    #[tokio::test]
    async fn load_failure_is_reported() {
        struct Broken;
        impl SnapshotSource for Broken {
            fn load(&self) -> crate::Result<Snapshot> {
                Err(crate::Error::Config("no such file".into()))
            }
        }

        let initial = team_a();
        let coordinator = Arc::new(ReloadCoordinator::new(
            Arc::new(Broken),
            Arc::new(AuthManager::new(AuthManager::build(&initial).unwrap())),
            Arc::new(FilterManager::new(FilterManager::build(&initial).unwrap())),
        ));

        let err = coordinator.reload().await.unwrap_err();
        assert!(matches!(err, ReloadError::Load(ref m) if m.contains("no such file")), "{err}");
    }
}
