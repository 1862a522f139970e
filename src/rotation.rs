//! Credential rotation detection and atomic backend republication.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendConnector, DiscoveryBackend};
use crate::config::DiscoveryConfig;
use crate::context::SecureContextBuilder;
use crate::credential::CredentialSource;

/// The published rotation snapshot.
///
/// The active backend and the credential timestamp it was built from move
/// together: the whole struct is republished in one atomic swap, so a reader
/// never observes the two fields out of step.
pub(crate) struct RotationState {
    pub(crate) backend: Arc<dyn DiscoveryBackend>,
    pub(crate) last_seen_modified: u64,
}

/// Drop-guard for the single-flight rebuild flag.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then_some(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Watches the credential source and republishes the backend on rotation.
///
/// All rotation failures are contained here: they are logged, counted, and
/// retried on the next tick. The published state is only ever replaced with
/// a fully built and connected backend.
pub(crate) struct RotationWatcher {
    state: Arc<ArcSwap<RotationState>>,
    source: Arc<dyn CredentialSource>,
    context_builder: Arc<dyn SecureContextBuilder>,
    connector: Arc<dyn BackendConnector>,
    discovery: DiscoveryConfig,
    poll_interval: Duration,
    in_flight: AtomicBool,
    failures: AtomicU64,
}

impl RotationWatcher {
    pub(crate) fn new(
        state: Arc<ArcSwap<RotationState>>,
        source: Arc<dyn CredentialSource>,
        context_builder: Arc<dyn SecureContextBuilder>,
        connector: Arc<dyn BackendConnector>,
        discovery: DiscoveryConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state,
            source,
            context_builder,
            connector,
            discovery,
            poll_interval,
            in_flight: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }

    /// Number of rotation attempts that failed since construction.
    pub(crate) fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Run one rotation check.
    ///
    /// A tick that finds a rebuild already in progress skips rather than
    /// queueing a duplicate. Errors never escape; the current backend stays
    /// published until a full rebuild succeeds.
    pub(crate) async fn tick(&self) {
        let _guard = match InFlight::acquire(&self.in_flight) {
            Some(guard) => guard,
            None => {
                debug!("rebuild already in progress, skipping tick");
                return;
            }
        };

        let bundle = match self.source.current() {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                debug!("no credential configured");
                return;
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "credential source read failed");
                return;
            }
        };

        let current = self.state.load_full();
        // Ties and backward timestamps must not trigger a rebuild; clock
        // regressions and copy artifacts look exactly like this.
        if bundle.last_modified() <= current.last_seen_modified {
            debug!(modified = bundle.last_modified(), "credential unchanged");
            return;
        }

        info!(
            modified = bundle.last_modified(),
            last_seen = current.last_seen_modified,
            "credential rotation detected"
        );

        let context = match self.context_builder.build(&bundle) {
            Ok(context) => context,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "TLS context rebuild failed, keeping current backend");
                return;
            }
        };

        let backend = match self.connector.connect(Some(context), &self.discovery).await {
            Ok(backend) => backend,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "backend reconnect failed, keeping current backend");
                return;
            }
        };

        info!(
            backend = backend.name(),
            modified = bundle.last_modified(),
            "publishing rebuilt discovery backend"
        );
        self.state.store(Arc::new(RotationState {
            backend,
            last_seen_modified: bundle.last_modified(),
        }));

        // Retire the superseded backend only after the swap; in-flight
        // lookups hold their own snapshot and complete against it safely.
        current.backend.shutdown().await;
    }

    /// Start the periodic rotation check loop.
    pub(crate) fn spawn(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_ms = self.poll_interval.as_millis() as u64,
                "rotation watcher started"
            );

            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => self.tick().await,
                    _ = shutdown_rx.recv() => {
                        info!("rotation watcher shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use super::*;
    use crate::backend::ServiceInstance;
    use crate::context::SecureContext;
    use crate::credential::CredentialBundle;
    use crate::{Error, Result};

    fn empty_context() -> SecureContext {
        SecureContext::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        )
    }

    /// Source with a settable timestamp; 0 means "no credential".
    #[derive(Default)]
    struct FakeSource {
        modified: AtomicU64,
        io_error: AtomicBool,
    }

    impl CredentialSource for FakeSource {
        fn current(&self) -> Result<Option<CredentialBundle>> {
            if self.io_error.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::other("source unavailable")));
            }
            match self.modified.load(Ordering::SeqCst) {
                0 => Ok(None),
                modified => Ok(Some(CredentialBundle::new(Vec::new(), modified))),
            }
        }
    }

    #[derive(Default)]
    struct FakeContextBuilder {
        builds: AtomicUsize,
        fail: AtomicBool,
    }

    impl SecureContextBuilder for FakeContextBuilder {
        fn build(&self, _bundle: &CredentialBundle) -> Result<SecureContext> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::credential("forced build failure"));
            }
            Ok(empty_context())
        }
    }

    /// Backend labeled by connect ordinal, with a retirement flag.
    struct NumberedBackend {
        ordinal: usize,
        retired: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DiscoveryBackend for NumberedBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn get_instances(&self, _service_id: &str) -> Result<Vec<ServiceInstance>> {
            Ok(Vec::new())
        }

        async fn get_services(&self) -> Result<Vec<String>> {
            Ok(vec![format!("backend-{}", self.ordinal)])
        }

        async fn shutdown(&self) {
            self.retired.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        connects: AtomicUsize,
        fail: AtomicBool,
        // Optional rendezvous: signal entry, then block until released.
        gate: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
        retired: Mutex<Vec<Arc<AtomicBool>>>,
    }

    #[async_trait]
    impl BackendConnector for FakeConnector {
        async fn connect(
            &self,
            _context: Option<SecureContext>,
            _config: &DiscoveryConfig,
        ) -> Result<Arc<dyn DiscoveryBackend>> {
            let ordinal = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            let gate = self.gate.lock().unwrap().take();
            if let Some((entered_tx, release_rx)) = gate {
                let _ = entered_tx.send(());
                let _ = release_rx.await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::connect("forced connect failure"));
            }
            let retired = Arc::new(AtomicBool::new(false));
            self.retired.lock().unwrap().push(Arc::clone(&retired));
            Ok(Arc::new(NumberedBackend { ordinal, retired }))
        }
    }

    struct Harness {
        watcher: Arc<RotationWatcher>,
        state: Arc<ArcSwap<RotationState>>,
        source: Arc<FakeSource>,
        builder: Arc<FakeContextBuilder>,
        connector: Arc<FakeConnector>,
        initial_retired: Arc<AtomicBool>,
    }

    fn harness(initial_modified: u64) -> Harness {
        let initial_retired = Arc::new(AtomicBool::new(false));
        let initial: Arc<dyn DiscoveryBackend> = Arc::new(NumberedBackend {
            ordinal: 0,
            retired: Arc::clone(&initial_retired),
        });
        let state = Arc::new(ArcSwap::from_pointee(RotationState {
            backend: initial,
            last_seen_modified: initial_modified,
        }));
        let source = Arc::new(FakeSource::default());
        let builder = Arc::new(FakeContextBuilder::default());
        let connector = Arc::new(FakeConnector::default());
        let watcher = Arc::new(RotationWatcher::new(
            Arc::clone(&state),
            Arc::clone(&source) as Arc<dyn CredentialSource>,
            Arc::clone(&builder) as Arc<dyn SecureContextBuilder>,
            Arc::clone(&connector) as Arc<dyn BackendConnector>,
            DiscoveryConfig::new(),
            Duration::from_millis(10),
        ));
        Harness {
            watcher,
            state,
            source,
            builder,
            connector,
            initial_retired,
        }
    }

    async fn active_label(state: &ArcSwap<RotationState>) -> String {
        let snapshot = state.load_full();
        snapshot.backend.get_services().await.unwrap()[0].clone()
    }

    #[tokio::test]
    async fn unchanged_timestamp_is_a_noop() {
        let h = harness(100);
        h.source.modified.store(100, Ordering::SeqCst);

        h.watcher.tick().await;

        assert_eq!(h.builder.builds.load(Ordering::SeqCst), 0);
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 0);
        assert_eq!(h.state.load().last_seen_modified, 100);
        assert_eq!(active_label(&h.state).await, "backend-0");
    }

    #[tokio::test]
    async fn advancing_timestamp_publishes_new_backend() {
        let h = harness(100);
        h.source.modified.store(150, Ordering::SeqCst);

        h.watcher.tick().await;

        assert_eq!(h.state.load().last_seen_modified, 150);
        assert_eq!(active_label(&h.state).await, "backend-1");
        assert!(h.initial_retired.load(Ordering::SeqCst), "old backend retired");
        assert_eq!(h.watcher.failures(), 0);
    }

    #[tokio::test]
    async fn backward_timestamp_never_rebuilds() {
        let h = harness(100);
        h.source.modified.store(150, Ordering::SeqCst);
        h.watcher.tick().await;

        h.source.modified.store(120, Ordering::SeqCst);
        h.watcher.tick().await;

        assert_eq!(h.builder.builds.load(Ordering::SeqCst), 1);
        assert_eq!(h.state.load().last_seen_modified, 150);
        assert_eq!(active_label(&h.state).await, "backend-1");
    }

    #[tokio::test]
    async fn build_failure_leaves_state_untouched_and_retries() {
        let h = harness(100);
        h.source.modified.store(200, Ordering::SeqCst);
        h.builder.fail.store(true, Ordering::SeqCst);

        h.watcher.tick().await;
        assert_eq!(h.state.load().last_seen_modified, 100);
        assert_eq!(active_label(&h.state).await, "backend-0");
        assert_eq!(h.watcher.failures(), 1);

        // Same timestamp retries the build on the next tick.
        h.watcher.tick().await;
        assert_eq!(h.builder.builds.load(Ordering::SeqCst), 2);
        assert_eq!(h.watcher.failures(), 2);

        h.builder.fail.store(false, Ordering::SeqCst);
        h.watcher.tick().await;
        assert_eq!(h.state.load().last_seen_modified, 200);
        assert_eq!(active_label(&h.state).await, "backend-1");
        assert_eq!(h.watcher.failures(), 2);
    }

    #[tokio::test]
    async fn connect_failure_leaves_state_untouched() {
        let h = harness(100);
        h.source.modified.store(200, Ordering::SeqCst);
        h.connector.fail.store(true, Ordering::SeqCst);

        h.watcher.tick().await;

        assert_eq!(h.state.load().last_seen_modified, 100);
        assert_eq!(active_label(&h.state).await, "backend-0");
        assert!(!h.initial_retired.load(Ordering::SeqCst));
        assert_eq!(h.watcher.failures(), 1);
    }

    #[tokio::test]
    async fn absent_source_is_a_noop_not_a_failure() {
        let h = harness(0);

        h.watcher.tick().await;

        assert_eq!(h.builder.builds.load(Ordering::SeqCst), 0);
        assert_eq!(h.watcher.failures(), 0);
    }

    #[tokio::test]
    async fn source_read_error_counts_as_failure() {
        let h = harness(100);
        h.source.io_error.store(true, Ordering::SeqCst);

        h.watcher.tick().await;

        assert_eq!(h.builder.builds.load(Ordering::SeqCst), 0);
        assert_eq!(h.watcher.failures(), 1);
        assert_eq!(h.state.load().last_seen_modified, 100);
    }

    #[tokio::test]
    async fn overlapping_tick_skips_instead_of_double_building() {
        let h = harness(100);
        h.source.modified.store(150, Ordering::SeqCst);

        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *h.connector.gate.lock().unwrap() = Some((entered_tx, release_rx));

        let watcher = Arc::clone(&h.watcher);
        let first = tokio::spawn(async move { watcher.tick().await });
        entered_rx.await.unwrap();

        // Second tick overlaps the in-progress connect: it must not invoke
        // the collaborators again.
        h.watcher.tick().await;
        assert_eq!(h.builder.builds.load(Ordering::SeqCst), 1);
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);

        release_tx.send(()).unwrap();
        first.await.unwrap();

        assert_eq!(h.state.load().last_seen_modified, 150);
        assert_eq!(active_label(&h.state).await, "backend-1");
    }
}
