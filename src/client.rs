//! Discovery client facade with hot credential rotation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::backend::{BackendConnector, ServiceInstance};
use crate::config::DiscoveryConfig;
use crate::context::{PemContextBuilder, SecureContext, SecureContextBuilder};
use crate::credential::{CredentialSource, FileCredentialSource, NoCredentials};
use crate::rotation::{RotationState, RotationWatcher};
use crate::{Error, Result};

/// Default interval between rotation checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Service-discovery client that survives TLS credential rotation.
///
/// Lookup calls delegate to the currently published backend; a background
/// watcher detects credential rotation and atomically republishes a freshly
/// connected backend without interrupting callers.
///
/// # Example
///
/// ```ignore
/// let client = TlsDiscoveryClient::builder(DiscoveryConfig::new().registry_url(url))
///     .credential_path("/etc/secrets/bundle.pem")
///     .connector(MyRegistryConnector::new())
///     .spawn()
///     .await?;
///
/// let instances = client.get_instances("billing").await?;
/// ```
pub struct TlsDiscoveryClient {
    state: Arc<ArcSwap<RotationState>>,
    watcher: Arc<RotationWatcher>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for TlsDiscoveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsDiscoveryClient").finish_non_exhaustive()
    }
}

impl TlsDiscoveryClient {
    /// Client description.
    pub const DESCRIPTION: &'static str = "TLS Rotating Discovery Client";

    /// Start building a client for the given discovery configuration.
    pub fn builder(discovery: DiscoveryConfig) -> TlsDiscoveryClientBuilder {
        TlsDiscoveryClientBuilder {
            discovery,
            poll_interval: DEFAULT_POLL_INTERVAL,
            source: None,
            context_builder: Arc::new(PemContextBuilder::new()),
            connector: None,
        }
    }

    /// Constant identifying label for this client.
    pub fn description(&self) -> &'static str {
        Self::DESCRIPTION
    }

    /// All known instances of a service.
    ///
    /// The active backend is read once per call; a rotation racing with the
    /// call leaves it on the snapshot it captured.
    pub async fn get_instances(&self, service_id: &str) -> Result<Vec<ServiceInstance>> {
        let snapshot = self.state.load_full();
        snapshot.backend.get_instances(service_id).await
    }

    /// Ids of all known services.
    pub async fn get_services(&self) -> Result<Vec<String>> {
        let snapshot = self.state.load_full();
        snapshot.backend.get_services().await
    }

    /// Run a rotation check now, outside the periodic schedule.
    ///
    /// A check overlapping an in-progress rebuild is a no-op. Rotation
    /// failures are contained and counted, never returned.
    pub async fn check_rotation(&self) {
        self.watcher.tick().await;
    }

    /// Number of rotation attempts that have failed since construction.
    ///
    /// Monotonically increasing; stops advancing once a rotation succeeds.
    pub fn rotation_failures(&self) -> u64 {
        self.watcher.failures()
    }

    /// Stop the rotation watcher and retire the active backend.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;

        let snapshot = self.state.load_full();
        snapshot.backend.shutdown().await;
        info!("discovery client shut down");
    }
}

/// Builder for [`TlsDiscoveryClient`].
///
/// A backend connector is required; everything else has defaults. Without a
/// credential path or source the client runs over plain transport and
/// rotation checks are permanent no-ops.
pub struct TlsDiscoveryClientBuilder {
    discovery: DiscoveryConfig,
    poll_interval: Duration,
    source: Option<Arc<dyn CredentialSource>>,
    context_builder: Arc<dyn SecureContextBuilder>,
    connector: Option<Arc<dyn BackendConnector>>,
}

impl TlsDiscoveryClientBuilder {
    /// Watch a PEM credential bundle at the given path.
    pub fn credential_path(self, path: impl Into<PathBuf>) -> Self {
        self.credential_source(FileCredentialSource::new(path))
    }

    /// Use a custom credential source.
    pub fn credential_source(mut self, source: impl CredentialSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Use a custom secure-context builder. Default: [`PemContextBuilder`].
    pub fn context_builder(mut self, builder: impl SecureContextBuilder + 'static) -> Self {
        self.context_builder = Arc::new(builder);
        self
    }

    /// Set the backend connector. Required.
    pub fn connector(mut self, connector: impl BackendConnector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Set the rotation check interval. Default: 3 seconds.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Connect the initial backend and start the rotation watcher.
    ///
    /// Construction is fail-fast: an unreadable credential or a failed
    /// initial connect is returned here, unlike rotation-time failures which
    /// are contained and retried.
    pub async fn spawn(self) -> Result<TlsDiscoveryClient> {
        let connector = self
            .connector
            .ok_or_else(|| Error::connect("no backend connector configured"))?;
        let source = self
            .source
            .unwrap_or_else(|| Arc::new(NoCredentials) as Arc<dyn CredentialSource>);

        let (context, last_seen_modified): (Option<SecureContext>, u64) = match source.current()? {
            Some(bundle) => (
                Some(self.context_builder.build(&bundle)?),
                bundle.last_modified(),
            ),
            None => (None, 0),
        };

        let backend = connector.connect(context, &self.discovery).await?;
        info!(
            backend = backend.name(),
            last_modified = last_seen_modified,
            "initial discovery backend connected"
        );

        let state = Arc::new(ArcSwap::from_pointee(RotationState {
            backend,
            last_seen_modified,
        }));

        let watcher = Arc::new(RotationWatcher::new(
            Arc::clone(&state),
            source,
            self.context_builder,
            connector,
            self.discovery,
            self.poll_interval,
        ));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = Arc::clone(&watcher).spawn(shutdown_rx);

        Ok(TlsDiscoveryClient {
            state,
            watcher,
            shutdown_tx,
            task,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{StaticBackend, StaticConnector};

    #[tokio::test]
    async fn builder_requires_a_connector() {
        let err = TlsDiscoveryClient::builder(DiscoveryConfig::new())
            .spawn()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Connect(_)));
    }

    #[tokio::test]
    async fn client_without_credentials_serves_lookups() {
        let backend = StaticBackend::new()
            .add_instance(ServiceInstance::new("svc-a", "10.0.0.1", 8080));
        let client = TlsDiscoveryClient::builder(DiscoveryConfig::new())
            .connector(StaticConnector::new(backend))
            .spawn()
            .await
            .unwrap();

        assert_eq!(client.description(), TlsDiscoveryClient::DESCRIPTION);
        assert_eq!(client.get_services().await.unwrap(), vec!["svc-a"]);
        assert_eq!(client.get_instances("svc-a").await.unwrap().len(), 1);
        assert_eq!(client.rotation_failures(), 0);

        client.shutdown().await;
    }
}
