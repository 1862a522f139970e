//! Discovery backend seam and built-in implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DiscoveryConfig;
use crate::context::SecureContext;
use crate::Result;

/// One resolvable instance of a registered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Unique id of this instance within its service.
    pub instance_id: String,
    /// Id of the service this instance belongs to.
    pub service_id: String,
    /// Hostname or address of the instance.
    pub host: String,
    /// Port the instance listens on.
    pub port: u16,
    /// Whether the instance expects TLS.
    pub secure: bool,
    /// Free-form instance metadata.
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Create an instance with the host as its instance id.
    pub fn new(service_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            instance_id: host.clone(),
            service_id: service_id.into(),
            host,
            port,
            secure: false,
            metadata: HashMap::new(),
        }
    }

    /// Set the instance id.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    /// Mark the instance as expecting TLS.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Add a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// URI of the instance derived from host, port and the secure flag.
    pub fn uri(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// One live, connected discovery session.
///
/// A backend is bound to the secure context it was connected with; rotation
/// supersedes it wholesale rather than patching it in place.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Human-readable name for logging (e.g. "static", "registry").
    fn name(&self) -> &'static str;

    /// All known instances of a service. Unknown ids yield an empty vec.
    async fn get_instances(&self, service_id: &str) -> Result<Vec<ServiceInstance>>;

    /// Ids of all known services.
    async fn get_services(&self) -> Result<Vec<String>>;

    /// Release the backend's resources. Called once it is superseded.
    async fn shutdown(&self) {}
}

/// Connects discovery backends.
///
/// `context` is `None` when no credential is configured and the backend
/// should use plain transport.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Establish a connected backend for the given context and configuration.
    async fn connect(
        &self,
        context: Option<SecureContext>,
        config: &DiscoveryConfig,
    ) -> Result<Arc<dyn DiscoveryBackend>>;
}

/// Static in-memory discovery backend.
///
/// Serves a fixed instance table; useful for tests and deployments with a
/// known topology.
#[derive(Debug, Clone, Default)]
pub struct StaticBackend {
    instances: HashMap<String, Vec<ServiceInstance>>,
}

impl StaticBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance, keyed by its service id.
    pub fn add_instance(mut self, instance: ServiceInstance) -> Self {
        self.instances
            .entry(instance.service_id.clone())
            .or_default()
            .push(instance);
        self
    }
}

#[async_trait]
impl DiscoveryBackend for StaticBackend {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn get_instances(&self, service_id: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self.instances.get(service_id).cloned().unwrap_or_default())
    }

    async fn get_services(&self) -> Result<Vec<String>> {
        let mut services: Vec<String> = self.instances.keys().cloned().collect();
        services.sort();
        Ok(services)
    }
}

/// Connector that hands out clones of a fixed [`StaticBackend`].
#[derive(Debug, Clone, Default)]
pub struct StaticConnector {
    backend: StaticBackend,
}

impl StaticConnector {
    /// Create a connector serving the given backend on every connect.
    pub fn new(backend: StaticBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl BackendConnector for StaticConnector {
    async fn connect(
        &self,
        _context: Option<SecureContext>,
        _config: &DiscoveryConfig,
    ) -> Result<Arc<dyn DiscoveryBackend>> {
        Ok(Arc::new(self.backend.clone()))
    }
}
