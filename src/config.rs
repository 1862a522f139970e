//! Configuration passed through to the discovery backend connector.

use std::collections::HashMap;

/// Opaque discovery configuration.
///
/// The rotation core never interprets this beyond handing it to the
/// [`BackendConnector`](crate::backend::BackendConnector) on every
/// (re)connect. A registry address plus free-form properties covers the
/// common connectors; anything richer belongs in a connector-specific
/// wrapper.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    registry_url: Option<String>,
    properties: HashMap<String, String>,
}

impl DiscoveryConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registry address the connector should dial.
    pub fn registry_url(mut self, url: impl Into<String>) -> Self {
        self.registry_url = Some(url.into());
        self
    }

    /// Add a connector-specific property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The configured registry address, if any.
    pub fn registry(&self) -> Option<&str> {
        self.registry_url.as_deref()
    }

    /// Look up a connector-specific property.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}
