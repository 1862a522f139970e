//! Self-refreshing service-discovery client with hot TLS credential rotation.
//!
//! A background watcher polls a credential bundle for rotation, rebuilds the
//! TLS context from the new material, reconnects the discovery backend, and
//! atomically publishes the result. Lookup callers keep resolving against the
//! last known-good backend throughout; no process restart, no torn state.

#![deny(missing_docs)]

pub mod backend;
pub mod client;
pub mod config;
pub mod context;
pub mod credential;
pub mod error;
mod rotation;

// Re-export key types
pub use backend::{BackendConnector, DiscoveryBackend, ServiceInstance, StaticBackend, StaticConnector};
pub use client::{TlsDiscoveryClient, TlsDiscoveryClientBuilder, DEFAULT_POLL_INTERVAL};
pub use config::DiscoveryConfig;
pub use context::{PemContextBuilder, SecureContext, SecureContextBuilder};
pub use credential::{CredentialBundle, CredentialSource, FileCredentialSource, NoCredentials};
pub use error::{Error, Result};

// Re-export the TLS library so context-builder implementations can name its
// types without pinning their own copy.
pub use rustls;
