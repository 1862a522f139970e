//! Secure transport contexts built from credential bundles.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use crate::credential::CredentialBundle;
use crate::{Error, Result};

/// An immutable TLS context produced from one credential bundle.
///
/// Owned by exactly one backend instance; a rotation builds a fresh context
/// rather than mutating this one.
#[derive(Clone)]
pub struct SecureContext {
    config: Arc<ClientConfig>,
}

impl SecureContext {
    /// Wrap a finished rustls client configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The underlying rustls client configuration.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

impl fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureContext").finish_non_exhaustive()
    }
}

/// Builds a [`SecureContext`] from a credential bundle.
///
/// Fails with [`Error::Credential`] on malformed PEM and
/// [`Error::SecurityBuild`] when the TLS library rejects the material.
pub trait SecureContextBuilder: Send + Sync {
    /// Build a context from the given bundle.
    fn build(&self, bundle: &CredentialBundle) -> Result<SecureContext>;
}

/// Default builder for PEM credential bundles.
///
/// Every certificate in the bundle enters the root store (mounted bundles
/// carry their private CA alongside the leaf), and when a private key is
/// present the certificates also form the client identity chain for mutual
/// TLS. A bundle without a key yields a verify-only context.
#[derive(Debug, Clone, Copy, Default)]
pub struct PemContextBuilder;

impl PemContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self
    }
}

impl SecureContextBuilder for PemContextBuilder {
    fn build(&self, bundle: &CredentialBundle) -> Result<SecureContext> {
        let mut certs: Vec<CertificateDer<'static>> = Vec::new();
        let mut key: Option<PrivateKeyDer<'static>> = None;

        let mut reader = Cursor::new(bundle.pem());
        for item in rustls_pemfile::read_all(&mut reader) {
            let item =
                item.map_err(|e| Error::credential(format!("malformed PEM bundle: {e}")))?;
            match item {
                rustls_pemfile::Item::X509Certificate(der) => certs.push(der),
                rustls_pemfile::Item::Pkcs8Key(der) => key = Some(PrivateKeyDer::Pkcs8(der)),
                rustls_pemfile::Item::Pkcs1Key(der) => key = Some(PrivateKeyDer::Pkcs1(der)),
                rustls_pemfile::Item::Sec1Key(der) => key = Some(PrivateKeyDer::Sec1(der)),
                _ => {}
            }
        }

        if certs.is_empty() {
            return Err(Error::credential("credential bundle contains no certificates"));
        }

        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(certs.iter().cloned());
        if added == 0 {
            return Err(Error::credential(
                "no certificate in the bundle is usable as a trust root",
            ));
        }
        debug!(added, ignored, has_key = key.is_some(), "parsed credential bundle");

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let config = match key {
            Some(key) => builder.with_client_auth_cert(certs, key)?,
            None => builder.with_no_client_auth(),
        };

        Ok(SecureContext::new(config))
    }
}
