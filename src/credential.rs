//! Credential bundles and the sources that provide them.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use crate::Result;

/// An immutable snapshot of rotated credential material.
///
/// Holds the raw PEM bytes of the bundle (private key, certificate chain and
/// CA certificates concatenated, the usual mounted-secret layout) together
/// with the modification time reported by the source. A rotation produces a
/// new bundle; an existing one is never mutated.
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    pem: Vec<u8>,
    last_modified: u64,
}

impl CredentialBundle {
    /// Create a bundle from raw PEM bytes and a modification time in epoch
    /// milliseconds.
    pub fn new(pem: Vec<u8>, last_modified: u64) -> Self {
        Self { pem, last_modified }
    }

    /// Raw PEM bytes of the bundle.
    pub fn pem(&self) -> &[u8] {
        &self.pem
    }

    /// Modification time of the bundle in epoch milliseconds.
    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }
}

/// A source of credential bundles.
///
/// `Ok(None)` is the clean "TLS not configured" state, not an error: the
/// watcher treats it as a no-op and keeps polling.
pub trait CredentialSource: Send + Sync {
    /// The current bundle, or `None` when no credential is configured.
    fn current(&self) -> Result<Option<CredentialBundle>>;
}

/// A source that never yields a credential.
///
/// Used when a client is constructed without a credential path; the backend
/// runs over plain transport and rotation checks are permanent no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialSource for NoCredentials {
    fn current(&self) -> Result<Option<CredentialBundle>> {
        Ok(None)
    }
}

/// File-backed credential source watching a single PEM bundle path.
///
/// A missing file reports `None` rather than an error, so a bundle that is
/// mounted late (or torn down) degrades to the unconfigured state instead of
/// failing the watcher.
#[derive(Debug, Clone)]
pub struct FileCredentialSource {
    path: PathBuf,
}

impl FileCredentialSource {
    /// Create a source for the given bundle path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSource for FileCredentialSource {
    fn current(&self) -> Result<Option<CredentialBundle>> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let last_modified = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let pem = fs::read(&self.path)?;
        Ok(Some(CredentialBundle::new(pem, last_modified)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_absent_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileCredentialSource::new(dir.path().join("bundle.pem"));

        assert!(source.current().unwrap().is_none());
    }

    #[test]
    fn present_file_yields_bundle_with_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.pem");
        fs::write(&path, b"-----BEGIN CERTIFICATE-----").unwrap();

        let source = FileCredentialSource::new(&path);
        let bundle = source.current().unwrap().expect("bundle expected");

        assert_eq!(bundle.pem(), b"-----BEGIN CERTIFICATE-----");
        assert!(bundle.last_modified() > 0);
    }

    #[test]
    fn no_credentials_source_is_always_absent() {
        assert!(NoCredentials.current().unwrap().is_none());
    }
}
