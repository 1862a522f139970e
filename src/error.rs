//! Error types for tls-rotate-discovery.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Credential material is absent, unreadable, or malformed.
    #[error("Credential error: {0}")]
    Credential(String),

    /// The TLS library rejected the credential material.
    #[error("TLS context error: {0}")]
    SecurityBuild(#[from] rustls::Error),

    /// Backend connection or registration error.
    #[error("Connect error: {0}")]
    Connect(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a credential error.
    pub fn credential<S: Into<String>>(msg: S) -> Self {
        Self::Credential(msg.into())
    }

    /// Create a connect error.
    pub fn connect<S: Into<String>>(msg: S) -> Self {
        Self::Connect(msg.into())
    }
}
