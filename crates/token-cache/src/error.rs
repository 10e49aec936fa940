//! Error types for token cache operations

/// Errors from token ingestion and lookup.
///
/// Persistence failures never appear here: durable storage is best-effort,
/// so file I/O errors are logged and suppressed inside `PersistentTokenStore`
/// rather than surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The token is empty, not a three-segment dot-delimited string, or its
    /// payload segment does not decode to JSON.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The token payload decoded but carries no numeric `exp` claim.
    #[error("token payload has no exp claim")]
    MissingExpiry,

    /// No valid cached token for the key and no refresh produced one.
    #[error("authentication failed: no usable token for key {0:?}")]
    AuthenticationFailed(String),

    /// The refresh callback itself failed; the source error is preserved.
    #[error("token refresh failed: {0}")]
    Refresh(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Result alias for token cache operations.
pub type Result<T> = std::result::Result<T, Error>;
