use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
    /// The coordination store connection names no database.
    #[error("Invalid store config: `name` cannot be empty")]
    MissingDatabaseName,
    /// The coordination store pool must hold at least one connection.
    #[error("Invalid store config: `max_connections` cannot be zero")]
    MaxConnectionsZero,
}
