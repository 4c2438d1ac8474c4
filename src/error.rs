//! Lockwire error types

use thiserror::Error;

/// Result type alias for lockwire operations
pub type Result<T> = std::result::Result<T, Error>;

/// Lockwire error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Descriptor error: {0}")]
    Descriptor(String),

    #[error("Invalid key material: {0}")]
    Key(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("Tunnel device error: {0}")]
    Device(String),

    #[error("Routing error: {0}")]
    Route(String),

    #[error("Control socket error: {0}")]
    Control(String),

    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
