//! Common error types for Dropwatch

use thiserror::Error;

/// Common result type for Dropwatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the Dropwatch monitors
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error (wraps reqwest::Error)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// State or payload serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed external data (bad timestamp, unparseable row)
    #[error("Data error: {0}")]
    Data(String),

    /// Google Sheets API returned an error response
    #[error("Sheets API error: {0}")]
    Sheets(String),

    /// WhatsApp bridge send API refused or failed a send
    #[error("Send failed: {0}")]
    Send(String),

    /// No routing entry for a project name (no default destination)
    #[error("Unknown project: {0}")]
    UnknownProject(String),
}
