//! Common error types for the karaoke engine

use thiserror::Error;

/// Common result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared across the engine crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Required file or resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal engine error
    #[error("Internal error: {0}")]
    Internal(String),
}
