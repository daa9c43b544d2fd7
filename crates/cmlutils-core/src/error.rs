//! Error types for the `cmlutils` core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for configuration handling.
#[derive(Debug, Error)]
pub enum Error {
    /// Unreadable, malformed or invalid settings. The message names the file
    /// or the offending key.
    #[error("Configuration error: {0}")]
    Config(String),
}
