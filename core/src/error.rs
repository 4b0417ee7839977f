//! Error types for the IRC daemon

use thiserror::Error;

/// Main error type for the IRC daemon
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Message parsing error: {0}")]
    MessageParse(String),

    #[error("Socket engine error: {0}")]
    SocketEngine(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Extension error: {0}")]
    Extension(String),

    #[error("Module error: {0}")]
    Module(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Generic error: {0}")]
    Generic(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Generic(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(s)
    }
}
