use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Unsupported host: {0}")]
    UnsupportedHost(String),
    #[error("Link resolution failed: {0}")]
    Resolution(String),
    #[error("Transfer failed: {0}")]
    Transfer(String),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("download cancelled")]
    Cancelled,
    #[error("Extraction failed: {0}")]
    Extraction(String),
    #[error("No executable found under {0}")]
    NoExecutableFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
}

impl LauncherError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LauncherError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;
