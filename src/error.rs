use std::path::PathBuf;

use thiserror::Error;

/// Failures from the page behind a `ProductSource`.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("browser command failed: {0}")]
    Browser(String),
    #[error("script returned unexpected value: {0}")]
    Script(String),
}

impl From<chromiumoxide::error::CdpError> for SourceError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        SourceError::Browser(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("refusing to overwrite existing file {0}")]
    AlreadyExists(PathBuf),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl WriteError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WriteError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}
