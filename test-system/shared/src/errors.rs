use std::path::PathBuf;

use thiserror::Error;

/// Boxed error used where a stage can fail for more than one reason.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration loading failures; fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot load config file {path}")]
    NotFound { path: PathBuf },
    #[error("cannot read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}
