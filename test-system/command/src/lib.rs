pub mod container;
pub mod executors;
pub mod local;
pub mod ssh;

use thiserror::Error;

/// Failures in the command substrate that cannot be expressed as a non-zero
/// exit code.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("binary {0} is not found in PATH on the machine")]
    BinaryNotFound(String),
    #[error("cannot spawn {binary}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot collect output of {binary}")]
    Output {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("SSH params are missing")]
    SshParamsMissing,
}
