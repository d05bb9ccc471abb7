//! Local process execution with env overlay and timeout.

use std::{collections::BTreeMap, ffi::OsStr, path::Path, process::Stdio, time::Duration};

use test_system_shared::{constants::COMMAND_TIMEOUT_EXIT_CODE, models::CommandResult};
use tokio::{process::Command, time::timeout};
use tracing::debug;

use crate::CommandError;

/// Runs a named binary from `PATH`, capturing exit code, stdout and stderr.
#[derive(Clone, Debug)]
pub struct LocalCommand {
    binary: String,
    env_vars: BTreeMap<String, String>,
    timeout: Duration,
}

impl LocalCommand {
    #[must_use]
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            env_vars: BTreeMap::new(),
            timeout,
        }
    }

    #[must_use]
    pub fn with_env(mut self, env_vars: BTreeMap<String, String>) -> Self {
        self.env_vars = env_vars;
        self
    }

    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Executes the binary. A hit timeout kills the child and is shaped into
    /// the 408 sentinel exit code rather than an error.
    pub async fn run<I, S>(&self, args: I, cwd: Option<&Path>) -> Result<CommandResult, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .envs(&self.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        debug!(binary = %self.binary, "running local command");
        let child = command.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CommandError::BinaryNotFound(self.binary.clone())
            } else {
                CommandError::Spawn {
                    binary: self.binary.clone(),
                    source,
                }
            }
        })?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|source| CommandError::Output {
                binary: self.binary.clone(),
                source,
            })?,
            Err(_) => {
                return Ok(CommandResult {
                    exit_code: COMMAND_TIMEOUT_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!(
                        "command {} timed out after {:?}",
                        self.binary, self.timeout
                    ),
                });
            }
        };

        Ok(CommandResult {
            exit_code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
