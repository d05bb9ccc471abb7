//! Thin per-tool wrappers over the command substrate.
//!
//! Each executor prepends its tool-specific flags and records wall-clock
//! timing for every invocation into an [`ExecStats`] mapping. Timing is a
//! composed side effect on the shared [`Executor`], not a mixin.

mod ansible;
mod bats;
mod command;
mod python;
mod shell;

use std::{collections::BTreeMap, path::Path, time::Duration};

pub use ansible::AnsibleExecutor;
pub use bats::BatsExecutor;
use chrono::{DateTime, Utc};
pub use command::CommandExecutor;
pub use python::PythonExecutor;
use serde::Serialize;
pub use shell::ShellExecutor;
use test_system_shared::models::CommandResult;

use crate::{
    CommandError,
    container::ContainerExec,
    local::LocalCommand,
    ssh::{SshClient, SshParams},
};

const DEFAULT_EXECUTOR_TIMEOUT: Duration = Duration::from_secs(30);

/// Wall-clock timing of one executor stage.
#[derive(Clone, Debug, Serialize)]
pub struct StageTiming {
    pub start_ts: String,
    pub end_ts: String,
    pub delta_seconds: f64,
}

/// Mapping from stage name to its last recorded timing.
pub type ExecStats = BTreeMap<String, StageTiming>;

/// Shared mechanics for tool-specific executors: binary resolution, env
/// overlay, optional SSH transport and timing capture.
pub struct Executor {
    binary_name: String,
    env_vars: BTreeMap<String, String>,
    timeout: Duration,
    ssh: Option<SshClient>,
    stats: ExecStats,
}

impl Executor {
    #[must_use]
    pub fn new(binary_name: impl Into<String>) -> Self {
        Self {
            binary_name: binary_name.into(),
            env_vars: BTreeMap::new(),
            timeout: DEFAULT_EXECUTOR_TIMEOUT,
            ssh: None,
            stats: ExecStats::new(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_env_vars(mut self, env_vars: BTreeMap<String, String>) -> Self {
        self.env_vars = env_vars;
        self
    }

    pub fn with_ssh(mut self, params: SshParams) -> std::io::Result<Self> {
        self.ssh = Some(SshClient::new(params)?);
        Ok(self)
    }

    #[must_use]
    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    pub fn set_binary(&mut self, binary_name: impl Into<String>) {
        self.binary_name = binary_name.into();
    }

    #[must_use]
    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env_vars
    }

    #[must_use]
    pub fn exec_stats(&self) -> &ExecStats {
        &self.stats
    }

    /// Records a stage entry closing now, preserving entries for both the
    /// generic and the tool-specific stage names.
    pub fn record_stage(&mut self, stage: &str, started: DateTime<Utc>) {
        let ended = Utc::now();
        let delta_seconds = (ended - started).num_milliseconds() as f64 / 1000.0;
        self.stats.insert(
            stage.to_owned(),
            StageTiming {
                start_ts: started.to_rfc3339(),
                end_ts: ended.to_rfc3339(),
                delta_seconds,
            },
        );
    }

    pub async fn run_local_command(
        &mut self,
        args: &[String],
        workdir: Option<&Path>,
    ) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let command =
            LocalCommand::new(&self.binary_name, self.timeout).with_env(self.env_vars.clone());
        let result = command.run(args, workdir).await;
        self.record_stage("run_local_command", started);
        result
    }

    /// Joins the binary and arguments into one line and runs it over SSH.
    pub async fn run_ssh_command(&mut self, args: &[String]) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let command_line = format!("{} {}", self.binary_name, args.join(" "));
        let result = match &self.ssh {
            Some(ssh) => Ok(ssh.run_command(&command_line, Some(self.timeout)).await),
            None => Err(CommandError::SshParamsMissing),
        };
        self.record_stage("run_ssh_command", started);
        result
    }

    pub async fn run_docker_command(
        &mut self,
        container_name: &str,
        args: &[String],
        workdir: Option<&Path>,
    ) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let exec = ContainerExec::new(container_name, self.timeout);
        let mut cmd_with_args = vec![self.binary_name.clone()];
        cmd_with_args.extend_from_slice(args);
        let result = exec.run(cmd_with_args, workdir).await;
        self.record_stage("run_docker_command", started);
        result
    }

    #[must_use]
    pub fn ssh(&self) -> Option<&SshClient> {
        self.ssh.as_ref()
    }
}
