use std::path::Path;

use chrono::Utc;
use test_system_shared::models::CommandResult;

use super::{ExecStats, Executor};
use crate::CommandError;

/// Generic executor for an arbitrary named binary.
pub struct CommandExecutor {
    inner: Executor,
}

impl CommandExecutor {
    #[must_use]
    pub fn new(inner: Executor) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn for_binary(binary_name: impl Into<String>) -> Self {
        Self::new(Executor::new(binary_name))
    }

    pub async fn run_local(
        &mut self,
        cmd_args: &[String],
        workdir: Option<&Path>,
    ) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let result = self.inner.run_local_command(cmd_args, workdir).await;
        self.inner.record_stage("run_local_command", started);
        result
    }

    pub async fn run_ssh(&mut self, cmd_args: &[String]) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let result = self.inner.run_ssh_command(cmd_args).await;
        self.inner.record_stage("run_ssh_command", started);
        result
    }

    pub async fn run_docker(
        &mut self,
        container_name: &str,
        cmd_args: &[String],
        workdir: Option<&Path>,
    ) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let result = self
            .inner
            .run_docker_command(container_name, cmd_args, workdir)
            .await;
        self.inner.record_stage("run_docker_command", started);
        result
    }

    #[must_use]
    pub fn exec_stats(&self) -> &ExecStats {
        self.inner.exec_stats()
    }

    #[must_use]
    pub fn binary_name(&self) -> &str {
        self.inner.binary_name()
    }
}
