use std::path::Path;

use chrono::Utc;
use test_system_shared::models::CommandResult;

use super::{ExecStats, Executor};
use crate::CommandError;

/// Runs `bats` suites with `--tap` prepended so results stay
/// machine-readable.
pub struct BatsExecutor {
    inner: Executor,
}

impl BatsExecutor {
    #[must_use]
    pub fn new(inner: Executor) -> Self {
        Self { inner }
    }

    fn tap_args(cmd_args: &[String]) -> Vec<String> {
        let mut args = vec!["--tap".to_owned()];
        args.extend_from_slice(cmd_args);
        args
    }

    pub async fn run_local(
        &mut self,
        cmd_args: &[String],
        workdir: Option<&Path>,
    ) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let result = self
            .inner
            .run_local_command(&Self::tap_args(cmd_args), workdir)
            .await;
        self.inner.record_stage("run_local_bats", started);
        result
    }

    pub async fn run_ssh(&mut self, cmd_args: &[String]) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let result = self.inner.run_ssh_command(&Self::tap_args(cmd_args)).await;
        self.inner.record_stage("run_ssh_bats", started);
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
            .run_docker_command(container_name, &Self::tap_args(cmd_args), workdir)
            .await;
        self.inner.record_stage("run_docker_bats", started);
        result
    }

    #[must_use]
    pub fn exec_stats(&self) -> &ExecStats {
        self.inner.exec_stats()
    }
}

impl Default for BatsExecutor {
    fn default() -> Self {
        Self::new(Executor::new("bats"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_flag_is_always_first() {
        let args = BatsExecutor::tap_args(&["suite.bats".to_owned()]);
        assert_eq!(args, vec!["--tap", "suite.bats"]);
    }
}
