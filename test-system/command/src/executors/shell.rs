use std::path::Path;

use chrono::Utc;
use test_system_shared::models::CommandResult;

use super::{ExecStats, Executor};
use crate::CommandError;

/// Runs shell scripts through `bash`.
pub struct ShellExecutor {
    inner: Executor,
}

impl ShellExecutor {
    #[must_use]
    pub fn new(inner: Executor) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn default_binary() -> Executor {
        Executor::new("bash")
    }

    pub async fn run_local(
        &mut self,
        args: &[String],
        workdir: Option<&Path>,
    ) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let result = self.inner.run_local_command(args, workdir).await;
        self.inner.record_stage("run_local_script", started);
        result
    }

    pub async fn run_ssh(&mut self, args: &[String]) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let result = self.inner.run_ssh_command(args).await;
        self.inner.record_stage("run_ssh_script", started);
        result
    }

    #[must_use]
    pub fn exec_stats(&self) -> &ExecStats {
        self.inner.exec_stats()
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(Self::default_binary())
    }
}
