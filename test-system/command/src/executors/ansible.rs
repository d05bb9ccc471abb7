use std::path::Path;

use chrono::Utc;
use test_system_shared::models::CommandResult;

use super::{ExecStats, Executor};
use crate::{CommandError, ssh::SshParams};

/// Drives `ansible-playbook`, injecting inventory, user and env flags so a
/// remote host can run the play against itself.
pub struct AnsibleExecutor {
    inner: Executor,
    ansible_host: String,
    ansible_user: String,
}

impl AnsibleExecutor {
    #[must_use]
    pub fn new(inner: Executor) -> Self {
        Self {
            inner,
            ansible_host: "localhost".to_owned(),
            ansible_user: "root".to_owned(),
        }
    }

    /// Binds the executor to a remote host; plays run there over SSH against
    /// the host itself.
    pub fn over_ssh(inner: Executor, params: SshParams) -> std::io::Result<Self> {
        let ansible_host = params.host.clone();
        let ansible_user = params
            .username
            .clone()
            .unwrap_or_else(|| "root".to_owned());
        Ok(Self {
            inner: inner.with_ssh(params)?,
            ansible_host,
            ansible_user,
        })
    }

    fn construct_args(&self, cmd_args: &[String]) -> Vec<String> {
        let mut args = vec![
            "-i".to_owned(),
            format!("{},", self.ansible_host),
            "-u".to_owned(),
            self.ansible_user.clone(),
        ];
        if !self.inner.env_vars().is_empty() {
            let env_vars = serde_json::to_string(self.inner.env_vars())
                .unwrap_or_else(|_| String::from("{}"));
            args.push("-e".to_owned());
            args.push(env_vars);
        }
        args.extend_from_slice(cmd_args);
        args
    }

    pub async fn run_local(
        &mut self,
        cmd_args: &[String],
        workdir: Option<&Path>,
    ) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let args = self.construct_args(cmd_args);
        let result = self.inner.run_local_command(&args, workdir).await;
        self.inner.record_stage("run_local_ansible", started);
        result
    }

    pub async fn run_ssh(&mut self, cmd_args: &[String]) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let args = self.construct_args(cmd_args);
        let result = self.inner.run_ssh_command(&args).await;
        self.inner.record_stage("run_ssh_ansible", started);
        result
    }

    #[must_use]
    pub fn exec_stats(&self) -> &ExecStats {
        self.inner.exec_stats()
    }
}

impl Default for AnsibleExecutor {
    fn default() -> Self {
        Self::new(Executor::new("ansible-playbook"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn injects_inventory_and_user() {
        let executor = AnsibleExecutor::default();
        let args = executor.construct_args(&["playbook.yml".to_owned()]);
        assert_eq!(args, vec!["-i", "localhost,", "-u", "root", "playbook.yml"]);
    }

    #[test]
    fn env_vars_are_passed_as_extra_vars() {
        let env_vars = BTreeMap::from([("pkg_name".to_owned(), "zsh".to_owned())]);
        let executor = AnsibleExecutor::new(
            Executor::new("ansible-playbook").with_env_vars(env_vars),
        );
        let args = executor.construct_args(&["playbook.yml".to_owned()]);
        assert_eq!(args[4], "-e");
        assert!(args[5].contains("\"pkg_name\":\"zsh\""));
    }
}
