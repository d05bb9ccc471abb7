//! Command execution inside a driver-managed container.

use std::{
    ffi::{OsStr, OsString},
    path::Path,
    time::Duration,
};

use test_system_shared::models::CommandResult;

use crate::{CommandError, local::LocalCommand};

/// Runs commands inside a container via `docker exec <env_name> …`.
#[derive(Clone, Debug)]
pub struct ContainerExec {
    env_name: String,
    docker: LocalCommand,
}

impl ContainerExec {
    #[must_use]
    pub fn new(env_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            env_name: env_name.into(),
            docker: LocalCommand::new("docker", timeout),
        }
    }

    #[must_use]
    pub fn env_name(&self) -> &str {
        &self.env_name
    }

    pub async fn run<I, S>(
        &self,
        cmd_with_args: I,
        workdir: Option<&Path>,
    ) -> Result<CommandResult, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut args: Vec<OsString> = vec![OsString::from("exec"), OsString::from(&self.env_name)];
        args.extend(
            cmd_with_args
                .into_iter()
                .map(|arg| arg.as_ref().to_os_string()),
        );
        self.docker.run(args, workdir).await
    }
}
