//! Container driver.

use std::time::Duration;

use test_system_command::container::ContainerExec;
use tracing::info;

use super::{DriverKind, EnvironmentDriver, RunnerCtx, resolve_pkg_manager};
use crate::{
    errors::RunnerError,
    templates::{DockerMainParams, TemplateRenderer, docker_platform},
};

const CONTAINER_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(600);

pub struct DockerDriver;

#[async_trait::async_trait]
impl EnvironmentDriver for DockerDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Docker
    }

    fn tf_main_file(&self) -> &'static str {
        "docker.tf"
    }

    fn render_main(
        &self,
        renderer: &TemplateRenderer,
        ctx: &RunnerCtx<'_>,
    ) -> Result<(), RunnerError> {
        let image_platform = docker_platform(&ctx.dist.arch).ok_or_else(|| {
            RunnerError::WorkDirPreparation(
                format!("cannot get image platform for architecture {}", ctx.dist.arch).into(),
            )
        })?;
        let params = DockerMainParams {
            container_name: ctx.env_name,
            image_name: format!("{}:{}", ctx.dist.name, ctx.dist.version),
            image_platform,
            external_network: std::env::var("EXTERNAL_NETWORK").ok(),
            http_proxy: std::env::var("http_proxy").ok(),
            https_proxy: std::env::var("https_proxy").ok(),
            no_proxy: std::env::var("no_proxy").ok(),
        };
        renderer
            .render_docker_main(&params, &ctx.work_dir.join(self.tf_main_file()))
            .map_err(|source| RunnerError::WorkDirPreparation(source.into()))
    }

    /// Debian-family images ship without a Python interpreter, which the
    /// provisioning play requires on the target; bootstrap it with the
    /// guest's own package manager before any ansible run.
    async fn pre_provision(&self, ctx: &RunnerCtx<'_>) -> Result<(), RunnerError> {
        if !ctx
            .config
            .debian_flavors
            .iter()
            .any(|flavor| flavor == &ctx.dist.name)
        {
            return Ok(());
        }
        let pkg_manager = resolve_pkg_manager(ctx.dist, ctx.config)?;
        info!(env = %ctx.env_name, "installing python3 package inside the container");

        let exec = ContainerExec::new(ctx.env_name, CONTAINER_BOOTSTRAP_TIMEOUT);
        let update = exec
            .run([pkg_manager.as_str(), "update"], Some(ctx.work_dir))
            .await
            .map_err(|source| RunnerError::Provision {
                reason: source.to_string(),
            })?;
        if !update.success() {
            return Err(RunnerError::Provision {
                reason: format!("cannot update metadata: {}", update.stderr),
            });
        }

        let install = exec
            .run(
                [pkg_manager.as_str(), "install", "-y", "python3"],
                Some(ctx.work_dir),
            )
            .await
            .map_err(|source| RunnerError::Provision {
                reason: source.to_string(),
            })?;
        if !install.success() {
            return Err(RunnerError::Provision {
                reason: format!("cannot install package python3: {}", install.stderr),
            });
        }
        info!(env = %ctx.env_name, "python3 installation is completed");
        Ok(())
    }
}
