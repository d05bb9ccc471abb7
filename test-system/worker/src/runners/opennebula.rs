//! VM driver backed by the OpenNebula provider.

use std::time::Duration;

use test_system_command::local::LocalCommand;
use test_system_shared::models::CommandResult;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::{DriverKind, EnvironmentDriver, RunnerCtx};
use crate::{
    assets,
    errors::RunnerError,
    templates::{
        OpennebulaMainParams, OpennebulaVarsParams, TemplateRenderer, opennebula_template_regex,
    },
};

const TF_VARIABLES_FILE: &str = "opennebula.tfvars";
const TF_OUTPUT_TIMEOUT: Duration = Duration::from_secs(60);
const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(120);
const SSH_WAIT_RETRIES: u32 = 60;
const SSH_WAIT_INTERVAL: Duration = Duration::from_secs(10);

pub struct OpennebulaDriver;

#[async_trait::async_trait]
impl EnvironmentDriver for OpennebulaDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Opennebula
    }

    fn tf_main_file(&self) -> &'static str {
        "opennebula.tf"
    }

    fn tf_variables_file(&self) -> Option<&'static str> {
        Some(TF_VARIABLES_FILE)
    }

    fn render_main(
        &self,
        renderer: &TemplateRenderer,
        ctx: &RunnerCtx<'_>,
    ) -> Result<(), RunnerError> {
        let template_regex = opennebula_template_regex(
            &ctx.dist.name,
            &ctx.dist.version,
            &ctx.dist.arch,
            None,
            &ctx.config.allowed_channel_names,
        );
        let ssh_public_key = read_ssh_public_key(&ctx.config.ssh_public_key_path);
        let network = Some(ctx.config.opennebula.network.as_str()).filter(|net| !net.is_empty());
        let params = OpennebulaMainParams {
            vm_name: ctx.env_name,
            vm_group: &ctx.config.opennebula.vm_group,
            network,
            template_regex,
            ssh_public_key: &ssh_public_key,
        };
        renderer
            .render_opennebula_main(&params, &ctx.work_dir.join(self.tf_main_file()))
            .map_err(|source| RunnerError::WorkDirPreparation(source.into()))
    }

    fn render_vars(
        &self,
        renderer: &TemplateRenderer,
        ctx: &RunnerCtx<'_>,
    ) -> Result<(), RunnerError> {
        let provider = &ctx.config.opennebula;
        let params = OpennebulaVarsParams {
            rpc_endpoint: &provider.rpc_endpoint,
            username: &provider.username,
            password: &provider.password,
        };
        renderer
            .render_opennebula_vars(&params, &ctx.work_dir.join(TF_VARIABLES_FILE))
            .map_err(|source| RunnerError::WorkDirPreparation(source.into()))
    }

    /// A no-match on the template catalog surfaces as an invalid index into
    /// the templates data source; report it with the search parameters
    /// instead of a bare apply failure.
    fn interpret_start_failure(
        &self,
        ctx: &RunnerCtx<'_>,
        result: &CommandResult,
    ) -> RunnerError {
        let stderr = &result.stderr;
        if stderr.contains("opennebula_templates")
            && (stderr.contains("Invalid index") || stderr.contains("no templates"))
        {
            let params = format!(
                "distribution: {}, dist version: {}, architecture: {}, channels: {}",
                ctx.dist.name,
                ctx.dist.version,
                ctx.dist.arch,
                ctx.config.allowed_channel_names.join("|")
            );
            return RunnerError::VmImageNotFound { params };
        }
        RunnerError::StartEnvironment {
            reason: "terraform apply failed".to_owned(),
        }
    }

    /// The VM gets its address only after deploy; the descriptor defines the
    /// `vm_ip` output for exactly this lookup.
    async fn discover_address(&self, ctx: &RunnerCtx<'_>) -> Result<Option<String>, RunnerError> {
        let result = LocalCommand::new("terraform", TF_OUTPUT_TIMEOUT)
            .run(["output", "-raw", "vm_ip"], Some(ctx.work_dir))
            .await
            .map_err(|source| RunnerError::StartEnvironment {
                reason: source.to_string(),
            })?;
        if !result.success() {
            let reason = format!("cannot get VM IP: {}", result.stderr);
            error!(env = %ctx.env_name, "{reason}");
            return Err(RunnerError::StartEnvironment { reason });
        }
        Ok(Some(result.stdout.trim().to_owned()))
    }

    /// Polls SSH reachability through an ansible ping probe with a bounded
    /// retry budget.
    async fn await_ready(&self, ctx: &RunnerCtx<'_>) -> Result<(), RunnerError> {
        info!(env = %ctx.env_name, "waiting for the SSH port to be available");
        let probe = LocalCommand::new("ansible", SSH_PROBE_TIMEOUT);
        let args = [
            "-i",
            assets::ANSIBLE_INVENTORY_FILE,
            "-m",
            "ping",
            "all",
        ];
        let mut last_stdout = String::new();
        let mut last_stderr = String::new();
        for attempt in 1..=SSH_WAIT_RETRIES {
            let result = probe.run(args, Some(ctx.work_dir)).await.map_err(|source| {
                RunnerError::StartEnvironment {
                    reason: source.to_string(),
                }
            })?;
            if result.success() {
                info!(env = %ctx.env_name, attempt, "machine is available for SSH connection");
                return Ok(());
            }
            last_stdout = result.stdout;
            last_stderr = result.stderr;
            sleep(SSH_WAIT_INTERVAL).await;
        }
        error!(
            env = %ctx.env_name,
            stdout = %last_stdout,
            stderr = %last_stderr,
            "unable to connect to the VM"
        );
        Err(RunnerError::StartEnvironment {
            reason: format!(
                "machine {} is started, but SSH connection is not working",
                ctx.env_name
            ),
        })
    }
}

fn read_ssh_public_key(path: &str) -> String {
    match std::fs::read_to_string(path) {
        Ok(key) => key.trim().to_owned(),
        Err(error) => {
            warn!(path, error = %error, "SSH key is missing");
            String::new()
        }
    }
}
