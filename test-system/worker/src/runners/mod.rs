//! Per-task environment lifecycle.
//!
//! A [`TestEnvironment`] owns one ephemeral environment for the duration of
//! one task and drives it through a fixed stage sequence. Each stage's
//! `(exit_code, stdout, stderr)` is captured into the artifacts mapping
//! before the stage may raise, so diagnostics survive every failure.

pub mod docker;
pub mod opennebula;

use std::{
    collections::BTreeMap,
    fs::File,
    io::Write as _,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    thread,
    time::Duration,
};

use flate2::{Compression, write::GzEncoder};
use fs2::FileExt as _;
pub use docker::DockerDriver;
pub use opennebula::OpennebulaDriver;
use serde::Serialize;
use tempfile::TempDir;
use test_system_command::{CommandError, local::LocalCommand};
use test_system_shared::{
    config::WorkerConfig,
    models::{CommandResult, NormalizedRepository, StageOutcome, TaskSummary},
    queues::{ArchClass, CONTAINER_ARCHITECTURES_MAPPING, FULL_ARCHITECTURES_MAPPING},
};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    assets,
    errors::{RunnerError, UploadError},
    templates::{InventoryParams, TemplateRenderer},
    uploader::ArtifactsUploader,
};

const TF_INIT_LOCK_PATH: &str = "/tmp/tf_init_lock";
const TF_INIT_LOCK_POLL: Duration = Duration::from_secs(1);
const TERRAFORM_TIMEOUT: Duration = Duration::from_secs(1800);
const ANSIBLE_TIMEOUT: Duration = Duration::from_secs(3600);
const INTEGRITY_TESTS_TIMEOUT: Duration = Duration::from_secs(3600);

/// Reserved artifacts section holding individual test outcomes.
pub const TESTS_SECTION_NAME: &str = "tests";

/// Which backend provides the ephemeral environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriverKind {
    Docker,
    Opennebula,
}

#[derive(Debug, Error)]
#[error("unknown runner type: {0}")]
pub struct UnknownDriver(pub String);

impl FromStr for DriverKind {
    type Err = UnknownDriver;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "docker" => Ok(Self::Docker),
            "opennebula" => Ok(Self::Opennebula),
            other => Err(UnknownDriver(other.to_owned())),
        }
    }
}

impl DriverKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Opennebula => "opennebula",
        }
    }

    /// Queue cost: containers are cheap, VMs are not.
    #[must_use]
    pub fn cost(self) -> u8 {
        match self {
            Self::Docker => 0,
            Self::Opennebula => 1,
        }
    }

    #[must_use]
    pub fn connection_type(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Opennebula => "ssh",
        }
    }

    #[must_use]
    pub fn work_dir_prefix(self) -> &'static str {
        match self {
            Self::Docker => "docker_test_runner_",
            Self::Opennebula => "opennebula_test_runner_",
        }
    }

    /// Architecture equivalence classes this driver can serve.
    #[must_use]
    pub fn arch_classes(self) -> &'static [ArchClass] {
        match self {
            Self::Docker => &CONTAINER_ARCHITECTURES_MAPPING,
            Self::Opennebula => &FULL_ARCHITECTURES_MAPPING,
        }
    }
}

/// Static registry mapping a driver kind to its backend.
#[must_use]
pub fn driver_for(kind: DriverKind) -> Box<dyn EnvironmentDriver> {
    match kind {
        DriverKind::Docker => Box::new(DockerDriver),
        DriverKind::Opennebula => Box::new(OpennebulaDriver),
    }
}

/// Lowercased distribution coordinates for the environment under test.
#[derive(Clone, Debug)]
pub struct DistInfo {
    pub name: String,
    pub version: String,
    pub arch: String,
}

impl DistInfo {
    #[must_use]
    pub fn new(name: &str, version: &str, arch: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            version: version.to_lowercase(),
            arch: arch.to_lowercase(),
        }
    }
}

/// Module stream coordinates for modular RHEL-family content.
#[derive(Clone, Debug)]
pub struct ModuleStream {
    pub name: String,
    pub stream: String,
    pub version: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PkgManager {
    Dnf,
    Yum,
    AptGet,
}

impl PkgManager {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::AptGet => "apt-get",
        }
    }

    /// Separator between package name and version on the install line.
    #[must_use]
    pub fn version_separator(self) -> char {
        match self {
            Self::Dnf | Self::Yum => '-',
            Self::AptGet => '=',
        }
    }
}

/// Resolves the in-guest package manager for a distribution.
pub fn resolve_pkg_manager(dist: &DistInfo, config: &WorkerConfig) -> Result<PkgManager, RunnerError> {
    let is_rhel_flavor = config.rhel_flavors.iter().any(|flavor| flavor == &dist.name);
    if dist.name == "fedora" || (is_rhel_flavor && dist.version.starts_with('8')) {
        return Ok(PkgManager::Dnf);
    }
    if is_rhel_flavor {
        return Ok(PkgManager::Yum);
    }
    if config.debian_flavors.iter().any(|flavor| flavor == &dist.name) {
        return Ok(PkgManager::AptGet);
    }
    Err(RunnerError::UnknownDistribution(dist.name.clone()))
}

/// Captured stage outputs for one task; the reserved `tests` section nests
/// individual test outcomes.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Artifacts {
    stages: BTreeMap<String, CommandResult>,
    tests: BTreeMap<String, CommandResult>,
}

impl Artifacts {
    pub fn record_stage(&mut self, label: &str, result: &CommandResult) {
        self.stages.insert(label.to_owned(), result.clone());
    }

    pub fn record_test(&mut self, label: &str, result: &CommandResult) {
        self.tests.insert(label.to_owned(), result.clone());
    }

    #[must_use]
    pub fn stages(&self) -> &BTreeMap<String, CommandResult> {
        &self.stages
    }

    #[must_use]
    pub fn tests(&self) -> &BTreeMap<String, CommandResult> {
        &self.tests
    }

    /// Stage label -> success mapping for the worker's task summary.
    #[must_use]
    pub fn summary(&self) -> TaskSummary {
        self.stages
            .iter()
            .map(|(label, result)| {
                (
                    label.clone(),
                    StageOutcome {
                        success: result.success(),
                    },
                )
            })
            .collect()
    }
}

/// Paths and identity handed to driver hooks.
pub struct RunnerCtx<'a> {
    pub work_dir: &'a Path,
    pub env_name: &'a str,
    pub dist: &'a DistInfo,
    pub config: &'a WorkerConfig,
}

/// Driver-specific pieces the pipeline composes: rendering, address
/// discovery, readiness and provisioning hooks.
#[async_trait::async_trait]
pub trait EnvironmentDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Main declarative descriptor file name, e.g. `docker.tf`.
    fn tf_main_file(&self) -> &'static str;

    /// Variables file passed with `--var-file`, when the driver has one.
    fn tf_variables_file(&self) -> Option<&'static str> {
        None
    }

    fn render_main(
        &self,
        renderer: &TemplateRenderer,
        ctx: &RunnerCtx<'_>,
    ) -> Result<(), RunnerError>;

    fn render_vars(
        &self,
        renderer: &TemplateRenderer,
        ctx: &RunnerCtx<'_>,
    ) -> Result<(), RunnerError> {
        let _ = (renderer, ctx);
        Ok(())
    }

    /// Address discovery after the environment is applied; VM drivers read
    /// the provisioned address here.
    async fn discover_address(&self, ctx: &RunnerCtx<'_>) -> Result<Option<String>, RunnerError> {
        let _ = ctx;
        Ok(None)
    }

    /// Waits until the environment accepts commands; VM drivers poll SSH
    /// reachability with a bounded retry budget.
    async fn await_ready(&self, ctx: &RunnerCtx<'_>) -> Result<(), RunnerError> {
        let _ = ctx;
        Ok(())
    }

    /// Runs before the first ansible invocation against the environment.
    async fn pre_provision(&self, ctx: &RunnerCtx<'_>) -> Result<(), RunnerError> {
        let _ = ctx;
        Ok(())
    }

    /// Maps a failed environment start onto the driver's most specific
    /// error.
    fn interpret_start_failure(
        &self,
        ctx: &RunnerCtx<'_>,
        result: &CommandResult,
    ) -> RunnerError {
        let _ = (ctx, result);
        RunnerError::StartEnvironment {
            reason: "terraform apply failed".to_owned(),
        }
    }
}

/// Drives the full environment lifecycle for one task.
pub struct TestEnvironment {
    task_id: String,
    env_name: String,
    driver: Box<dyn EnvironmentDriver>,
    dist: DistInfo,
    repositories: Vec<NormalizedRepository>,
    config: Arc<WorkerConfig>,
    renderer: TemplateRenderer,
    uploader: Arc<dyn ArtifactsUploader>,
    work_dir: Option<TempDir>,
    artifacts_dir: Option<PathBuf>,
    integrity_tests_dir: Option<PathBuf>,
    vm_ip: Option<String>,
    artifacts: Artifacts,
    uploaded_logs: BTreeMap<String, String>,
    env_stopped: bool,
}

impl TestEnvironment {
    pub fn new(
        driver: Box<dyn EnvironmentDriver>,
        task_id: impl Into<String>,
        dist: DistInfo,
        repositories: Vec<NormalizedRepository>,
        config: Arc<WorkerConfig>,
        uploader: Arc<dyn ArtifactsUploader>,
    ) -> Result<Self, RunnerError> {
        let task_id = task_id.into();
        let env_name = format!("{}_{}", driver.kind().as_str(), task_id);
        let renderer = TemplateRenderer::new()
            .map_err(|source| RunnerError::WorkDirPreparation(source.into()))?;
        Ok(Self {
            task_id,
            env_name,
            driver,
            dist,
            repositories,
            config,
            renderer,
            uploader,
            work_dir: None,
            artifacts_dir: None,
            integrity_tests_dir: None,
            vm_ip: None,
            artifacts: Artifacts::default(),
            uploaded_logs: BTreeMap::new(),
            env_stopped: false,
        })
    }

    #[must_use]
    pub fn env_name(&self) -> &str {
        &self.env_name
    }

    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    #[must_use]
    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    #[must_use]
    pub fn uploaded_logs(&self) -> &BTreeMap<String, String> {
        &self.uploaded_logs
    }

    #[must_use]
    pub fn vm_ip(&self) -> Option<&str> {
        self.vm_ip.as_deref()
    }

    /// Path of the live work dir, while one exists.
    #[must_use]
    pub fn work_dir_path(&self) -> Option<&Path> {
        self.work_dir.as_ref().map(TempDir::path)
    }

    pub fn pkg_manager(&self) -> Result<PkgManager, RunnerError> {
        resolve_pkg_manager(&self.dist, &self.config)
    }

    fn ctx(&self) -> Result<RunnerCtx<'_>, RunnerError> {
        let work_dir = self.work_dir.as_ref().ok_or_else(missing_work_dir)?;
        Ok(RunnerCtx {
            work_dir: work_dir.path(),
            env_name: &self.env_name,
            dist: &self.dist,
            config: &self.config,
        })
    }

    /// Records the stage artifact, then either returns the result or raises
    /// the stage's typed error on a non-zero exit code.
    fn finish_stage(
        &mut self,
        label: &str,
        result: CommandResult,
        stage_error: impl FnOnce() -> RunnerError,
    ) -> Result<CommandResult, RunnerError> {
        self.artifacts.record_stage(label, &result);
        if result.success() {
            info!(stage = label, env = %self.env_name, "operation completed successfully");
            Ok(result)
        } else {
            error!(
                stage = label,
                env = %self.env_name,
                exit_code = result.exit_code,
                stderr = %result.stderr,
                "stage failed"
            );
            Err(stage_error())
        }
    }

    async fn terraform(&self, args: &[String]) -> Result<CommandResult, CommandError> {
        let work_dir = self
            .work_dir
            .as_ref()
            .expect("terraform stages run after work dir preparation");
        debug!(args = ?args, "running terraform");
        LocalCommand::new("terraform", TERRAFORM_TIMEOUT)
            .run(args, Some(work_dir.path()))
            .await
    }

    fn render_inventory(&mut self, vm_ip: Option<&str>) -> Result<(), RunnerError> {
        let work_dir = self.work_dir.as_ref().ok_or_else(missing_work_dir)?;
        let destination = work_dir.path().join(assets::ANSIBLE_INVENTORY_FILE);
        self.renderer
            .render_inventory(
                &InventoryParams {
                    env_name: &self.env_name,
                    connection_type: self.driver.kind().connection_type(),
                    vm_ip,
                },
                &destination,
            )
            .map_err(|source| RunnerError::WorkDirPreparation(source.into()))
    }

    /// Stage 1: scaffold the work dir with the static assets, the integrity
    /// tests tree and the rendered descriptors.
    pub async fn prepare_work_dir_files(&mut self) -> Result<(), RunnerError> {
        let prep = |source: std::io::Error| RunnerError::WorkDirPreparation(source.into());

        let work_dir = tempfile::Builder::new()
            .prefix(self.driver.kind().work_dir_prefix())
            .tempdir()
            .map_err(prep)?;
        let artifacts_dir = work_dir.path().join("artifacts");
        std::fs::create_dir_all(&artifacts_dir).map_err(prep)?;
        assets::write_ansible_files(work_dir.path()).map_err(prep)?;
        assets::write_versions_file(work_dir.path(), self.driver.kind()).map_err(prep)?;
        let integrity_tests_dir = assets::write_integrity_tests(work_dir.path()).map_err(prep)?;

        self.work_dir = Some(work_dir);
        self.artifacts_dir = Some(artifacts_dir);
        self.integrity_tests_dir = Some(integrity_tests_dir);

        self.render_inventory(None)?;
        let ctx = self.ctx()?;
        self.driver.render_main(&self.renderer, &ctx)?;
        self.driver.render_vars(&self.renderer, &ctx)?;

        info!(
            env = %self.env_name,
            work_dir = %self.ctx()?.work_dir.display(),
            "working directory prepared"
        );
        Ok(())
    }

    /// Stage 2: `terraform init` under a cross-process advisory lock; a
    /// concurrent init would corrupt the shared provider plugin cache.
    pub async fn initialize_terraform(&mut self) -> Result<(), RunnerError> {
        if self.work_dir.is_none() {
            return Err(missing_work_dir());
        }
        info!(env = %self.env_name, "initializing terraform environment");
        let lock = acquire_tf_init_lock().await.map_err(|source| {
            error!(error = %source, "cannot take the terraform init lock");
            RunnerError::TerraformInitialization
        })?;
        let outcome = self.terraform(&["init".to_owned()]).await;
        drop(lock);
        let result = outcome.map_err(|source| {
            error!(error = %source, "terraform init could not run");
            RunnerError::TerraformInitialization
        })?;
        self.finish_stage("initialize_terraform", result, || {
            RunnerError::TerraformInitialization
        })
        .map(drop)
    }

    /// Stage 3: `terraform apply`, then driver address discovery and the
    /// readiness wait.
    pub async fn start_env(&mut self) -> Result<(), RunnerError> {
        if self.work_dir.is_none() {
            return Err(missing_work_dir());
        }
        info!(env = %self.env_name, "starting the environment");
        let mut args = vec!["apply".to_owned(), "--auto-approve".to_owned()];
        if let Some(vars_file) = self.driver.tf_variables_file() {
            args.push("--var-file".to_owned());
            args.push(vars_file.to_owned());
        }
        let result = self.terraform(&args).await.map_err(|source| {
            error!(error = %source, "terraform apply could not run");
            RunnerError::StartEnvironment {
                reason: source.to_string(),
            }
        })?;
        self.artifacts.record_stage("start_environment", &result);
        if !result.success() {
            error!(
                env = %self.env_name,
                exit_code = result.exit_code,
                stderr = %result.stderr,
                "cannot start environment"
            );
            return Err(self.driver.interpret_start_failure(&self.ctx()?, &result));
        }
        info!(stage = "start_environment", env = %self.env_name, "operation completed successfully");

        let address = self.driver.discover_address(&self.ctx()?).await?;
        if let Some(address) = address {
            self.render_inventory(Some(&address))?;
            self.vm_ip = Some(address);
        }
        self.driver.await_ready(&self.ctx()?).await?;
        Ok(())
    }

    async fn ansible_playbook(
        &self,
        extra_vars: &[String],
        tag: &str,
    ) -> Result<CommandResult, CommandError> {
        let work_dir = self
            .work_dir
            .as_ref()
            .expect("ansible stages run after work dir preparation");
        let mut args = vec![
            "-i".to_owned(),
            assets::ANSIBLE_INVENTORY_FILE.to_owned(),
            assets::ANSIBLE_PLAYBOOK.to_owned(),
        ];
        for var in extra_vars {
            args.push("-e".to_owned());
            args.push(var.clone());
        }
        args.push("-t".to_owned());
        args.push(tag.to_owned());
        debug!(args = ?args, "running ansible-playbook");
        LocalCommand::new("ansible-playbook", ANSIBLE_TIMEOUT)
            .run(&args, Some(work_dir.path()))
            .await
    }

    /// Stage 4: driver pre-provision hook, then the provisioning play with
    /// the repositories and the integrity-tests path as extra vars.
    pub async fn initial_provision(&mut self) -> Result<(), RunnerError> {
        if self.work_dir.is_none() {
            return Err(missing_work_dir());
        }
        self.driver.pre_provision(&self.ctx()?).await?;

        let extra_vars = serde_json::json!({
            "repositories": self.repositories,
            "integrity_tests_dir": self
                .integrity_tests_dir
                .as_ref()
                .map(|path| path.display().to_string()),
        })
        .to_string();
        info!(env = %self.env_name, "provisioning the environment");
        let result = self
            .ansible_playbook(&[extra_vars], "initial_provision")
            .await
            .map_err(|source| {
                error!(error = %source, "initial provision could not run");
                RunnerError::Provision {
                    reason: source.to_string(),
                }
            })?;
        self.finish_stage("initial_provision", result, || RunnerError::Provision {
            reason: "initial provision playbook failed".to_owned(),
        })
        .map(drop)
    }

    /// Stage 5: install the package under test, versioned per the guest's
    /// package manager conventions.
    pub async fn install_package(
        &mut self,
        package_name: &str,
        package_version: Option<&str>,
        module: Option<&ModuleStream>,
    ) -> Result<(), RunnerError> {
        if self.work_dir.is_none() {
            return Err(missing_work_dir());
        }
        let pkg_manager = self.pkg_manager()?;
        let full_pkg_name = match package_version {
            Some(version) => format!(
                "{package_name}{}{version}",
                pkg_manager.version_separator()
            ),
            None => package_name.to_owned(),
        };
        info!(package = %full_pkg_name, env = %self.env_name, "installing package");

        let mut extra_vars = vec![format!("pkg_name={full_pkg_name}")];
        if let Some(module) = module {
            extra_vars.push(format!("module_name={}", module.name));
            extra_vars.push(format!("module_stream={}", module.stream));
            extra_vars.push(format!("module_version={}", module.version));
        }
        let result = self
            .ansible_playbook(&extra_vars, "install_package")
            .await
            .map_err(|source| {
                error!(error = %source, "package install could not run");
                RunnerError::InstallPackage
            })?;
        self.finish_stage("install_package", result, || RunnerError::InstallPackage)
            .map(drop)
    }

    /// Stage 6: run the integrity suite against the inventory, writing TAP
    /// outputs into the artifacts dir. The outcome lands in the reserved
    /// `tests` section.
    pub async fn run_package_integrity_tests(
        &mut self,
        package_name: &str,
        package_version: Option<&str>,
    ) -> Result<(), RunnerError> {
        let work_dir = self.work_dir.as_ref().ok_or_else(missing_work_dir)?;
        let artifacts_dir = self.artifacts_dir.clone().ok_or_else(missing_work_dir)?;
        let integrity_tests_dir = self
            .integrity_tests_dir
            .clone()
            .ok_or_else(missing_work_dir)?;
        let inventory_path = work_dir.path().join(assets::ANSIBLE_INVENTORY_FILE);

        let mut args = vec![
            "--tap-stream".to_owned(),
            "--tap-files".to_owned(),
            "--tap-outdir".to_owned(),
            artifacts_dir.display().to_string(),
            "--hosts".to_owned(),
            "ansible://all".to_owned(),
            "--ansible-inventory".to_owned(),
            inventory_path.display().to_string(),
            "--package-name".to_owned(),
            package_name.to_owned(),
        ];
        if let Some(version) = package_version {
            args.push("--package-version".to_owned());
            args.push(version.to_owned());
        }
        args.push("tests".to_owned());

        info!(package = %package_name, env = %self.env_name, "running package integrity tests");
        let result = LocalCommand::new("py.test", INTEGRITY_TESTS_TIMEOUT)
            .run(&args, Some(&integrity_tests_dir))
            .await
            .map_err(|source| {
                error!(error = %source, "integrity tests could not run");
                RunnerError::PackageIntegrityTests
            })?;

        self.artifacts.record_test("package_integrity_tests", &result);
        if result.success() {
            info!(env = %self.env_name, "package integrity tests passed");
            Ok(())
        } else {
            error!(
                env = %self.env_name,
                exit_code = result.exit_code,
                stderr = %result.stderr,
                "package integrity tests failed"
            );
            Err(RunnerError::PackageIntegrityTests)
        }
    }

    /// Stage 7: write one gzip-compressed log per captured artifact and
    /// upload the directory to the per-task prefix.
    pub async fn publish_artifacts_to_storage(&mut self) -> Result<(), RunnerError> {
        let artifacts_dir = self.artifacts_dir.clone().ok_or_else(missing_work_dir)?;
        for (label, entry) in self.artifacts.stages() {
            write_compressed_log(&artifacts_dir, label, &self.task_id, entry)
                .map_err(RunnerError::PublishArtifacts)?;
        }
        for (label, entry) in self.artifacts.tests() {
            let base_name = format!("{TESTS_SECTION_NAME}_{label}");
            write_compressed_log(&artifacts_dir, &base_name, &self.task_id, entry)
                .map_err(RunnerError::PublishArtifacts)?;
        }

        let upload_dir = format!(
            "{}/{}",
            self.config.artifacts_root_directory.trim_matches('/'),
            self.task_id
        );
        let uploaded = self
            .uploader
            .upload(&artifacts_dir, &upload_dir)
            .await
            .map_err(RunnerError::PublishArtifacts)?;
        self.uploaded_logs = uploaded;
        Ok(())
    }

    /// Stage 8: `terraform destroy`. Skipped when the work dir is already
    /// gone or the environment was never started.
    pub async fn stop_env(&mut self) -> Result<(), RunnerError> {
        if self.work_dir.is_none() || self.env_stopped {
            return Ok(());
        }
        info!(env = %self.env_name, "destroying the environment");
        let mut args = vec!["destroy".to_owned(), "--auto-approve".to_owned()];
        if let Some(vars_file) = self.driver.tf_variables_file() {
            args.push("--var-file".to_owned());
            args.push(vars_file.to_owned());
        }
        let result = self.terraform(&args).await.map_err(|source| {
            error!(error = %source, "terraform destroy could not run");
            RunnerError::StopEnvironment
        })?;
        let outcome = self.finish_stage("stop_environment", result, || RunnerError::StopEnvironment);
        if outcome.is_ok() {
            self.env_stopped = true;
        }
        outcome.map(drop)
    }

    /// Stage 9: scoped release of the temp dir; removal must happen on every
    /// exit path.
    pub fn erase_work_dir(&mut self) {
        if let Some(work_dir) = self.work_dir.take() {
            info!("erasing working directory");
            if let Err(error) = work_dir.close() {
                error!(error = %error, "error while erasing working directory");
            } else {
                info!("working directory was successfully removed");
            }
        }
        self.artifacts_dir = None;
        self.integrity_tests_dir = None;
    }

    /// Stages 1-4.
    pub async fn setup(&mut self) -> Result<(), RunnerError> {
        self.prepare_work_dir_files().await?;
        self.initialize_terraform().await?;
        self.start_env().await?;
        self.initial_provision().await
    }

    /// Destroy before publish so the environment is released even when the
    /// upload is slow; every step is individually guarded so one failing
    /// step does not prevent the next.
    pub async fn teardown(&mut self, publish_artifacts: bool) {
        if let Err(error) = self.stop_env().await {
            error!(error = %error, env = %self.env_name, "teardown: environment destroy failed");
        }
        if publish_artifacts {
            if let Err(error) = self.publish_artifacts_to_storage().await {
                error!(error = %error, env = %self.env_name, "exception while publishing artifacts");
            }
        }
        self.erase_work_dir();
    }
}

impl Drop for TestEnvironment {
    /// Defensive cleanup for callers that forgot to tear down: destroy the
    /// environment from a blocking thread, then erase the work dir.
    fn drop(&mut self) {
        if self.work_dir.is_none() {
            return;
        }
        warn!(env = %self.env_name, "runner dropped without teardown; cleaning up");
        if !self.env_stopped {
            if let Some(work_dir) = &self.work_dir {
                let work_path = work_dir.path().to_path_buf();
                let mut args = vec!["destroy".to_owned(), "--auto-approve".to_owned()];
                if let Some(vars_file) = self.driver.tf_variables_file() {
                    args.push("--var-file".to_owned());
                    args.push(vars_file.to_owned());
                }
                let handle = thread::spawn(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build();
                    if let Ok(runtime) = runtime {
                        runtime.block_on(async {
                            let _ = LocalCommand::new("terraform", TERRAFORM_TIMEOUT)
                                .run(&args, Some(&work_path))
                                .await;
                        });
                    }
                });
                let _ = handle.join();
            }
        }
        self.erase_work_dir();
    }
}

fn missing_work_dir() -> RunnerError {
    RunnerError::WorkDirPreparation(Box::new(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "working directory does not exist",
    )))
}

struct TfInitLock {
    file: File,
}

impl Drop for TfInitLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Takes the process- and host-wide `terraform init` lock, polling at 1 Hz
/// while another init holds it.
async fn acquire_tf_init_lock() -> std::io::Result<TfInitLock> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(TF_INIT_LOCK_PATH)?;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(TfInitLock { file }),
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                sleep(TF_INIT_LOCK_POLL).await;
            }
            Err(error) => return Err(error),
        }
    }
}

fn write_compressed_log(
    artifacts_dir: &Path,
    file_base_name: &str,
    task_id: &str,
    entry: &CommandResult,
) -> Result<(), UploadError> {
    let path = artifacts_dir.join(format!("{file_base_name}_{task_id}.log"));
    let write_error = |source: std::io::Error| UploadError::WriteLog {
        file: path.display().to_string(),
        source,
    };

    let mut content = format!("Exit code: {}\nStdout:\n\n{}", entry.exit_code, entry.stdout);
    if !entry.stderr.is_empty() {
        content.push_str(&format!("Stderr:\n\n{}", entry.stderr));
    }

    let file = File::create(&path).map_err(write_error)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(content.as_bytes()).map_err(write_error)?;
    encoder.finish().map_err(write_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use super::*;

    fn config() -> WorkerConfig {
        serde_yaml::from_str(
            r"
rabbitmq_host: broker.local
rabbitmq_user: guest
rabbitmq_password: guest
rabbitmq_vhost: test_system
s3_access_key_id: key
s3_secret_access_key: secret
s3_bucket: artifacts
s3_region: eu-north-1
",
        )
        .unwrap()
    }

    #[test]
    fn pkg_manager_resolution_follows_flavor_and_version() {
        let config = config();
        let cases = [
            (("fedora", "36"), PkgManager::Dnf),
            (("almalinux", "8"), PkgManager::Dnf),
            (("almalinux", "9"), PkgManager::Yum),
            (("centos", "7"), PkgManager::Yum),
            (("ubuntu", "22.04"), PkgManager::AptGet),
            (("debian", "12"), PkgManager::AptGet),
        ];
        for ((name, version), expected) in cases {
            let dist = DistInfo::new(name, version, "x86_64");
            assert_eq!(resolve_pkg_manager(&dist, &config).unwrap(), expected);
        }

        let dist = DistInfo::new("slackware", "15", "x86_64");
        assert!(matches!(
            resolve_pkg_manager(&dist, &config),
            Err(RunnerError::UnknownDistribution(name)) if name == "slackware"
        ));
    }

    #[test]
    fn version_separator_matches_the_package_manager() {
        assert_eq!(PkgManager::Dnf.version_separator(), '-');
        assert_eq!(PkgManager::Yum.version_separator(), '-');
        assert_eq!(PkgManager::AptGet.version_separator(), '=');
    }

    #[test]
    fn driver_kind_round_trips_and_carries_costs() {
        assert_eq!("docker".parse::<DriverKind>().unwrap(), DriverKind::Docker);
        assert_eq!(
            "opennebula".parse::<DriverKind>().unwrap(),
            DriverKind::Opennebula
        );
        assert!("vagrant".parse::<DriverKind>().is_err());

        assert_eq!(DriverKind::Docker.cost(), 0);
        assert_eq!(DriverKind::Opennebula.cost(), 1);
        assert_eq!(DriverKind::Docker.connection_type(), "docker");
        assert_eq!(DriverKind::Opennebula.connection_type(), "ssh");
    }

    #[test]
    fn artifacts_summary_reflects_exit_codes() {
        let mut artifacts = Artifacts::default();
        artifacts.record_stage(
            "install_package",
            &CommandResult {
                exit_code: 0,
                stdout: "ok".into(),
                stderr: String::new(),
            },
        );
        artifacts.record_stage(
            "initial_provision",
            &CommandResult {
                exit_code: 2,
                stdout: String::new(),
                stderr: "boom".into(),
            },
        );
        artifacts.record_test(
            "package_integrity_tests",
            &CommandResult {
                exit_code: 0,
                stdout: "1..3".into(),
                stderr: String::new(),
            },
        );

        let summary = artifacts.summary();
        assert!(summary["install_package"].success);
        assert!(!summary["initial_provision"].success);
        assert_eq!(artifacts.tests().len(), 1);
    }

    #[test]
    fn compressed_logs_carry_exit_code_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let entry = CommandResult {
            exit_code: 1,
            stdout: "applied".into(),
            stderr: "denied".into(),
        };
        write_compressed_log(dir.path(), "start_environment", "t-1", &entry).unwrap();

        let compressed = std::fs::read(dir.path().join("start_environment_t-1.log")).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut content = String::new();
        decoder.read_to_string(&mut content).unwrap();

        assert!(content.starts_with("Exit code: 1\n"));
        assert!(content.contains("Stdout:\n\napplied"));
        assert!(content.contains("Stderr:\n\ndenied"));
    }

    #[tokio::test]
    async fn init_lock_is_mutually_exclusive() {
        let first = acquire_tf_init_lock().await.unwrap();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(TF_INIT_LOCK_PATH)
            .unwrap();
        assert!(file.try_lock_exclusive().is_err());
        drop(first);
        assert!(file.try_lock_exclusive().is_ok());
        let _ = fs2::FileExt::unlock(&file);
    }
}
