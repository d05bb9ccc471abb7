//! Broker-facing task entry point.

use std::sync::Arc;

use test_system_shared::{config::WorkerConfig, models::TaskMessage, models::TaskSummary};
use tracing::{error, info};

use crate::{
    runners::{DistInfo, DriverKind, ModuleStream, TestEnvironment, driver_for},
    uploader::ArtifactsUploader,
};

/// Result of one processed task: the per-stage summary and whether the
/// pipeline failed along the way.
#[derive(Debug)]
pub struct TaskOutcome {
    pub summary: TaskSummary,
    pub failed: bool,
}

/// Runs the full pipeline for one queue message: setup, package install and
/// an unconditional teardown with artifact publication.
///
/// Malformed messages are logged and dropped; the broker records no result
/// for them.
pub async fn run_tests(
    message: TaskMessage,
    config: Arc<WorkerConfig>,
    uploader: Arc<dyn ArtifactsUploader>,
) -> Option<TaskOutcome> {
    info!(message = ?message, "starting work on a test task");
    if let Some(field) = message.missing_field() {
        error!(field, "parameter is not specified");
        return None;
    }

    let task_id = message.task_id.clone().unwrap_or_default();
    let runner_type = message.runner_type.clone().unwrap_or_default();
    let kind: DriverKind = match runner_type.parse() {
        Ok(kind) => kind,
        Err(error) => {
            error!(task_id = %task_id, error = %error, "cannot select a runner");
            return None;
        }
    };

    let dist = DistInfo::new(
        message.dist_name.as_deref().unwrap_or_default(),
        message.dist_version.as_deref().unwrap_or_default(),
        message.dist_arch.as_deref().unwrap_or("x86_64"),
    );
    let repositories = message.repositories.clone().unwrap_or_default();
    let package_name = message.package_name.clone().unwrap_or_default();

    let mut runner = match TestEnvironment::new(
        driver_for(kind),
        &task_id,
        dist,
        repositories,
        config,
        uploader,
    ) {
        Ok(runner) => runner,
        Err(error) => {
            error!(task_id = %task_id, error = %error, "cannot construct the runner");
            return None;
        }
    };

    let module = match (
        &message.module_name,
        &message.module_stream,
        &message.module_version,
    ) {
        (Some(name), Some(stream), Some(version)) => Some(ModuleStream {
            name: name.clone(),
            stream: stream.clone(),
            version: version.clone(),
        }),
        _ => None,
    };

    let pipeline = async {
        runner.setup().await?;
        runner
            .install_package(
                &package_name,
                message.package_version.as_deref(),
                module.as_ref(),
            )
            .await
    };
    let outcome = pipeline.await;
    let failed = outcome.is_err();
    if let Err(error) = outcome {
        error!(task_id = %task_id, error = %error, "task pipeline failed");
    }
    runner.teardown(true).await;

    Some(TaskOutcome {
        summary: runner.artifacts().summary(),
        failed,
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, path::Path};

    use async_trait::async_trait;
    use test_system_shared::models::NormalizedRepository;

    use super::*;
    use crate::errors::UploadError;

    struct NullUploader;

    #[async_trait]
    impl ArtifactsUploader for NullUploader {
        async fn upload(
            &self,
            _artifacts_dir: &Path,
            _upload_dir: &str,
        ) -> Result<BTreeMap<String, String>, UploadError> {
            Ok(BTreeMap::new())
        }
    }

    fn config() -> Arc<WorkerConfig> {
        Arc::new(
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
            .unwrap(),
        )
    }

    fn valid_message() -> TaskMessage {
        TaskMessage {
            task_id: Some("11111111-1111-4111-8111-111111111111".into()),
            runner_type: Some("docker".into()),
            dist_name: Some("almalinux".into()),
            dist_version: Some("8".into()),
            dist_arch: Some("x86_64".into()),
            repositories: Some(vec![NormalizedRepository {
                name: "repo-0".into(),
                url: "http://r1".into(),
            }]),
            package_name: Some("zsh".into()),
            ..TaskMessage::default()
        }
    }

    #[tokio::test]
    async fn missing_fields_drop_the_message() {
        let mut message = valid_message();
        message.repositories = None;
        let outcome = run_tests(message, config(), Arc::new(NullUploader)).await;
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn unknown_runner_type_drops_the_message() {
        let mut message = valid_message();
        message.runner_type = Some("vagrant".into());
        let outcome = run_tests(message, config(), Arc::new(NullUploader)).await;
        assert!(outcome.is_none());
    }
}
