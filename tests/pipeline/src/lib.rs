//! Shared fixtures for the end-to-end pipeline tests.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use async_trait::async_trait;
use test_system_shared::{
    config::WorkerConfig,
    models::NormalizedRepository,
};
use test_system_worker::{errors::UploadError, uploader::ArtifactsUploader};

/// Minimal worker config pointing at local test endpoints.
#[must_use]
pub fn worker_config() -> Arc<WorkerConfig> {
    Arc::new(
        serde_yaml::from_str(
            r"
rabbitmq_host: 127.0.0.1
rabbitmq_user: guest
rabbitmq_password: guest
rabbitmq_vhost: test_system
s3_access_key_id: key
s3_secret_access_key: secret
s3_bucket: artifacts
s3_region: eu-north-1
",
        )
        .expect("fixture config parses"),
    )
}

#[must_use]
pub fn repositories() -> Vec<NormalizedRepository> {
    vec![NormalizedRepository {
        name: "repo-0".to_owned(),
        url: "https://repo.almalinux.org/almalinux/8/BaseOS/x86_64/os/".to_owned(),
    }]
}

/// Uploader that records nothing and always succeeds.
pub struct NullUploader;

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

/// Uploader that always fails, for teardown-resilience tests.
pub struct FailingUploader;

#[async_trait]
impl ArtifactsUploader for FailingUploader {
    async fn upload(
        &self,
        artifacts_dir: &Path,
        _upload_dir: &str,
    ) -> Result<BTreeMap<String, String>, UploadError> {
        Err(UploadError::List {
            dir: artifacts_dir.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "upload rejected"),
        })
    }
}
