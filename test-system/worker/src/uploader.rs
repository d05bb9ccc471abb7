//! Artifact publication to blob storage.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use object_store::{ObjectStore, aws::AmazonS3Builder, path::Path as StorePath};
use test_system_shared::config::WorkerConfig;
use tracing::info;

use crate::errors::UploadError;

/// Publishes collected logs to a per-task prefix in storage.
#[async_trait]
pub trait ArtifactsUploader: Send + Sync {
    /// Uploads eligible files from `artifacts_dir` under `upload_dir`,
    /// returning local basename -> remote URL.
    async fn upload(
        &self,
        artifacts_dir: &Path,
        upload_dir: &str,
    ) -> Result<BTreeMap<String, String>, UploadError>;
}

/// Blob-store uploader restricted to `.log` files.
pub struct BlobLogsUploader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    endpoint: Option<String>,
}

impl BlobLogsUploader {
    pub fn from_config(config: &WorkerConfig) -> Result<Self, UploadError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(config.s3_bucket.as_str())
            .with_region(config.s3_region.as_str())
            .with_access_key_id(config.s3_access_key_id.as_str())
            .with_secret_access_key(config.s3_secret_access_key.as_str());
        if let Some(endpoint) = &config.s3_endpoint_url {
            builder = builder.with_endpoint(endpoint.as_str()).with_allow_http(true);
        }
        let store = builder.build().map_err(UploadError::Build)?;
        Ok(Self {
            store: Arc::new(store),
            bucket: config.s3_bucket.clone(),
            endpoint: config.s3_endpoint_url.clone(),
        })
    }

    #[must_use]
    pub fn with_store(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            endpoint: None,
        }
    }

    /// Regular `.log` files directly inside the artifacts directory.
    fn artifact_files(artifacts_dir: &Path) -> Result<Vec<PathBuf>, UploadError> {
        let entries = std::fs::read_dir(artifacts_dir).map_err(|source| UploadError::List {
            dir: artifacts_dir.display().to_string(),
            source,
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| UploadError::List {
                dir: artifacts_dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|extension| extension == "log") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn remote_url(&self, key: &StorePath) -> String {
        match &self.endpoint {
            Some(endpoint) => {
                format!("{}/{}/{key}", endpoint.trim_end_matches('/'), self.bucket)
            }
            None => format!("s3://{}/{key}", self.bucket),
        }
    }
}

#[async_trait]
impl ArtifactsUploader for BlobLogsUploader {
    async fn upload(
        &self,
        artifacts_dir: &Path,
        upload_dir: &str,
    ) -> Result<BTreeMap<String, String>, UploadError> {
        let mut uploaded = BTreeMap::new();
        for file in Self::artifact_files(artifacts_dir)? {
            let data = std::fs::read(&file).map_err(|source| UploadError::ReadFile {
                file: file.display().to_string(),
                source,
            })?;
            let basename = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let key = StorePath::from(format!("{}/{basename}", upload_dir.trim_matches('/')));
            self.store
                .put(&key, data.into())
                .await
                .map_err(|source| UploadError::Upload {
                    file: basename.clone(),
                    source,
                })?;
            uploaded.insert(basename, self.remote_url(&key));
        }
        info!(
            count = uploaded.len(),
            prefix = %upload_dir,
            "artifacts uploaded"
        );
        Ok(uploaded)
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn only_log_files_are_published() {
        let artifacts_dir = tempfile::tempdir().unwrap();
        std::fs::write(artifacts_dir.path().join("install_package_t1.log"), b"gz").unwrap();
        std::fs::write(artifacts_dir.path().join("tests_integrity_t1.log"), b"gz").unwrap();
        std::fs::write(artifacts_dir.path().join("docker.tf"), b"hcl").unwrap();

        let store = Arc::new(InMemory::new());
        let uploader = BlobLogsUploader::with_store(store.clone(), "artifacts");
        let uploaded = uploader
            .upload(artifacts_dir.path(), "test_system_artifacts/t1")
            .await
            .unwrap();

        assert_eq!(uploaded.len(), 2);
        assert_eq!(
            uploaded["install_package_t1.log"],
            "s3://artifacts/test_system_artifacts/t1/install_package_t1.log"
        );
        assert!(
            store
                .get(&StorePath::from(
                    "test_system_artifacts/t1/tests_integrity_t1.log"
                ))
                .await
                .is_ok()
        );
        assert!(
            store
                .get(&StorePath::from("test_system_artifacts/t1/docker.tf"))
                .await
                .is_err()
        );
    }
}
