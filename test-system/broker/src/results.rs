//! Blob-backed task result records.
//!
//! Workers report task state transitions and the final summary as a JSON
//! object under `<s3_base_path>/<task_id>.json`; the monitor and the HTTP
//! surface read it back. A missing record means the task has not reported
//! yet and is treated as `PENDING`.

use std::{sync::Arc, time::Duration};

use object_store::{ObjectStore, aws::AmazonS3Builder, path::Path as StorePath};
use serde::{Deserialize, Serialize};
use test_system_shared::{config::WorkerConfig, state::TaskState};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResultStoreError {
    #[error("cannot build the result backend client")]
    Build(#[source] object_store::Error),
    #[error("cannot read result record for task {task_id}")]
    Read {
        task_id: String,
        #[source]
        source: object_store::Error,
    },
    #[error("cannot write result record for task {task_id}")]
    Write {
        task_id: String,
        #[source]
        source: object_store::Error,
    },
    #[error("result record for task {task_id} is malformed")]
    Decode {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("result fetch for task {task_id} timed out")]
    Timeout { task_id: String },
}

/// State plus optional result value reported for one task.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TaskResultRecord {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

pub struct ResultStore {
    store: Arc<dyn ObjectStore>,
    base_path: String,
}

impl ResultStore {
    pub fn from_config(config: &WorkerConfig) -> Result<Self, ResultStoreError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(config.s3_bucket.as_str())
            .with_region(config.s3_region.as_str())
            .with_access_key_id(config.s3_access_key_id.as_str())
            .with_secret_access_key(config.s3_secret_access_key.as_str());
        if let Some(endpoint) = &config.s3_endpoint_url {
            builder = builder.with_endpoint(endpoint.as_str()).with_allow_http(true);
        }
        let store = builder.build().map_err(ResultStoreError::Build)?;
        Ok(Self::with_store(
            Arc::new(store),
            config.s3_base_path.clone(),
        ))
    }

    #[must_use]
    pub fn with_store(store: Arc<dyn ObjectStore>, base_path: String) -> Self {
        Self {
            store,
            base_path: base_path.trim_matches('/').to_owned(),
        }
    }

    fn record_path(&self, task_id: &str) -> StorePath {
        if self.base_path.is_empty() {
            StorePath::from(format!("{task_id}.json"))
        } else {
            StorePath::from(format!("{}/{task_id}.json", self.base_path))
        }
    }

    /// Reads the record for `task_id`; absence means not reported yet.
    pub async fn fetch(&self, task_id: &str) -> Result<TaskResultRecord, ResultStoreError> {
        match self.store.get(&self.record_path(task_id)).await {
            Ok(found) => {
                let bytes = found.bytes().await.map_err(|source| ResultStoreError::Read {
                    task_id: task_id.to_owned(),
                    source,
                })?;
                serde_json::from_slice(&bytes).map_err(|source| ResultStoreError::Decode {
                    task_id: task_id.to_owned(),
                    source,
                })
            }
            Err(object_store::Error::NotFound { .. }) => Ok(TaskResultRecord {
                state: TaskState::Pending,
                result: None,
            }),
            Err(source) => Err(ResultStoreError::Read {
                task_id: task_id.to_owned(),
                source,
            }),
        }
    }

    /// Bounded fetch; an expired timeout means the task is still running.
    pub async fn fetch_with_timeout(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<TaskResultRecord, ResultStoreError> {
        match tokio::time::timeout(timeout, self.fetch(task_id)).await {
            Ok(result) => result,
            Err(_) => Err(ResultStoreError::Timeout {
                task_id: task_id.to_owned(),
            }),
        }
    }

    /// Writes `state` (and optional result value) unless the stored record
    /// is already terminal; ready states are frozen.
    pub async fn write_state(
        &self,
        task_id: &str,
        state: TaskState,
        result: Option<serde_json::Value>,
    ) -> Result<(), ResultStoreError> {
        let current = self.fetch(task_id).await?;
        if current.state.is_ready() {
            debug!(task_id = %task_id, state = %current.state, "result record is terminal; skipping write");
            return Ok(());
        }
        let record = TaskResultRecord { state, result };
        let payload = serde_json::to_vec(&record).map_err(|source| ResultStoreError::Decode {
            task_id: task_id.to_owned(),
            source,
        })?;
        self.store
            .put(&self.record_path(task_id), payload.into())
            .await
            .map_err(|source| ResultStoreError::Write {
                task_id: task_id.to_owned(),
                source,
            })?;
        debug!(task_id = %task_id, state = %state, "result record written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    fn memory_store() -> ResultStore {
        ResultStore::with_store(Arc::new(InMemory::new()), "task_result_backend/".to_owned())
    }

    #[tokio::test]
    async fn missing_record_reads_as_pending() {
        let store = memory_store();
        let record = store.fetch("absent").await.unwrap();
        assert_eq!(record.state, TaskState::Pending);
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn state_round_trips_with_result_value() {
        let store = memory_store();
        store
            .write_state(
                "t1",
                TaskState::Success,
                Some(serde_json::json!({"install_package": {"success": true}})),
            )
            .await
            .unwrap();

        let record = store.fetch("t1").await.unwrap();
        assert_eq!(record.state, TaskState::Success);
        assert!(record.result.unwrap()["install_package"]["success"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn terminal_records_are_frozen() {
        let store = memory_store();
        store.write_state("t2", TaskState::Failure, None).await.unwrap();
        store.write_state("t2", TaskState::Started, None).await.unwrap();

        let record = store.fetch("t2").await.unwrap();
        assert_eq!(record.state, TaskState::Failure);
    }

    #[tokio::test]
    async fn non_terminal_states_advance() {
        let store = memory_store();
        store.write_state("t3", TaskState::Started, None).await.unwrap();
        store.write_state("t3", TaskState::Success, None).await.unwrap();

        let record = store.fetch("t3").await.unwrap();
        assert_eq!(record.state, TaskState::Success);
    }
}
