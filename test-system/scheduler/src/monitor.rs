//! Reconciliation of persisted task status with broker-reported state.

use std::{sync::Arc, time::Duration};

use rand::Rng as _;
use test_system_broker::results::{ResultStore, ResultStoreError};
use tracing::{error, info, warn};

use crate::{app::TerminationEvents, storage::TaskStorage};

const RESULT_FETCH_TIMEOUT: Duration = Duration::from_secs(1);
const INTER_TASK_SLEEP: Duration = Duration::from_millis(500);
const MIN_PASS_SLEEP_SECS: u64 = 10;
const MAX_PASS_SLEEP_SECS: u64 = 15;

pub struct TasksMonitor {
    storage: Arc<TaskStorage>,
    results: Arc<ResultStore>,
    events: TerminationEvents,
}

impl TasksMonitor {
    #[must_use]
    pub fn new(
        storage: Arc<TaskStorage>,
        results: Arc<ResultStore>,
        events: TerminationEvents,
    ) -> Self {
        Self {
            storage,
            results,
            events,
        }
    }

    /// One pass over every non-terminal task: fetch the reported state with
    /// a short timeout (an expired timeout means still running) and write it
    /// back when it differs. Sleeps between tasks to avoid hammering the
    /// backend.
    pub async fn reconcile_pass(&self) {
        let tasks = match self.storage.unfinished_tasks() {
            Ok(tasks) => tasks,
            Err(error) => {
                error!(error = %error, "cannot select unfinished tasks");
                return;
            }
        };
        for task in tasks {
            match self
                .results
                .fetch_with_timeout(&task.task_id, RESULT_FETCH_TIMEOUT)
                .await
            {
                Ok(record) => {
                    if record.state.as_str() != task.status {
                        info!(
                            task_id = %task.task_id,
                            status = %record.state,
                            "updating task status"
                        );
                        if let Err(error) = self.storage.update_status(&task.task_id, record.state)
                        {
                            error!(
                                task_id = %task.task_id,
                                error = %error,
                                "cannot update task status"
                            );
                        }
                    }
                }
                Err(ResultStoreError::Timeout { .. }) => {
                    // Still running.
                }
                Err(error) => {
                    warn!(task_id = %task.task_id, error = %error, "cannot fetch task result");
                }
            }
            self.events.sleep_interruptible(INTER_TASK_SLEEP).await;
        }
    }

    /// Runs until a graceful stop was requested and the hard event fired,
    /// sleeping a random 10-15 s between passes.
    pub async fn run(self) {
        while !self.events.should_exit() {
            self.reconcile_pass().await;
            let pause = Duration::from_secs(
                rand::thread_rng().gen_range(MIN_PASS_SLEEP_SECS..=MAX_PASS_SLEEP_SECS),
            );
            self.events.sleep_interruptible(pause).await;
        }
        info!("tasks monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;
    use test_system_shared::state::TaskState;

    use super::*;
    use crate::storage::TaskRecord;

    fn fixture() -> (Arc<TaskStorage>, Arc<ResultStore>, TasksMonitor) {
        let storage = Arc::new(TaskStorage::open_in_memory().unwrap());
        let results = Arc::new(ResultStore::with_store(
            Arc::new(InMemory::new()),
            "task_result_backend/".to_owned(),
        ));
        let monitor = TasksMonitor::new(
            Arc::clone(&storage),
            Arc::clone(&results),
            TerminationEvents::new(),
        );
        (storage, results, monitor)
    }

    fn record(task_id: &str, status: &str) -> TaskRecord {
        TaskRecord {
            task_id: task_id.to_owned(),
            queue_name: "docker-x86_64-0".to_owned(),
            status: status.to_owned(),
            task_duration: None,
            bs_task_id: None,
            callback_href: None,
        }
    }

    #[tokio::test]
    async fn started_task_is_reconciled_to_success() {
        let (storage, results, monitor) = fixture();
        storage.insert_task(&record("t1", "STARTED")).unwrap();
        results
            .write_state("t1", TaskState::Success, None)
            .await
            .unwrap();

        monitor.reconcile_pass().await;
        assert_eq!(storage.task_status("t1").unwrap().unwrap(), "SUCCESS");

        // The next pass skips terminal tasks entirely.
        assert!(storage.unfinished_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreported_task_moves_from_new_to_pending() {
        let (storage, _results, monitor) = fixture();
        storage.insert_task(&record("t2", "NEW")).unwrap();

        monitor.reconcile_pass().await;
        assert_eq!(storage.task_status("t2").unwrap().unwrap(), "PENDING");
    }
}
