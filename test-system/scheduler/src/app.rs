//! Scheduler process wiring: termination events, signal handlers and the
//! startup reconciliation.

use std::time::Duration;

use test_system_broker::results::ResultStore;
use test_system_shared::state::TaskState;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::storage::TaskStorage;

/// Hard and graceful termination events shared by every loop.
#[derive(Clone, Default)]
pub struct TerminationEvents {
    hard: CancellationToken,
    graceful: CancellationToken,
}

impl TerminationEvents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hard(&self) {
        self.hard.cancel();
    }

    pub fn set_graceful(&self) {
        self.graceful.cancel();
    }

    #[must_use]
    pub fn hard_is_set(&self) -> bool {
        self.hard.is_cancelled()
    }

    #[must_use]
    pub fn graceful_is_set(&self) -> bool {
        self.graceful.is_cancelled()
    }

    /// Loops exit only when a graceful stop was requested and the hard event
    /// fired as well, letting in-flight work settle first.
    #[must_use]
    pub fn should_exit(&self) -> bool {
        self.graceful_is_set() && self.hard_is_set()
    }

    /// Sleeps for `duration`; a set hard event cuts the sleep short.
    pub async fn sleep_interruptible(&self, duration: Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.hard.cancelled() => {}
        }
    }

    /// Resolves once the hard event fires.
    pub async fn hard_fired(&self) {
        self.hard.cancelled().await;
    }
}

/// SIGINT/SIGTERM request a hard stop, SIGUSR1 a graceful one.
pub fn spawn_signal_handlers(events: TerminationEvents) -> std::io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut user_defined = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("terminating all workers");
                    events.set_hard();
                }
                _ = terminate.recv() => {
                    info!("terminating all workers");
                    events.set_hard();
                }
                _ = user_defined.recv() => {
                    info!("gracefully terminating all workers");
                    events.set_graceful();
                }
            }
        }
    });
    Ok(())
}

/// Re-checks every STARTED task against the result backend before the
/// background workers launch.
pub async fn reconcile_started_tasks(storage: &TaskStorage, results: &ResultStore) {
    let tasks = match storage.tasks_with_status(TaskState::Started) {
        Ok(tasks) => tasks,
        Err(error) => {
            error!(error = %error, "cannot select started tasks");
            return;
        }
    };
    for task in tasks {
        match results.fetch(&task.task_id).await {
            Ok(record) if record.state.as_str() != task.status => {
                if let Err(error) = storage.update_status(&task.task_id, record.state) {
                    error!(task_id = %task.task_id, error = %error, "cannot save tasks info");
                }
            }
            Ok(_) => {}
            Err(error) => {
                warn!(task_id = %task.task_id, error = %error, "cannot fetch task result");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exit_requires_both_events() {
        let events = TerminationEvents::new();
        assert!(!events.should_exit());

        events.set_graceful();
        assert!(!events.should_exit());

        events.set_hard();
        assert!(events.should_exit());
    }

    #[tokio::test]
    async fn hard_event_cuts_sleeps_short() {
        let events = TerminationEvents::new();
        events.set_hard();

        let started = std::time::Instant::now();
        events.sleep_interruptible(Duration::from_secs(30)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
