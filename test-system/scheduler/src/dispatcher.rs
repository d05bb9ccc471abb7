//! Pull-based scheduling loop: fetch pending jobs upstream, pick a queue,
//! enqueue, persist.

use std::{sync::Arc, time::Duration};

use rand::seq::SliceRandom as _;
use reqwest::Client;
use test_system_broker::app::Broker;
use test_system_shared::{
    config::SchedulerConfig,
    constants::{DEFAULT_REQUEST_TIMEOUT, DRIVERS},
    models::{TaskMessage, TaskRequestPayload, normalize_repositories},
    queues::queue_arch,
    queues::queue_name,
    state::TaskState,
};
use test_system_worker::runners::DriverKind;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    app::TerminationEvents,
    storage::{TaskRecord, TaskStorage},
};

const SCHEDULE_INTERVAL: Duration = Duration::from_secs(10);

/// Routing decision for one admitted payload.
#[derive(Debug)]
pub struct ScheduledTask {
    pub queue_name: String,
    pub message: TaskMessage,
}

/// Admission checks and queue selection, in order: architecture,
/// distribution, runner resolution, architecture-class lookup. `None` means
/// the payload was rejected (already logged).
pub fn route_task(
    payload: &TaskRequestPayload,
    config: &SchedulerConfig,
    task_id: String,
) -> Option<ScheduledTask> {
    if !config
        .worker
        .supported_architectures
        .iter()
        .any(|arch| arch == &payload.dist_arch)
    {
        error!(arch = %payload.dist_arch, "unknown architecture");
        return None;
    }
    if !config
        .worker
        .supported_distributions
        .iter()
        .any(|dist| dist == &payload.dist_name)
    {
        error!(dist = %payload.dist_name, "unknown distribution");
        return None;
    }

    let Some(permitted) = config.worker.supported_runners.permitted(&DRIVERS) else {
        error!("misconfiguration found: supported_runners is neither 'all' nor a list");
        return None;
    };
    let runner_type = if payload.runner_type == "any" {
        match permitted.choose(&mut rand::thread_rng()) {
            Some(choice) => choice.clone(),
            None => {
                error!("no permitted runner type to choose from");
                return None;
            }
        }
    } else {
        payload.runner_type.clone()
    };
    let kind: DriverKind = match runner_type.parse() {
        Ok(kind) => kind,
        Err(error) => {
            error!(error = %error, "cannot resolve runner type");
            return None;
        }
    };

    let Some(arch) = queue_arch(kind.arch_classes(), &payload.dist_arch) else {
        error!(
            arch = %payload.dist_arch,
            runner = kind.as_str(),
            "cannot map requested architecture to any host architecture, possible coding error"
        );
        return None;
    };

    let repositories = normalize_repositories(&payload.repositories);
    let message = TaskMessage {
        task_id: Some(task_id),
        runner_type: Some(kind.as_str().to_owned()),
        dist_name: Some(payload.dist_name.clone()),
        dist_version: Some(payload.dist_version.clone()),
        dist_arch: Some(payload.dist_arch.clone()),
        repositories: Some(repositories),
        package_name: Some(payload.package_name.clone()),
        package_version: payload.package_version.clone(),
        module_name: payload.module_name.clone(),
        module_stream: payload.module_stream.clone(),
        module_version: payload.module_version.clone(),
        callback_href: payload.callback_href.clone(),
        bs_task_id: payload.bs_task_id,
    };
    Some(ScheduledTask {
        queue_name: queue_name(kind.as_str(), arch, kind.cost()),
        message,
    })
}

pub struct TestsScheduler {
    config: Arc<SchedulerConfig>,
    http: Client,
    broker: Arc<Broker>,
    storage: Arc<TaskStorage>,
    events: TerminationEvents,
}

impl TestsScheduler {
    #[must_use]
    pub fn new(
        config: Arc<SchedulerConfig>,
        broker: Arc<Broker>,
        storage: Arc<TaskStorage>,
        events: TerminationEvents,
    ) -> Self {
        Self {
            config,
            http: Client::new(),
            broker,
            storage,
            events,
        }
    }

    /// Fetches pending test jobs from the upstream build system; transport
    /// and decode failures are logged and yield an empty batch.
    async fn get_available_test_tasks(&self) -> Vec<serde_json::Value> {
        info!("getting new available test tasks");
        let response = match self
            .http
            .get(self.config.bs_tasks_url())
            .bearer_auth(&self.config.bs_token)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            Ok(response) => response,
            Err(error) => {
                error!(error = %error, "cannot get available test tasks");
                return Vec::new();
            }
        };
        match response.json::<Vec<serde_json::Value>>().await {
            Ok(tasks) => {
                if tasks.is_empty() {
                    info!("there are no available test tasks");
                }
                tasks
            }
            Err(error) => {
                error!(error = %error, "cannot decode available test tasks");
                Vec::new()
            }
        }
    }

    /// Routes one payload, enqueues it and persists the NEW record. An
    /// enqueue failure skips the insert; an insert failure after the enqueue
    /// leaves an orphan for reconciliation to pick up.
    pub async fn schedule_test_task(&self, payload: TaskRequestPayload) {
        let task_id = Uuid::new_v4().to_string();
        let Some(scheduled) = route_task(&payload, &self.config, task_id.clone()) else {
            return;
        };

        if let Err(error) = self
            .broker
            .publish_task(&scheduled.queue_name, &scheduled.message)
            .await
        {
            error!(error = %error, task_id = %task_id, "cannot launch the task");
            return;
        }
        let record = TaskRecord {
            task_id: task_id.clone(),
            queue_name: scheduled.queue_name.clone(),
            status: TaskState::New.as_str().to_owned(),
            task_duration: None,
            bs_task_id: payload.bs_task_id,
            callback_href: payload.callback_href.clone(),
        };
        if let Err(error) = self.storage.insert_task(&record) {
            error!(error = %error, task_id = %task_id, "cannot save task data into DB");
        } else {
            info!(task_id = %task_id, queue = %scheduled.queue_name, "task scheduled");
        }
    }

    /// Runs until a graceful stop was requested and the hard event fired.
    pub async fn run(self) {
        while !self.events.should_exit() {
            for value in self.get_available_test_tasks().await {
                match serde_json::from_value::<TaskRequestPayload>(value) {
                    Ok(payload) => self.schedule_test_task(payload).await,
                    Err(error) => warn!(error = %error, "invalid task payload"),
                }
            }
            self.events.sleep_interruptible(SCHEDULE_INTERVAL).await;
        }
        info!("scheduler dispatcher stopped");
    }
}
