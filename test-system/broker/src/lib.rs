pub mod app;
pub mod results;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("cannot reach the broker")]
    Connection(#[source] lapin::Error),
    #[error("cannot create a broker channel")]
    Channel(#[source] lapin::Error),
    #[error("cannot declare queue {queue}")]
    Declare {
        queue: String,
        #[source]
        source: lapin::Error,
    },
    #[error("cannot publish task {task_id} to queue {queue}")]
    Publish {
        task_id: String,
        queue: String,
        #[source]
        source: lapin::Error,
    },
    #[error("cannot serialize task message")]
    Serialize(#[from] serde_json::Error),
    #[error("cannot start consuming from queue {queue}")]
    Consume {
        queue: String,
        #[source]
        source: lapin::Error,
    },
}
