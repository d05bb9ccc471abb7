//! Broker connection, queue declaration and task routing.
//!
//! Every queue uses a direct exchange of the same name and a routing key
//! equal to the queue name; routing decisions are made purely by queue name.

use futures::stream::{SelectAll, select_all};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use test_system_shared::models::TaskMessage;
use tracing::{debug, info};

use crate::BrokerError;

pub struct Broker {
    _connection: Connection,
    channel: Channel,
}

impl Broker {
    /// Connects and opens the single channel multiplexed by this process.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(BrokerError::Connection)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::Channel)?;
        info!("broker connection established");
        Ok(Self {
            _connection: connection,
            channel,
        })
    }

    /// Declares every queue with its direct exchange and binding so clients
    /// are aware of the full set up front.
    pub async fn declare_queues(&self, queue_names: &[String]) -> Result<(), BrokerError> {
        for queue in queue_names {
            self.channel
                .exchange_declare(
                    queue,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|source| BrokerError::Declare {
                    queue: queue.clone(),
                    source,
                })?;
            self.channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|source| BrokerError::Declare {
                    queue: queue.clone(),
                    source,
                })?;
            self.channel
                .queue_bind(
                    queue,
                    queue,
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|source| BrokerError::Declare {
                    queue: queue.clone(),
                    source,
                })?;
        }
        debug!(queues = queue_names.len(), "queues declared");
        Ok(())
    }

    /// Caps unacked deliveries per worker so tasks are never hoarded.
    pub async fn set_prefetch(&self, prefetch: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(BrokerError::Channel)
    }

    /// Publishes a task message onto its queue with publisher confirms.
    pub async fn publish_task(
        &self,
        queue_name: &str,
        message: &TaskMessage,
    ) -> Result<(), BrokerError> {
        let task_id = message.task_id.clone().unwrap_or_default();
        let payload = serde_json::to_vec(message)?;
        self.channel
            .basic_publish(
                queue_name,
                queue_name,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type(String::from("application/json").into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(|source| BrokerError::Publish {
                task_id: task_id.clone(),
                queue: queue_name.to_owned(),
                source,
            })?
            .await
            .map_err(|source| BrokerError::Publish {
                task_id: task_id.clone(),
                queue: queue_name.to_owned(),
                source,
            })?;
        debug!(task_id = %task_id, queue = %queue_name, "task published");
        Ok(())
    }

    /// Starts a late-acking consumer on each queue and merges the streams.
    pub async fn consume(
        &self,
        queue_names: &[String],
        consumer_tag: &str,
    ) -> Result<SelectAll<Consumer>, BrokerError> {
        let mut consumers = Vec::with_capacity(queue_names.len());
        for queue in queue_names {
            let consumer = self
                .channel
                .basic_consume(
                    queue,
                    &format!("{consumer_tag}-{queue}"),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|source| BrokerError::Consume {
                    queue: queue.clone(),
                    source,
                })?;
            consumers.push(consumer);
        }
        info!(queues = queue_names.len(), "consuming task queues");
        Ok(select_all(consumers))
    }
}
