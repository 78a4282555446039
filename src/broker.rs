use deadpool_lapin::{Pool, Runtime};
use lapin::{
    options::{BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use tracing::{debug, error};

use crate::config::BrokerConfig;
use crate::error::{MailError, TransientError};

/// Outbound mails waiting for an edge agent, published at priorities 0-3.
pub const OUTGOING_MAIL_QUEUE: &str = "mail::outgoing_mails";
/// Per-recipient delivery hooks coming back from the agents.
pub const OUTGOING_MAIL_STATUS_QUEUE: &str = "mail::outgoing_mails_status";
/// Raw RFC 5322 messages accepted by the agents.
pub const INCOMING_MAIL_QUEUE: &str = "mail::incoming_mails";
/// Staged submissions for large newsletter campaigns.
pub const NEWSLETTER_QUEUE: &str = "mail::newsletter_queue";

fn broker_err(err: impl std::fmt::Display) -> MailError {
    MailError::Transient(TransientError::BrokerUnavailable(err.to_string()))
}

/// Pooled RabbitMQ client. One process-wide instance; every operation
/// borrows a connection from the bounded pool and returns it on all exit
/// paths, including panics, via the pool guard.
#[derive(Clone)]
pub struct Broker {
    pool: Pool,
}

impl Broker {
    pub fn connect(config: &BrokerConfig) -> Result<Self, MailError> {
        let pool = deadpool_lapin::Config {
            url: Some(config.amqp_url()),
            ..Default::default()
        }
        .create_pool(Some(Runtime::Tokio1))
        .map_err(broker_err)?;

        Ok(Self { pool })
    }

    async fn channel(&self) -> Result<(deadpool_lapin::Object, Channel), MailError> {
        let connection = self.pool.get().await.map_err(broker_err)?;
        let channel = connection.create_channel().await.map_err(broker_err)?;
        Ok((connection, channel))
    }

    /// Declare a durable queue, optionally priority-aware.
    pub async fn declare_queue(&self, queue: &str, max_priority: u8) -> Result<(), MailError> {
        let (_guard, channel) = self.channel().await?;

        let mut arguments = FieldTable::default();
        if max_priority > 0 {
            arguments.insert(
                ShortString::from("x-max-priority"),
                AMQPValue::LongInt(max_priority as i32),
            );
        }

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(broker_err)?;

        debug!(queue, max_priority, "queue declared");
        Ok(())
    }

    /// Publish a persistent message at the given priority.
    pub async fn publish(&self, queue: &str, body: &[u8], priority: u8) -> Result<(), MailError> {
        let (_guard, channel) = self.channel().await?;

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_priority(priority),
            )
            .await
            .map_err(broker_err)?
            .await
            .map_err(broker_err)?;

        Ok(())
    }

    /// Fetch a single message without acking it. `None` when the queue is
    /// empty.
    pub async fn basic_get(&self, queue: &str) -> Result<Option<lapin::message::BasicGetMessage>, MailError> {
        let (_guard, channel) = self.channel().await?;
        channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(broker_err)
    }

    /// Drain a queue until empty. Each message is acked only after the
    /// handler succeeds; a failing handler nacks the message back onto the
    /// queue and stops the drain, so the broker redelivers on the next run.
    pub async fn drain<F, Fut>(&self, queue: &str, mut handler: F) -> Result<u64, MailError>
    where
        F: FnMut(Vec<u8>, Option<String>) -> Fut,
        Fut: std::future::Future<Output = Result<(), MailError>>,
    {
        let (_guard, channel) = self.channel().await?;
        let mut handled = 0u64;

        loop {
            let Some(message) = channel
                .basic_get(queue, BasicGetOptions { no_ack: false })
                .await
                .map_err(broker_err)?
            else {
                break;
            };

            let app_id = message
                .delivery
                .properties
                .app_id()
                .as_ref()
                .map(|id| id.as_str().to_owned());
            let body = message.delivery.data.clone();

            match handler(body, app_id).await {
                Ok(()) => {
                    message
                        .delivery
                        .ack(BasicAckOptions::default())
                        .await
                        .map_err(broker_err)?;
                    handled += 1;
                }
                Err(e) => {
                    error!(queue, "message handler failed, requeueing: {e}");
                    message
                        .delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await
                        .map_err(broker_err)?;
                    return Err(e);
                }
            }
        }

        Ok(handled)
    }
}
