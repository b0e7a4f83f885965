//! AMQP 0-9-1 adapter (RabbitMQ) built on `lapin`.
//!
//! Covers just enough of the protocol to run the worker: open a channel,
//! declare the queue with its retry and dead-letter pairs, subscribe, and
//! settle deliveries by tag. Reconnection is left to the process supervisor.
//!
//! # Topology
//!
//! ```text
//! task_queue --basic.reject--> retry_exchange --> retry_queue
//!     ^                                              | x-message-ttl
//!     +------------ default exchange <---------------+
//!
//! (republish) --> dead_letter_exchange --> dead_letter_queue
//! ```
//!
//! A retry is a `basic.reject` without requeue. The main queue dead-letters
//! the message into the retry exchange, so the broker bumps the `rejected`
//! entry for the main queue in `x-death`. When the retry delay runs out the
//! retry queue dead-letters it back to the main queue by name, adding an
//! `expired` entry for itself. A broker-side requeue is never used: it
//! redelivers at once and leaves `x-death` untouched.
//!
//! A message that must not be retried is republished to the dead-letter
//! exchange with its original properties, then acknowledged.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{stream::BoxStream, StreamExt as _};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};

use crate::{
    config::Config,
    error::Error,
    message::{DeathRecord, Delivery, DeliveryTag},
};

use super::{BrokerChannel, BrokerFuture};

/// Header RabbitMQ uses to record dead-lettering events.
pub const X_DEATH: &str = "x-death";

/// Upper bound on the number of `x-death` entries read from one delivery.
pub const MAX_DEATH_HISTORY: usize = 64;

pub const X_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const X_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
pub const X_MESSAGE_TTL: &str = "x-message-ttl";

pub async fn connect(config: &Config) -> Result<(Connection, Channel), Error> {
    tracing::info!("Attempting to connect to broker");

    let connection = Connection::connect(config.amqp_url(), ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;

    channel
        .basic_qos(config.prefetch(), BasicQosOptions::default())
        .await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;

    tracing::info!(prefetch = config.prefetch(), "Connected to broker");

    Ok((connection, channel))
}

/// Names and arguments of every exchange and queue the worker relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub queue: String,
    pub retry_exchange: String,
    pub retry_queue: String,
    pub retry_delay_ms: u32,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl From<&Config> for Topology {
    fn from(config: &Config) -> Self {
        Self {
            queue: config.queue_name().to_owned(),
            retry_exchange: config.retry_exchange().to_owned(),
            retry_queue: config.retry_queue().to_owned(),
            retry_delay_ms: config.retry_delay_ms(),
            dead_letter_exchange: config.dead_letter_exchange().to_owned(),
            dead_letter_queue: config.dead_letter_queue().to_owned(),
        }
    }
}

impl Topology {
    /// Rejections from the main queue go to the retry exchange.
    pub fn queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        arguments.insert(
            X_DEAD_LETTER_EXCHANGE.into(),
            AMQPValue::LongString(self.retry_exchange.as_str().into()),
        );
        arguments
    }

    /// Expired retries go back to the main queue through the default exchange.
    pub fn retry_queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        arguments.insert(
            X_MESSAGE_TTL.into(),
            AMQPValue::LongUInt(self.retry_delay_ms),
        );
        arguments.insert(X_DEAD_LETTER_EXCHANGE.into(), AMQPValue::LongString("".into()));
        arguments.insert(
            X_DEAD_LETTER_ROUTING_KEY.into(),
            AMQPValue::LongString(self.queue.as_str().into()),
        );
        arguments
    }

    /// Declares the whole topology. Safe to run on every start: declarations
    /// are idempotent as long as the arguments match.
    pub async fn declare(&self, channel: &Channel) -> Result<(), Error> {
        declare_bound(
            channel,
            &self.dead_letter_exchange,
            &self.dead_letter_queue,
            FieldTable::default(),
        )
        .await?;

        declare_bound(
            channel,
            &self.retry_exchange,
            &self.retry_queue,
            self.retry_queue_arguments(),
        )
        .await?;

        channel
            .queue_declare(&self.queue, durable(), self.queue_arguments())
            .await?;

        tracing::info!(
            queue = %self.queue,
            retry_queue = %self.retry_queue,
            retry_delay_ms = self.retry_delay_ms,
            dead_letter_queue = %self.dead_letter_queue,
            "Declared queue topology"
        );

        Ok(())
    }
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

/// Durable fanout exchange with one durable queue bound to it.
async fn declare_bound(
    channel: &Channel,
    exchange: &str,
    queue: &str,
    arguments: FieldTable,
) -> Result<(), Error> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel.queue_declare(queue, durable(), arguments).await?;

    channel
        .queue_bind(
            queue,
            exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(())
}

/// How a negative acknowledgement is carried out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// `basic.reject` without requeue, routed through the retry queue.
    Retry,
    /// Republish to the dead-letter exchange, then `basic.ack`.
    DeadLetter,
}

impl Rejection {
    pub fn for_requeue(requeue: bool) -> Self {
        if requeue {
            Self::Retry
        } else {
            Self::DeadLetter
        }
    }
}

/// What is needed to republish a delivery that has not been settled yet.
#[derive(Clone)]
struct InFlight {
    body: Bytes,
    properties: BasicProperties,
    routing_key: String,
}

/// A `lapin` channel settling deliveries through the retry and dead-letter
/// pairs of a [`Topology`].
#[derive(Clone)]
pub struct AmqpChannel {
    channel: Channel,
    dead_letter_exchange: String,
    in_flight: Arc<papaya::HashMap<u64, InFlight>>,
}

impl AmqpChannel {
    pub fn new(channel: Channel, topology: &Topology) -> Self {
        Self {
            channel,
            dead_letter_exchange: topology.dead_letter_exchange.clone(),
            in_flight: Arc::default(),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Starts a manual-ack subscription on the main queue.
    pub async fn subscribe(
        &self,
        config: &Config,
    ) -> Result<BoxStream<'static, Result<Delivery, Error>>, Error> {
        let consumer = self
            .channel
            .basic_consume(
                config.queue_name(),
                config.consumer_tag(),
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(queue = config.queue_name(), "Waiting for messages");

        let in_flight = self.in_flight.clone();
        Ok(consumer
            .map(move |delivery| -> Result<Delivery, Error> {
                let delivery = delivery?;
                let body = Bytes::from(delivery.data);
                let death_history = death_history(&delivery.properties);

                in_flight.pin().insert(
                    delivery.delivery_tag,
                    InFlight {
                        body: body.clone(),
                        properties: delivery.properties,
                        routing_key: delivery.routing_key.as_str().to_owned(),
                    },
                );

                Ok(Delivery::new(delivery.delivery_tag, body).with_death_history(death_history))
            })
            .boxed())
    }

    fn take(&self, tag: u64) -> Option<InFlight> {
        self.in_flight.pin().remove(&tag).cloned()
    }

    async fn dead_letter(&self, tag: u64, in_flight: InFlight) -> Result<(), Error> {
        let confirmation = self
            .channel
            .basic_publish(
                &self.dead_letter_exchange,
                &in_flight.routing_key,
                BasicPublishOptions::default(),
                &in_flight.body,
                in_flight.properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(Error::internal(eyre::eyre!(
                "broker refused dead-letter publish for delivery {tag}"
            )));
        }

        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await?;

        Ok(())
    }
}

/// Reads the `x-death` header into [`DeathRecord`]s, keeping broker order
/// (most recent first). Entries that are not tables, or lack a queue or
/// reason, are skipped.
pub fn death_history(properties: &BasicProperties) -> Vec<DeathRecord> {
    let Some(headers) = properties.headers() else {
        return Vec::new();
    };

    let Some(AMQPValue::FieldArray(entries)) = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == X_DEATH)
        .map(|(_, value)| value)
    else {
        return Vec::new();
    };

    entries
        .as_slice()
        .iter()
        .take(MAX_DEATH_HISTORY)
        .filter_map(|entry| match entry {
            AMQPValue::FieldTable(table) => death_record(table),
            _ => None,
        })
        .collect()
}

fn death_record(table: &FieldTable) -> Option<DeathRecord> {
    let mut queue = None;
    let mut reason = None;
    let mut count = 0;

    for (key, value) in table.inner() {
        match key.as_str() {
            "queue" => queue = as_string(value),
            "reason" => reason = as_string(value),
            "count" => count = as_count(value).unwrap_or(0),
            _ => {}
        }
    }

    Some(DeathRecord {
        queue: queue?,
        reason: reason?,
        count,
    })
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        _ => None,
    }
}

fn as_count(value: &AMQPValue) -> Option<u64> {
    match *value {
        AMQPValue::ShortShortUInt(n) => Some(n.into()),
        AMQPValue::ShortUInt(n) => Some(n.into()),
        AMQPValue::LongUInt(n) => Some(n.into()),
        AMQPValue::ShortShortInt(n) => u64::try_from(n).ok(),
        AMQPValue::ShortInt(n) => u64::try_from(n).ok(),
        AMQPValue::LongInt(n) => u64::try_from(n).ok(),
        AMQPValue::LongLongInt(n) => u64::try_from(n).ok(),
        _ => None,
    }
}

impl BrokerChannel for AmqpChannel {
    fn acknowledge(&self, tag: DeliveryTag) -> BrokerFuture<'_> {
        Box::pin(async move {
            let tag = tag.into_inner();
            self.take(tag);
            self.channel
                .basic_ack(tag, BasicAckOptions::default())
                .await?;
            Ok(())
        })
    }

    fn reject(&self, tag: DeliveryTag, requeue: bool) -> BrokerFuture<'_> {
        Box::pin(async move {
            let tag = tag.into_inner();
            let in_flight = self.take(tag);

            match Rejection::for_requeue(requeue) {
                Rejection::Retry => {
                    self.channel
                        .basic_reject(tag, BasicRejectOptions { requeue: false })
                        .await?;
                }
                Rejection::DeadLetter => {
                    let in_flight = in_flight.ok_or_else(|| {
                        Error::internal(eyre::eyre!("delivery {tag} is not in flight"))
                    })?;
                    self.dead_letter(tag, in_flight).await?;
                }
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use lapin::types::{FieldArray, LongString, ShortString};

    use super::*;

    fn death(queue: &str, reason: &str, count: i64) -> AMQPValue {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("queue"),
            AMQPValue::LongString(LongString::from(queue)),
        );
        table.insert(
            ShortString::from("reason"),
            AMQPValue::LongString(LongString::from(reason)),
        );
        table.insert(ShortString::from("count"), AMQPValue::LongLongInt(count));
        table.insert(
            ShortString::from("exchange"),
            AMQPValue::LongString(LongString::from("")),
        );
        AMQPValue::FieldTable(table)
    }

    fn properties(entries: Vec<AMQPValue>) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(entries)),
        );
        BasicProperties::default().with_headers(headers)
    }

    #[test]
    fn no_headers_means_no_history() {
        assert!(death_history(&BasicProperties::default()).is_empty());
        assert!(death_history(&BasicProperties::default().with_headers(FieldTable::default()))
            .is_empty());
    }

    #[test]
    fn reads_entries_in_broker_order() {
        let props = properties(vec![
            death("task_queue", "rejected", 3),
            death("retry_queue", "expired", 3),
        ]);

        assert_eq!(
            death_history(&props),
            vec![
                DeathRecord::rejected("task_queue", 3),
                DeathRecord {
                    queue: "retry_queue".to_owned(),
                    reason: "expired".to_owned(),
                    count: 3,
                },
            ]
        );
    }

    #[test]
    fn skips_malformed_entries() {
        let mut missing_queue = FieldTable::default();
        missing_queue.insert(
            ShortString::from("reason"),
            AMQPValue::LongString(LongString::from("rejected")),
        );

        let props = properties(vec![
            AMQPValue::LongString(LongString::from("garbage")),
            AMQPValue::FieldTable(missing_queue),
            death("task_queue", "rejected", -1),
            death("task_queue", "rejected", 2),
        ]);

        assert_eq!(
            death_history(&props),
            vec![
                DeathRecord::rejected("task_queue", 0),
                DeathRecord::rejected("task_queue", 2),
            ]
        );
    }

    #[test]
    fn history_is_capped() {
        let entries = (0..MAX_DEATH_HISTORY as i64 + 10)
            .map(|i| death(&format!("queue-{i}"), "rejected", 1))
            .collect();

        assert_eq!(death_history(&properties(entries)).len(), MAX_DEATH_HISTORY);
    }

    #[test]
    fn main_queue_dead_letters_into_retry_exchange() {
        let topology = Topology::from(&Config::default());

        assert_eq!(
            topology.queue_arguments().inner().get(&ShortString::from(X_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString("retry_exchange".into()))
        );
        assert_ne!(topology.retry_exchange, topology.dead_letter_exchange);
    }

    #[test]
    fn retry_queue_expires_back_into_main_queue() {
        let topology = Topology::from(&Config {
            retry_delay_ms: Some(250),
            ..Default::default()
        });
        let arguments = topology.retry_queue_arguments();
        let arguments = arguments.inner();

        assert_eq!(arguments.get(&ShortString::from(X_MESSAGE_TTL)), Some(&AMQPValue::LongUInt(250)));
        assert_eq!(
            arguments.get(&ShortString::from(X_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString("".into()))
        );
        assert_eq!(
            arguments.get(&ShortString::from(X_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString("task_queue".into()))
        );
    }

    #[test]
    fn requeue_goes_through_retry_queue() {
        assert_eq!(Rejection::for_requeue(true), Rejection::Retry);
        assert_eq!(Rejection::for_requeue(false), Rejection::DeadLetter);
    }
}
