//! Retry accounting and the terminal broker decision for each delivery.

use strum::Display;

use crate::{
    applier::Outcome,
    broker::BrokerChannel,
    error::Error,
    message::{DeathRecord, Delivery, REJECTED},
};

/// What happens to a delivery once it has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    /// Remove from the queue; the effect is durable.
    Acknowledge,
    /// Return to the queue for another attempt.
    RejectRequeue,
    /// Route to the dead-letter exchange; no further automatic processing.
    RejectNoRequeue,
}

/// Number of times `queue_name` has already rejected this message.
///
/// Uses the most recent `rejected` entry for the queue; entries left by other
/// queues or for other reasons (e.g. TTL expiry) are ignored.
pub fn extract_retry_count(death_history: &[DeathRecord], queue_name: &str) -> u64 {
    death_history
        .iter()
        .find(|death| death.reason == REJECTED && death.queue == queue_name)
        .map_or(0, |death| death.count)
}

pub fn decide(outcome: &Outcome, retry_count: u64, max_retries: u64) -> Decision {
    match outcome {
        Outcome::Success => Decision::Acknowledge,
        Outcome::PermanentError(_) => Decision::RejectNoRequeue,
        Outcome::TransientError(_) if retry_count < max_retries => Decision::RejectRequeue,
        Outcome::TransientError(_) => Decision::RejectNoRequeue,
    }
}

/// Bound to one channel and queue at construction; called once per delivery.
pub struct DeliveryClassifier<C> {
    channel: C,
    queue_name: String,
    max_retries: u64,
}

impl<C: BrokerChannel> DeliveryClassifier<C> {
    pub fn new(channel: C, queue_name: impl Into<String>, max_retries: u64) -> Self {
        Self {
            channel,
            queue_name: queue_name.into(),
            max_retries,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn max_retries(&self) -> u64 {
        self.max_retries
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn retry_count(&self, delivery: &Delivery) -> u64 {
        extract_retry_count(&delivery.death_history, &self.queue_name)
    }

    /// Applies the decision for `outcome` to the delivery.
    ///
    /// Consumes the delivery, so its tag is settled exactly once. An error
    /// here comes from the broker and is fatal to the consumer.
    pub async fn settle(&self, delivery: Delivery, outcome: &Outcome) -> Result<Decision, Error> {
        let retry_count = self.retry_count(&delivery);
        let decision = decide(outcome, retry_count, self.max_retries);

        let tag = delivery.delivery_tag;
        let delivery_tag = tag.value();

        match decision {
            Decision::Acknowledge => self.channel.acknowledge(tag).await?,
            Decision::RejectRequeue => self.channel.reject(tag, true).await?,
            Decision::RejectNoRequeue => self.channel.reject(tag, false).await?,
        }

        match (decision, outcome) {
            (Decision::Acknowledge, _) => {
                tracing::debug!(delivery_tag, %decision, "Acknowledged");
            }
            (Decision::RejectRequeue, _) => {
                tracing::warn!(
                    delivery_tag,
                    %decision,
                    retry_count,
                    max_retries = self.max_retries,
                    "Requeued for retry"
                );
            }
            (Decision::RejectNoRequeue, Outcome::TransientError(_)) => {
                tracing::error!(
                    delivery_tag,
                    %decision,
                    retry_count,
                    max_retries = self.max_retries,
                    "Retries exhausted, dead-lettered"
                );
            }
            (Decision::RejectNoRequeue, _) => {
                tracing::error!(delivery_tag, %decision, "Dead-lettered");
            }
        }

        Ok(decision)
    }
}
