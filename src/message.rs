//! Delivery types handed to the consumer by the broker adapter.
//!
//! A [`Delivery`] is one attempt at processing a published message. The broker
//! may deliver the same message several times: every time it is rejected with
//! requeue, it returns to the queue and the broker appends (or bumps) an entry
//! in its death history.
//!
//! # Delivery Lifecycle
//!
//! 1. `Received`: the broker hands the delivery to the consumer
//! 2. `Decoded` / `Validated` / `Applied`: the task applier runs
//! 3. One terminal broker decision:
//!    - `Acknowledged`: removed from the queue, effect is durable
//!    - `Requeued`: back to `Received` with an incremented rejection count
//!    - `DeadLettered`: moved to the dead-letter queue for offline inspection

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Reason the broker records when a consumer rejects a message.
pub const REJECTED: &str = "rejected";

/// Broker handle for a single delivery attempt.
///
/// Deliberately neither `Clone` nor `Copy`: settling a delivery consumes the
/// tag, so a delivery can be acknowledged or rejected at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(tag: u64) -> Self {
        Self(tag)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

/// One prior dead-lettering event recorded by the broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    /// Queue the message was rejected from
    pub queue: String,
    /// Why the message left that queue (`rejected`, `expired`, ...)
    pub reason: String,
    /// How many times this (queue, reason) pair has happened
    pub count: u64,
}

impl DeathRecord {
    pub fn rejected(queue: impl Into<String>, count: u64) -> Self {
        Self {
            queue: queue.into(),
            reason: REJECTED.to_owned(),
            count,
        }
    }
}

/// A message as received from the queue.
#[derive(Debug)]
pub struct Delivery {
    /// Raw payload, expected to be a JSON object
    pub body: Bytes,
    /// Handle used exactly once to settle this delivery
    pub delivery_tag: DeliveryTag,
    /// Prior rejections, most recent first
    pub death_history: Vec<DeathRecord>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            delivery_tag: DeliveryTag::new(delivery_tag),
            death_history: Vec::new(),
        }
    }

    pub fn with_death_history(mut self, death_history: Vec<DeathRecord>) -> Self {
        self.death_history = death_history;
        self
    }

    /// Lossy view of the payload for logging.
    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}
