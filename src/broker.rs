//! Broker-side operations the consumer depends on.

use std::{future::Future, pin::Pin};

use crate::{error::Error, message::DeliveryTag};

pub mod amqp;

pub type BrokerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;

/// Settles deliveries on the channel they were received on.
///
/// Both methods take the tag by value: each delivery is settled exactly once.
pub trait BrokerChannel: Send + Sync + 'static {
    /// Removes the message from the queue.
    fn acknowledge(&self, tag: DeliveryTag) -> BrokerFuture<'_>;

    /// Negatively acknowledges the message.
    ///
    /// With `requeue` the message comes back to the same queue with the
    /// rejection counted in its death history; without, it ends up in the
    /// dead-letter queue.
    fn reject(&self, tag: DeliveryTag, requeue: bool) -> BrokerFuture<'_>;
}
