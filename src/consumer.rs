//! The consumer loop: one delivery at a time, in delivery order.

use std::pin::pin;

use futures_util::{Stream, StreamExt as _};
use tokio_util::sync::CancellationToken;

use crate::{
    applier::{Outcome, TaskApplier},
    broker::BrokerChannel,
    classifier::{Decision, DeliveryClassifier},
    error::Error,
    message::Delivery,
    store::TaskStore,
};

#[derive(bon::Builder)]
pub struct Consumer<S, C> {
    applier: TaskApplier<S>,
    classifier: DeliveryClassifier<C>,
}

impl<S: TaskStore, C: BrokerChannel> Consumer<S, C> {
    pub fn applier(&self) -> &TaskApplier<S> {
        &self.applier
    }

    pub fn classifier(&self) -> &DeliveryClassifier<C> {
        &self.classifier
    }

    /// Processes one delivery to its terminal decision.
    #[tracing::instrument(
        skip_all,
        fields(
            delivery_tag = delivery.delivery_tag.value(),
            retry_count = self.classifier.retry_count(&delivery),
        )
    )]
    pub async fn handle(&self, delivery: Delivery) -> Result<Decision, Error> {
        tracing::info!(payload = %delivery.body_lossy(), "Received message");

        let outcome: Outcome = self.applier.process(&delivery.body).await;

        self.classifier.settle(delivery, &outcome).await
    }

    /// Consumes deliveries until the stream fails, ends, or `shutdown` fires.
    ///
    /// Shutdown is only observed between deliveries; a delivery that has been
    /// received is always settled first. Unsettled prefetched deliveries are
    /// returned to the queue by the broker when the channel closes.
    pub async fn run<D>(&self, deliveries: D, shutdown: CancellationToken) -> Result<(), Error>
    where
        D: Stream<Item = Result<Delivery, Error>>,
    {
        let mut deliveries = pin!(deliveries);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Consumer shutting down");
                    return Ok(());
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Delivery stream failed");
                    return Err(e);
                }
                None => {
                    tracing::error!("Delivery stream closed");
                    return Err(Error::ConsumerClosed);
                }
            };

            self.handle(delivery).await?;
        }
    }
}
