// Broker abstraction: connections, channels and deliveries

use crate::errors::QueueError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::watch;

/// Why a connection or channel went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseEvent {
    /// Closed deliberately, no error attached
    Graceful,
    /// Closed by the broker or the transport with an error
    Failed(String),
}

/// Receiver side of a close notification; `None` until the handle closes
pub type CloseEvents = watch::Receiver<Option<CloseEvent>>;

/// Wait for the next close notification
///
/// Returns `None` when the notifier itself was dropped, which means the
/// handle is gone and nothing more will ever be reported.
pub async fn wait_closed(events: &mut CloseEvents) -> Option<CloseEvent> {
    match events.wait_for(Option::is_some).await {
        Ok(event) => event.clone(),
        Err(_) => None,
    }
}

/// Entry point to a message broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a physical connection to `uri`
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerLink>, QueueError>;
}

/// One live physical connection
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Open a fresh logical channel; channels are never shared across jobbers
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError>;

    /// Subscribe to this connection's close notification
    fn close_events(&self) -> CloseEvents;

    /// Close the connection; subscribers observe `CloseEvent::Graceful`
    async fn close(&self);
}

/// A logical channel owned by exactly one jobber
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Durable, non-exclusive, non-auto-delete queue
    async fn declare_queue(&self, queue: &str) -> Result<(), QueueError>;

    /// Durable exchange of the given type
    async fn declare_exchange(&self, exchange: &str, kind: &str) -> Result<(), QueueError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), QueueError>;

    /// Cap unacknowledged deliveries pushed to this channel
    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError>;

    /// Start a manual-ack consumer on `queue`
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, QueueError>;

    fn close_events(&self) -> CloseEvents;

    async fn close(&self);
}

/// Hands out fresh channels over whatever connection is current
#[async_trait]
pub trait ChannelSource: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError>;
}

/// Stream of deliveries from one consumer; ends when the channel closes
pub type DeliveryStream = BoxStream<'static, Result<Delivery, QueueError>>;

/// Acknowledges one delivery back to the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), QueueError>;
}

/// A message received from a queue
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: Vec<u8>, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            body,
            acker,
        }
    }

    /// Acknowledge this delivery; consumes it so it can only be acked once
    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack(self.delivery_tag).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("bytes", &self.body.len())
            .finish()
    }
}
