// AMQP 0-9-1 broker implementation over lapin

use crate::errors::QueueError;
use crate::mq::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerLink, CloseEvent, CloseEvents, Delivery,
    DeliveryStream,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

const REPLY_SUCCESS: u16 = 200;

type Notifier = Arc<watch::Sender<Option<CloseEvent>>>;

/// Close notifiers of every channel opened on one connection
#[derive(Default)]
struct ChannelNotifiers(Mutex<Vec<Notifier>>);

impl ChannelNotifiers {
    fn register(&self, notifier: Notifier) {
        let mut notifiers = self.0.lock().unwrap_or_else(|e| e.into_inner());
        notifiers.retain(|n| n.borrow().is_none());
        notifiers.push(notifier);
    }

    fn publish(&self, event: CloseEvent) {
        let notifiers = self.0.lock().unwrap_or_else(|e| e.into_inner());
        for notifier in notifiers.iter() {
            if notifier.borrow().is_none() {
                notifier.send_replace(Some(event.clone()));
            }
        }
    }
}

/// Connects to RabbitMQ (or any AMQP 0-9-1 broker)
#[derive(Debug, Default, Clone)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[instrument(skip_all)]
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerLink>, QueueError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let events: Notifier = Arc::new(watch::channel(None).0);
        let channels = Arc::new(ChannelNotifiers::default());

        let notifier = Arc::clone(&events);
        let channel_notifiers = Arc::clone(&channels);
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            let event = CloseEvent::Failed(err.to_string());
            // Channels first so their consumers exit as failed before the
            // connection supervisor stops them
            channel_notifiers.publish(event.clone());
            notifier.send_replace(Some(event));
        });

        Ok(Arc::new(AmqpLink {
            connection,
            events,
            channels,
        }))
    }
}

struct AmqpLink {
    connection: Connection,
    events: Notifier,
    channels: Arc<ChannelNotifiers>,
}

#[async_trait]
impl BrokerLink for AmqpLink {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| QueueError::ChannelOpen(e.to_string()))?;

        let events: Notifier = Arc::new(watch::channel(None).0);
        self.channels.register(Arc::clone(&events));

        let notifier = Arc::clone(&events);
        let channel_id = channel.id();
        channel.on_error(move |err| {
            debug!(channel_id, error = %err, "AMQP channel error");
            notifier.send_replace(Some(CloseEvent::Failed(err.to_string())));
        });

        Ok(Box::new(AmqpChannel { channel, events }))
    }

    fn close_events(&self) -> CloseEvents {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.channels.publish(CloseEvent::Graceful);
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "Bye").await {
            debug!(error = %e, "AMQP connection close returned an error");
        }
        self.events.send_replace(Some(CloseEvent::Graceful));
        info!("AMQP connection closed");
    }
}

struct AmqpChannel {
    channel: Channel,
    events: Notifier,
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind.to_ascii_lowercase().as_str() {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        _ => ExchangeKind::Custom(kind.to_string()),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), QueueError> {
        let options = QueueDeclareOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            ..Default::default()
        };

        self.channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| QueueError::Declaration {
                entity: "queue",
                name: queue.to_string(),
                reason: e.to_string(),
            })
    }

    async fn declare_exchange(&self, exchange: &str, kind: &str) -> Result<(), QueueError> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };

        self.channel
            .exchange_declare(exchange, exchange_kind(kind), options, FieldTable::default())
            .await
            .map_err(|e| QueueError::Declaration {
                entity: "exchange",
                name: exchange.to_string(),
                reason: e.to_string(),
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), QueueError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Declaration {
                entity: "binding",
                name: format!("{} -> {}", exchange, queue),
                reason: e.to_string(),
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Declaration {
                entity: "qos",
                name: count.to_string(),
                reason: e.to_string(),
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, QueueError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::ConsumeFailed {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let queue = queue.to_string();
        let stream = consumer.map(move |item| match item {
            Ok(delivery) => Ok(Delivery::new(
                delivery.delivery_tag,
                delivery.data,
                Arc::new(AmqpAcker(delivery.acker)),
            )),
            Err(e) => Err(QueueError::ConsumeFailed {
                queue: queue.clone(),
                reason: e.to_string(),
            }),
        });

        Ok(stream.boxed())
    }

    fn close_events(&self) -> CloseEvents {
        self.events.subscribe()
    }

    async fn close(&self) {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "Bye").await {
                debug!(error = %e, "AMQP channel close returned an error");
            }
        }
        if self.events.borrow().is_none() {
            self.events.send_replace(Some(CloseEvent::Graceful));
        }
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<(), QueueError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::AckFailed(e.to_string()))
    }
}
