// Broker connection supervisor with reconnect and jobber recovery

use crate::config::RabbitMqConfig;
use crate::errors::QueueError;
use crate::mq::broker::{wait_closed, Broker, BrokerChannel, BrokerLink, ChannelSource, CloseEvent};
use crate::mq::jobber::JobberState;
use crate::mq::registry::JobberRegistry;
use crate::telemetry;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// The process-wide broker connection
///
/// Holds at most one live link. Jobbers open their own channels through it
/// and fail with `NotConnected` while it is down.
pub struct BrokerConnection {
    broker: Arc<dyn Broker>,
    uris: Vec<String>,
    reconnect_interval: Duration,
    autostart: bool,
    link: RwLock<Option<Arc<dyn BrokerLink>>>,
    connected: AtomicBool,
    connected_once: AtomicBool,
}

impl BrokerConnection {
    pub fn new(
        broker: Arc<dyn Broker>,
        uris: Vec<String>,
        reconnect_interval: Duration,
        autostart: bool,
    ) -> Self {
        Self {
            broker,
            uris,
            reconnect_interval,
            autostart,
            link: RwLock::new(None),
            connected: AtomicBool::new(false),
            connected_once: AtomicBool::new(false),
        }
    }

    pub fn from_config(broker: Arc<dyn Broker>, config: &RabbitMqConfig) -> Self {
        Self::new(
            broker,
            config.uris(),
            config.reconnect_interval(),
            config.autostart,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn current_link(&self) -> Option<Arc<dyn BrokerLink>> {
        self.link.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_link(&self, link: Option<Arc<dyn BrokerLink>>) {
        *self.link.write().unwrap_or_else(|e| e.into_inner()) = link;
    }

    /// Try every candidate broker in order; the first success wins
    ///
    /// After connecting, jobbers left FATAL by an earlier outage are restarted.
    /// On the very first connection with autostart enabled, stopped jobbers
    /// are started as well.
    #[instrument(skip_all)]
    pub async fn connect(&self, registry: &JobberRegistry) -> Result<(), QueueError> {
        let mut first_error = None;
        let mut link = None;

        for uri in &self.uris {
            match self.broker.connect(uri).await {
                Ok(connected) => {
                    link = Some(connected);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Broker candidate unreachable");
                    first_error.get_or_insert(e);
                }
            }
        }

        let Some(link) = link else {
            return Err(first_error
                .unwrap_or_else(|| QueueError::Connection("no brokers configured".to_string())));
        };

        self.set_link(Some(link));
        self.connected.store(true, Ordering::SeqCst);
        telemetry::record_reconnect();
        info!("Broker connected");

        if let Err(e) = registry
            .start_where(|state| state == JobberState::Fatal)
            .await
        {
            error!(error = %e, "Failed to recover jobbers after reconnect");
        }

        if self.autostart && !self.connected_once.swap(true, Ordering::SeqCst) {
            if let Err(e) = registry
                .start_where(|state| state == JobberState::Stopped)
                .await
            {
                error!(error = %e, "Failed to autostart jobbers");
            }
        }

        Ok(())
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.set_link(None);
    }

    /// Supervise the connection until cancelled or closed without error
    ///
    /// Reconnects with a fixed backoff. A close that carries an error stops
    /// every jobber and reconnects; a graceful close stops every jobber and
    /// ends the loop.
    pub async fn run(self: Arc<Self>, registry: Arc<JobberRegistry>, cancel: CancellationToken) {
        loop {
            while !self.is_connected() {
                match self.connect(&registry).await {
                    Ok(()) => break,
                    Err(e) => {
                        error!(
                            error = %e,
                            retry_in_ms = self.reconnect_interval.as_millis() as u64,
                            "Broker connection failed"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(self.reconnect_interval) => {}
                        }
                    }
                }
            }

            let Some(link) = self.current_link() else {
                continue;
            };
            let mut events = link.close_events();

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.mark_disconnected();
                    link.close().await;
                    info!("Broker connection supervisor cancelled");
                    return;
                }
                event = wait_closed(&mut events) => {
                    self.mark_disconnected();
                    warn!(event = ?event, "Broker connection closed, stopping all jobbers");
                    registry.stop_all().await;

                    match event {
                        Some(CloseEvent::Failed(reason)) => {
                            warn!(reason = %reason, "Reconnecting to broker");
                        }
                        Some(CloseEvent::Graceful) | None => {
                            info!("Broker connection closed without error, supervisor exiting");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Open a fresh channel on the current connection
    pub async fn get_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError> {
        if !self.is_connected() {
            return Err(QueueError::NotConnected);
        }
        let link = self.current_link().ok_or(QueueError::NotConnected)?;
        link.open_channel().await
    }
}

#[async_trait]
impl ChannelSource for BrokerConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError> {
        self.get_channel().await
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("brokers", &self.uris.len())
            .field("connected", &self.is_connected())
            .finish()
    }
}
