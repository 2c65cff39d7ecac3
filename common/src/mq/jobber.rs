// Jobber: one consumer definition, its consume loop and worker slots

use crate::config::JobberLogConfig;
use crate::errors::{ForwardError, MqError, QueueError};
use crate::forward::Forwarder;
use crate::mq::broker::{
    wait_closed, BrokerChannel, ChannelSource, CloseEvent, CloseEvents, Delivery, DeliveryStream,
};
use crate::mq::definition::JobberDefinition;
use crate::mq::logger::JobberLogger;
use crate::mq::slots::{WorkerSlot, WorkerSlots};
use crate::telemetry::{self, DeliveryOutcome};
use chrono::{DateTime, Local};
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle state of a jobber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobberState {
    Stopped,
    Running,
    Fatal,
}

impl JobberState {
    /// Numeric code used in status listings
    pub fn code(&self) -> i8 {
        match self {
            JobberState::Stopped => 0,
            JobberState::Running => 1,
            JobberState::Fatal => -1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobberState::Stopped => "STOPPED",
            JobberState::Running => "RUNNING",
            JobberState::Fatal => "FATAL",
        }
    }
}

impl std::fmt::Display for JobberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a jobber
#[derive(Debug, Clone, Serialize)]
pub struct JobberStatus {
    pub name: String,
    pub queue: String,
    pub state: JobberState,
    pub started_at: Option<DateTime<Local>>,
    pub stopped_at: Option<DateTime<Local>>,
    pub in_flight: usize,
}

impl JobberStatus {
    /// Start time while running, otherwise the last stop time
    pub fn status_time(&self) -> Option<DateTime<Local>> {
        match self.state {
            JobberState::Running => self.started_at,
            _ => self.stopped_at,
        }
    }
}

struct Lifecycle {
    state: JobberState,
    started_at: Option<DateTime<Local>>,
    stopped_at: Option<DateTime<Local>>,
    cancel: Option<CancellationToken>,
    slots: Option<Arc<WorkerSlots>>,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

/// A managed consumer bound to one queue
pub struct Jobber {
    definition: RwLock<Arc<JobberDefinition>>,
    logger: RwLock<JobberLogger>,
    lifecycle: Mutex<Lifecycle>,
    // Serializes start/stop/restart so at most one consume loop exists
    control: tokio::sync::Mutex<()>,
    channels: Arc<dyn ChannelSource>,
    forwarder: Arc<dyn Forwarder>,
    log_config: JobberLogConfig,
}

impl Jobber {
    pub fn new(
        definition: JobberDefinition,
        channels: Arc<dyn ChannelSource>,
        forwarder: Arc<dyn Forwarder>,
        log_config: JobberLogConfig,
    ) -> Self {
        let logger = JobberLogger::open(&definition.name, definition.log_path.as_deref(), &log_config);

        Self {
            definition: RwLock::new(Arc::new(definition)),
            logger: RwLock::new(logger),
            lifecycle: Mutex::new(Lifecycle {
                state: JobberState::Stopped,
                started_at: None,
                // Listings show creation time until the first start
                stopped_at: Some(Local::now()),
                cancel: None,
                slots: None,
                stop_waiters: Vec::new(),
            }),
            control: tokio::sync::Mutex::new(()),
            channels,
            forwarder,
            log_config,
        }
    }

    pub fn name(&self) -> String {
        self.definition().name.clone()
    }

    pub fn definition(&self) -> Arc<JobberDefinition> {
        self.definition
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn logger(&self) -> JobberLogger {
        self.logger.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> JobberState {
        self.lifecycle().state
    }

    pub fn status(&self) -> JobberStatus {
        let definition = self.definition();
        let lifecycle = self.lifecycle();
        JobberStatus {
            name: definition.name.clone(),
            queue: definition.queue.clone(),
            state: lifecycle.state,
            started_at: lifecycle.started_at,
            stopped_at: lifecycle.stopped_at,
            in_flight: lifecycle.slots.as_ref().map(|s| s.in_flight()).unwrap_or(0),
        }
    }

    /// Swap in a new definition without touching the running consume loop
    ///
    /// The target URL is read per delivery, so it applies at once. Queue,
    /// exchange, binding and worker count only apply on the next start.
    pub fn replace_definition(&self, definition: JobberDefinition) {
        let current = self.definition();
        let structural = current.queue != definition.queue
            || current.exchange != definition.exchange
            || current.binding_key != definition.binding_key
            || current.consumer_tag != definition.consumer_tag
            || current.worker_num != definition.worker_num;

        if structural && self.state() == JobberState::Running {
            warn!(
                jobber = %definition.name,
                "Definition replaced in place; queue, exchange, binding and worker changes apply after restart"
            );
        }

        if current.log_path != definition.log_path {
            let logger = JobberLogger::open(
                &definition.name,
                definition.log_path.as_deref(),
                &self.log_config,
            );
            *self.logger.write().unwrap_or_else(|e| e.into_inner()) = logger;
        }

        *self.definition.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(definition);
    }

    /// Declare the topology, start consuming and spawn the dispatch loop
    pub async fn start(self: &Arc<Self>) -> Result<(), MqError> {
        let _control = self.control.lock().await;
        self.start_locked().await
    }

    /// Cancel the consume loop and wait until every in-flight delivery is acked
    pub async fn stop(&self) {
        let _control = self.control.lock().await;
        self.stop_locked().await;
    }

    /// Stop (waiting for drain) then start
    pub async fn restart(self: &Arc<Self>) -> Result<(), MqError> {
        let _control = self.control.lock().await;
        self.stop_locked().await;
        self.start_locked().await
    }

    async fn start_locked(self: &Arc<Self>) -> Result<(), MqError> {
        let definition = self.definition();
        let logger = self.logger();

        if self.state() == JobberState::Running {
            logger.scope(|| warn!(jobber = %definition.name, "Jobber has started"));
            return Err(MqError::AlreadyRunning(definition.name.clone()));
        }

        let (channel, deliveries) = match self.prepare(&definition).await {
            Ok(prepared) => prepared,
            Err(source) => {
                logger.scope(|| error!(jobber = %definition.name, error = %source, "Jobber start failed"));
                return Err(MqError::StartFailed {
                    name: definition.name.clone(),
                    source,
                });
            }
        };

        let slots = Arc::new(WorkerSlots::new(definition.worker_num));
        let cancel = CancellationToken::new();
        let close_events = channel.close_events();

        {
            let mut lifecycle = self.lifecycle();
            lifecycle.state = JobberState::Running;
            lifecycle.started_at = Some(Local::now());
            lifecycle.cancel = Some(cancel.clone());
            lifecycle.slots = Some(Arc::clone(&slots));
            lifecycle.stop_waiters.clear();
        }

        logger.scope(|| {
            info!(
                jobber = %definition.name,
                queue = %definition.queue,
                worker_num = definition.worker_num,
                "Jobber started"
            )
        });

        tokio::spawn(Arc::clone(self).dispatch(channel, deliveries, close_events, slots, cancel));
        Ok(())
    }

    async fn stop_locked(&self) {
        let drained = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != JobberState::Running {
                return;
            }
            let (tx, rx) = oneshot::channel();
            lifecycle.stop_waiters.push(tx);
            if let Some(cancel) = &lifecycle.cancel {
                cancel.cancel();
            }
            rx
        };

        // Sender dropped means the loop task is gone; nothing left to wait for
        let _ = drained.await;
    }

    async fn prepare(
        &self,
        definition: &JobberDefinition,
    ) -> Result<(Box<dyn BrokerChannel>, DeliveryStream), QueueError> {
        let channel = self.channels.open_channel().await?;

        let consumed = async {
            channel.declare_queue(&definition.queue).await?;
            if !definition.exchange.name.is_empty() {
                channel
                    .declare_exchange(&definition.exchange.name, &definition.exchange.kind)
                    .await?;
                channel
                    .bind_queue(&definition.queue, &definition.exchange.name, &definition.binding_key)
                    .await?;
            }
            let prefetch = u16::try_from(definition.worker_num).unwrap_or(u16::MAX);
            channel.set_prefetch(prefetch).await?;
            channel.consume(&definition.queue, &definition.consumer_tag).await
        }
        .await;

        match consumed {
            Ok(deliveries) => Ok((channel, deliveries)),
            Err(e) => {
                channel.close().await;
                Err(e)
            }
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        channel: Box<dyn BrokerChannel>,
        mut deliveries: DeliveryStream,
        mut close_events: CloseEvents,
        slots: Arc<WorkerSlots>,
        cancel: CancellationToken,
    ) {
        let name = self.name();

        let failure: Option<String> = loop {
            tokio::select! {
                biased;

                event = wait_closed(&mut close_events) => match event {
                    Some(CloseEvent::Failed(reason)) => break Some(reason),
                    Some(CloseEvent::Graceful) => break None,
                    None => break Some("channel notifier dropped".to_string()),
                },
                _ = cancel.cancelled() => break None,
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let slot = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break None,
                            slot = slots.acquire() => slot,
                        };
                        self.spawn_delivery(delivery, slot, Arc::clone(&slots));
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("delivery channel has closed".to_string()),
                },
            }
        };

        // Stop accepting before waiting on the in-flight deliveries
        drop(deliveries);
        slots.drain().await;
        channel.close().await;

        let waiters = {
            let mut lifecycle = self.lifecycle();
            lifecycle.state = if failure.is_some() {
                JobberState::Fatal
            } else {
                JobberState::Stopped
            };
            lifecycle.stopped_at = Some(Local::now());
            lifecycle.cancel = None;
            lifecycle.slots = None;
            std::mem::take(&mut lifecycle.stop_waiters)
        };
        telemetry::update_in_flight(&name, 0);

        self.logger().scope(|| match &failure {
            Some(reason) => error!(jobber = %name, error = %reason, "Jobber exited with error"),
            None => info!(jobber = %name, "Jobber stopped"),
        });

        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    fn spawn_delivery(&self, delivery: Delivery, slot: WorkerSlot, slots: Arc<WorkerSlots>) {
        let definition = self.definition();
        let logger = self.logger();
        let forwarder = Arc::clone(&self.forwarder);

        tokio::spawn(async move {
            let name = definition.name.as_str();
            let url = definition.target_url.as_str();
            let worker_id = slot.id();
            telemetry::update_in_flight(name, slots.in_flight());

            let result = AssertUnwindSafe(forwarder.forward(url, &delivery.body))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ForwardError::Panicked(panic_message(panic.as_ref()))));

            let body = String::from_utf8_lossy(&delivery.body).into_owned();
            logger.scope(|| match &result {
                Ok(response) => info!(
                    delivery = %body,
                    http_code = response.status,
                    worker_id,
                    response = %response.body,
                    url = %url,
                    "end request"
                ),
                Err(e) => error!(
                    delivery = %body,
                    http_code = e.http_code(),
                    worker_id,
                    error = %e,
                    url = %url,
                    "end request"
                ),
            });

            let outcome = if result.is_ok() {
                DeliveryOutcome::Success
            } else {
                DeliveryOutcome::Failure
            };
            telemetry::record_delivery(name, outcome);

            let delivery_tag = delivery.delivery_tag;
            if let Err(e) = delivery.ack().await {
                logger.scope(|| error!(jobber = %name, delivery_tag, error = %e, "Ack failed"));
            }

            drop(slot);
            telemetry::update_in_flight(name, slots.in_flight());
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for Jobber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jobber")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
