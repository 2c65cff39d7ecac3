// Explicit wiring of the connection and registry for one process

use crate::config::Settings;
use crate::errors::{ForwardError, MqError};
use crate::forward::{Forwarder, HttpForwarder};
use crate::mq::amqp::AmqpBroker;
use crate::mq::broker::Broker;
use crate::mq::connection::BrokerConnection;
use crate::mq::definition::DefinitionLoader;
use crate::mq::registry::JobberRegistry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared handles to the broker connection and the jobber registry
#[derive(Debug, Clone)]
pub struct MqContext {
    pub connection: Arc<BrokerConnection>,
    pub registry: Arc<JobberRegistry>,
}

impl MqContext {
    pub fn new(settings: &Settings, broker: Arc<dyn Broker>, forwarder: Arc<dyn Forwarder>) -> Self {
        let connection = Arc::new(BrokerConnection::from_config(broker, &settings.rabbitmq));
        let registry = Arc::new(JobberRegistry::new(
            DefinitionLoader::new(settings.include.clone()),
            connection.clone(),
            forwarder,
            settings.jobber_log.clone(),
        ));

        Self {
            connection,
            registry,
        }
    }

    /// Production wiring: AMQP over lapin, forwarding with reqwest
    pub fn from_settings(settings: &Settings) -> Result<Self, ForwardError> {
        let forwarder = HttpForwarder::new(settings.forward.timeout_seconds)?;
        Ok(Self::new(
            settings,
            Arc::new(AmqpBroker::new()),
            Arc::new(forwarder),
        ))
    }

    /// Create a stopped jobber for every definition file
    pub fn load_definitions(&self) -> Result<usize, MqError> {
        self.registry.load()
    }

    /// Spawn the connection supervisor
    pub fn spawn_supervisor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let connection = Arc::clone(&self.connection);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(connection.run(registry, cancel))
    }

    /// Drain every jobber, then close the connection and wait for the supervisor
    pub async fn shutdown(&self, cancel: CancellationToken, supervisor: JoinHandle<()>) {
        info!("Stopping all jobbers");
        self.registry.stop_all().await;
        cancel.cancel();
        if let Err(e) = supervisor.await {
            tracing::error!(error = %e, "Connection supervisor ended abnormally");
        }
        info!("Shutdown complete");
    }
}
