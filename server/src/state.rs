use common::mq::{BrokerConnection, JobberRegistry, MqContext};
use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone, Debug)]
pub struct AppState {
    pub mq: MqContext,
}

impl AppState {
    pub fn new(mq: MqContext) -> Self {
        Self { mq }
    }

    pub fn registry(&self) -> &Arc<JobberRegistry> {
        &self.mq.registry
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.mq.connection
    }
}
