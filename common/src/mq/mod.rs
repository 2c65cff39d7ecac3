// Message queue supervision: broker connection, jobbers and their registry

pub mod amqp;
pub mod broker;
pub mod connection;
pub mod context;
pub mod definition;
pub mod jobber;
pub mod logger;
pub mod memory;
pub mod registry;
pub mod slots;

pub use amqp::AmqpBroker;
pub use broker::{Broker, BrokerChannel, BrokerLink, ChannelSource, CloseEvent, Delivery};
pub use connection::BrokerConnection;
pub use context::MqContext;
pub use definition::{DefinitionLoader, JobberDefinition};
pub use jobber::{Jobber, JobberState, JobberStatus};
pub use memory::MemoryBroker;
pub use registry::{JobberRegistry, ReconcileDiff};
pub use slots::{WorkerSlot, WorkerSlots};
