// Core library for the message jobber supervisor

pub mod config;
pub mod errors;
pub mod forward;
pub mod mq;
pub mod telemetry;
