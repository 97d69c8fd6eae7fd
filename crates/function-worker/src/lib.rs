//! Function Worker
//!
//! Hosts one workflow state and executes it for every message on its topic.
//!
//! This crate provides:
//! - Worker loop with bounded concurrency and control-message handling
//! - NATS JetStream implementations of the engine's queue and storage contracts
//! - Environment-based worker configuration

pub mod config;
pub mod nats;
pub mod worker;

pub use config::WorkerConfig;
pub use nats::{JetStreamDataLayer, JetStreamQueue};
pub use worker::{ControlMessage, Worker};
