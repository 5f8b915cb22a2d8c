//! sbus-cli - command-line client for the sbus service bus
//!
//! Sends signed request/reply commands and fire-and-forget events to sbus
//! services over RabbitMQ or Kafka, registers caller identities, and manages
//! per-environment broker configuration.

pub mod bus;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod envelope;
pub mod registration;
#[cfg(feature = "aws")]
pub mod secrets;
pub mod signing;
pub mod utils;

pub use bus::{BrokerKind, TransportMode};
pub use dispatch::{Dispatcher, ExitOutcome, SendRequest};
pub use envelope::{Envelope, Message, Reply};
