//! Broker transports for sbus messages.
//!
//! This module contains:
//! - `Transport` trait: publish an envelope, provision a reply channel, tear down
//! - `Connector` trait: opens a fresh transport session per send
//! - `ReplyChannel`: the exclusive channel a command's single reply arrives on
//! - Implementations: AMQP (RabbitMQ), Kafka, Mock

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Credentials;
use crate::envelope::Envelope;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
pub use mock::{MockConnector, MockTransport};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Declare failed: {0}")]
    Declare(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Topic administration failed: {0}")]
    Topic(String),

    #[error("Transport '{0}' not compiled into this build")]
    Unsupported(BrokerKind),
}

/// A single send's session with one broker.
///
/// Sessions are opened by a [`Connector`], used for exactly one envelope and
/// closed afterwards. `close` must run on every exit path; implementations
/// release whatever the session provisioned (connection, reply topic).
#[async_trait]
pub trait Transport: Send {
    /// Which broker this session talks to.
    fn kind(&self) -> BrokerKind;

    /// Provision the exclusive channel the reply to a command arrives on.
    ///
    /// The returned channel's `reply_to` is the transport-specific address
    /// to advertise in the envelope's `reply-to` header.
    async fn open_reply_channel(&mut self) -> Result<ReplyChannel>;

    /// Publish an encoded envelope.
    async fn publish(&mut self, envelope: &Envelope) -> Result<()>;

    /// Tear the session down. Failures are logged, never returned.
    async fn close(&mut self);
}

/// Opens transport sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, kind: BrokerKind) -> Result<Box<dyn Transport>>;
}

// ============================================================================
// Reply channel
// ============================================================================

/// Receiving half of a command's reply channel.
///
/// A background listener owned by the transport pushes at most one raw
/// reply payload (or the read error that ended it) into the channel. The
/// listener is aborted when the channel is dropped, so abandoning the wait
/// stops consumption.
pub struct ReplyChannel {
    reply_to: String,
    rx: mpsc::Receiver<Result<Vec<u8>>>,
    listener: Option<JoinHandle<()>>,
}

impl ReplyChannel {
    /// Create a channel and the sender its listener reports through.
    pub fn new(reply_to: impl Into<String>) -> (Self, mpsc::Sender<Result<Vec<u8>>>) {
        let (tx, rx) = mpsc::channel(1);
        let channel = Self {
            reply_to: reply_to.into(),
            rx,
            listener: None,
        };
        (channel, tx)
    }

    /// Attach the background task feeding this channel.
    pub fn with_listener(mut self, listener: JoinHandle<()>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Address advertised in the `reply-to` header.
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Wait for the next item from the listener.
    ///
    /// `None` means the listener went away without reporting anything.
    pub async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        self.rx.recv().await
    }
}

impl Drop for ReplyChannel {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl fmt::Debug for ReplyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyChannel")
            .field("reply_to", &self.reply_to)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Broker selection
// ============================================================================

/// Broker family a transport session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Amqp,
    Kafka,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerKind::Amqp => f.write_str("rabbitmq"),
            BrokerKind::Kafka => f.write_str("kafka"),
        }
    }
}

/// Transport selection from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportMode {
    /// AMQP only.
    #[default]
    Rabbitmq,
    /// Kafka only.
    Kafka,
    /// AMQP first, Kafka only if AMQP reports failure.
    All,
}

impl TransportMode {
    /// Brokers to attempt, in order.
    pub fn attempts(self) -> &'static [BrokerKind] {
        match self {
            TransportMode::Rabbitmq => &[BrokerKind::Amqp],
            TransportMode::Kafka => &[BrokerKind::Kafka],
            TransportMode::All => &[BrokerKind::Amqp, BrokerKind::Kafka],
        }
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rabbitmq" => Ok(TransportMode::Rabbitmq),
            "kafka" => Ok(TransportMode::Kafka),
            "all" => Ok(TransportMode::All),
            other => Err(format!(
                "unknown transport '{}', expected rabbitmq, kafka or all",
                other
            )),
        }
    }
}

// ============================================================================
// Production connector
// ============================================================================

/// Connects to the brokers named by resolved credentials.
#[derive(Debug, Clone)]
pub struct BrokerConnector {
    #[cfg_attr(not(any(feature = "amqp", feature = "kafka")), allow(dead_code))]
    credentials: Credentials,
}

impl BrokerConnector {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Connector for BrokerConnector {
    async fn connect(&self, kind: BrokerKind) -> Result<Box<dyn Transport>> {
        info!(transport = %kind, "Opening transport session");
        match kind {
            #[cfg(feature = "amqp")]
            BrokerKind::Amqp => {
                let transport = AmqpTransport::connect(&self.credentials.amqp_url).await?;
                Ok(Box::new(transport))
            }
            #[cfg(feature = "kafka")]
            BrokerKind::Kafka => {
                let transport = KafkaTransport::connect(&self.credentials.kafka_url)?;
                Ok(Box::new(transport))
            }
            #[allow(unreachable_patterns)]
            other => Err(BusError::Unsupported(other)),
        }
    }
}
