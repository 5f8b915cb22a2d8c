//! Kafka transport.
//!
//! Envelopes are published to a topic named after the routing key, with a
//! random message key. A command's reply arrives on an ephemeral
//! `cli.<uuid>` topic (1 partition, replication factor 1) created before
//! publishing and deleted when the transport closes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message as KafkaMessage, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::{BrokerKind, BusError, ReplyChannel, Result, Transport};
use crate::envelope::{random_id, Envelope, HEADER_ROUTING_KEY};

/// Prefix of ephemeral reply topics.
pub const REPLY_TOPIC_PREFIX: &str = "cli.";

/// Length of the random message key.
const MESSAGE_KEY_LEN: usize = 32;

/// How long the producer may queue a message before giving up.
const PRODUCE_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

type Admin = AdminClient<DefaultClientContext>;

/// Name for a fresh reply topic.
pub fn reply_topic_name() -> String {
    format!("{}{}", REPLY_TOPIC_PREFIX, uuid::Uuid::new_v4())
}

/// Envelope headers as Kafka headers, all values UTF-8 text.
///
/// A `routing-key` header leads, followed by the envelope's own headers in
/// order (including `reply-to` for commands).
pub fn kafka_headers(envelope: &Envelope) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new().insert(Header {
        key: HEADER_ROUTING_KEY,
        value: Some(envelope.routing_key().as_bytes()),
    });
    for (name, value) in envelope.headers().iter() {
        let wire = value.to_wire_string();
        headers = headers.insert(Header {
            key: name,
            value: Some(wire.as_bytes()),
        });
    }
    headers
}

fn client_config(bootstrap_servers: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", bootstrap_servers);
    config
}

// ============================================================================
// Ephemeral reply topic
// ============================================================================

/// A reply topic that must not outlive its request.
///
/// [`release`](EphemeralTopic::release) deletes it; if the guard is dropped
/// without being released, deletion is spawned onto the runtime instead.
/// Either way deletion is attempted exactly once.
pub struct EphemeralTopic {
    name: String,
    admin: Arc<Admin>,
    released: bool,
}

impl EphemeralTopic {
    /// Create the topic. Failure aborts the send.
    async fn create(admin: Arc<Admin>, name: String) -> Result<Self> {
        let results = admin
            .create_topics(
                &[NewTopic::new(&name, 1, TopicReplication::Fixed(1))],
                &AdminOptions::new(),
            )
            .await
            .map_err(|e| BusError::Topic(format!("Failed to create topic {}: {}", name, e)))?;

        for result in results {
            if let Err((topic, code)) = result {
                return Err(BusError::Topic(format!(
                    "Failed to create topic {}: {}",
                    topic, code
                )));
            }
        }

        info!(topic = %name, "Created reply topic");
        Ok(Self {
            name,
            admin,
            released: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delete the topic now. Best effort: failures are logged.
    pub async fn release(mut self) {
        self.released = true;
        delete_topic(&self.admin, &self.name).await;
    }
}

impl Drop for EphemeralTopic {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let admin = Arc::clone(&self.admin);
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { delete_topic(&admin, &name).await });
            }
            Err(_) => warn!(topic = %name, "No runtime to delete reply topic, leaking it"),
        }
    }
}

async fn delete_topic(admin: &Admin, name: &str) {
    match admin.delete_topics(&[name], &AdminOptions::new()).await {
        Ok(results) => {
            for result in results {
                match result {
                    Ok(topic) => debug!(topic = %topic, "Deleted reply topic"),
                    Err((topic, code)) => {
                        warn!(topic = %topic, error = %code, "Failed to delete reply topic")
                    }
                }
            }
        }
        Err(e) => warn!(topic = %name, error = %e, "Failed to delete reply topic"),
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Producer plus admin client, used for a single send.
pub struct KafkaTransport {
    bootstrap_servers: String,
    producer: FutureProducer,
    admin: Arc<Admin>,
    reply_topic: Option<EphemeralTopic>,
}

impl KafkaTransport {
    /// Create the producer and admin client. Neither dials until first use.
    pub fn connect(bootstrap_servers: &str) -> Result<Self> {
        let producer: FutureProducer = client_config(bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {}", e)))?;

        let admin: Admin = client_config(bootstrap_servers)
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka admin: {}", e)))?;

        info!(bootstrap_servers = %bootstrap_servers, "Connected to Kafka");

        Ok(Self {
            bootstrap_servers: bootstrap_servers.to_string(),
            producer,
            admin: Arc::new(admin),
            reply_topic: None,
        })
    }

    /// Name of the reply topic, while it exists.
    pub fn reply_topic(&self) -> Option<&str> {
        self.reply_topic.as_ref().map(EphemeralTopic::name)
    }

    fn reply_consumer(&self, topic: &str) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = client_config(&self.bootstrap_servers)
            .set("group.id", topic)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BusError::Consume(format!("Failed to create Kafka consumer: {}", e)))?;

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, 0, Offset::Beginning)
            .map_err(|e| BusError::Consume(format!("Failed to build assignment: {}", e)))?;
        consumer
            .assign(&assignment)
            .map_err(|e| BusError::Consume(format!("Failed to assign {}: {}", topic, e)))?;

        Ok(consumer)
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Kafka
    }

    async fn open_reply_channel(&mut self) -> Result<ReplyChannel> {
        let topic = EphemeralTopic::create(Arc::clone(&self.admin), reply_topic_name()).await?;
        let name = topic.name().to_string();
        // Owned by the transport from here on, so close() deletes it on every path
        self.reply_topic = Some(topic);

        let consumer = self.reply_consumer(&name)?;

        let (channel, tx) = ReplyChannel::new(name);
        let listener = tokio::spawn(async move {
            let item = match consumer.recv().await {
                Ok(message) => Ok(message.payload().map(<[u8]>::to_vec).unwrap_or_default()),
                Err(e) => Err(BusError::Consume(format!("Consumer error: {}", e))),
            };
            let _ = tx.send(item).await;
        });

        Ok(channel.with_listener(listener))
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(transport = "kafka", topic = %envelope.routing_key()))]
    async fn publish(&mut self, envelope: &Envelope) -> Result<()> {
        let key = random_id(MESSAGE_KEY_LEN);
        let record = FutureRecord::to(envelope.routing_key())
            .payload(envelope.payload())
            .key(&key)
            .headers(kafka_headers(envelope));

        let (partition, offset) = self
            .producer
            .send(record, PRODUCE_QUEUE_TIMEOUT)
            .await
            .map_err(|(e, _)| BusError::Publish(format!("Failed to publish: {}", e)))?;

        debug!(partition, offset, "Published envelope to Kafka");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(topic) = self.reply_topic.take() {
            topic.release().await;
        }
    }
}
