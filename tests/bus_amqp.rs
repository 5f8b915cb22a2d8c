//! AMQP/RabbitMQ transport integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --ignored --nocapture
//!
//! These tests spin up RabbitMQ in a container and play the service side of
//! the exchange with a bare lapin consumer.

#![cfg(feature = "amqp")]

use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use sbus_cli::bus::amqp::{AmqpTransport, COMMANDS_EXCHANGE, EVENTS_EXCHANGE};
use sbus_cli::bus::{BrokerKind, Transport, TransportMode};
use sbus_cli::config::{Credentials, EnvironmentName};
use sbus_cli::dispatch::{Dispatcher, ExitOutcome, SendRequest};
use sbus_cli::envelope::Message;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

const SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

fn credentials(amqp_url: &str) -> Credentials {
    Credentials {
        environment: EnvironmentName::new("it"),
        user: Some("alice".to_string()),
        signing_seed_hex: Some(SEED.to_string()),
        amqp_url: amqp_url.to_string(),
        kafka_url: "localhost:1".to_string(),
    }
}

/// Channel with both sbus exchanges declared.
async fn service_channel(amqp_url: &str) -> (Connection, Channel) {
    let connection = Connection::connect(amqp_url, ConnectionProperties::default())
        .await
        .expect("Failed to connect");
    let channel = connection
        .create_channel()
        .await
        .expect("Failed to open channel");

    for exchange in [COMMANDS_EXCHANGE, EVENTS_EXCHANGE] {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .expect("Failed to declare exchange");
    }

    (connection, channel)
}

async fn bind_queue(channel: &Channel, exchange: &str, routing_key: &str) -> String {
    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .expect("Failed to declare service queue");
    let name = queue.name().as_str().to_string();

    channel
        .queue_bind(
            &name,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .expect("Failed to bind service queue");
    name
}

/// Service that answers each command with `reply` and forwards what it saw.
async fn spawn_responder(
    channel: Channel,
    queue: String,
    reply: &'static str,
) -> mpsc::Receiver<(Vec<u8>, BasicProperties)> {
    let mut consumer = channel
        .basic_consume(
            &queue,
            "responder",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .expect("Failed to consume");

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        while let Some(Ok(delivery)) = consumer.next().await {
            delivery.ack(BasicAckOptions::default()).await.ok();
            if let Some(reply_to) = delivery.properties.reply_to() {
                channel
                    .basic_publish(
                        "",
                        reply_to.as_str(),
                        BasicPublishOptions::default(),
                        reply.as_bytes(),
                        BasicProperties::default(),
                    )
                    .await
                    .expect("Failed to publish reply");
            }
            let _ = tx
                .send((delivery.data.clone(), delivery.properties.clone()))
                .await;
        }
    });
    rx
}

fn header_text(properties: &BasicProperties, name: &str) -> Option<String> {
    let headers = properties.headers().as_ref()?;
    let (_, value) = headers.inner().iter().find(|(key, _)| key.as_str() == name)?;
    match value {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        _ => None,
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_command_round_trip() {
    let (_container, amqp_url) = start_rabbitmq().await;
    let (_conn, channel) = service_channel(&amqp_url).await;
    let queue = bind_queue(&channel, COMMANDS_EXCHANGE, "echo").await;
    let mut seen = spawn_responder(channel, queue, r#"{"status":200,"body":{"x":1}}"#).await;

    let dispatcher = Dispatcher::from_credentials(&credentials(&amqp_url));
    let request = SendRequest {
        message: Message::command("echo", r#"{"x":1}"#),
        mode: TransportMode::Rabbitmq,
    };
    let mut out = Vec::new();
    let outcome = dispatcher.send(&request, &mut out).await;

    assert_eq!(outcome, ExitOutcome::Success);
    assert!(String::from_utf8(out).unwrap().contains("{\n  \"x\": 1\n}"));

    let (payload, properties) = tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .expect("Service never saw the command")
        .expect("Responder stopped");
    assert_eq!(payload, br#"{"body":{"x":1}}"#);
    assert_eq!(properties.delivery_mode(), &Some(1));
    assert!(properties.reply_to().is_some());
    assert_eq!(header_text(&properties, "origin").as_deref(), Some("alice"));
    assert!(header_text(&properties, "signature").is_some());
    assert_eq!(
        header_text(&properties, "correlation-id").map(|c| c.len()),
        Some(32)
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_failing_status_exits_two() {
    let (_container, amqp_url) = start_rabbitmq().await;
    let (_conn, channel) = service_channel(&amqp_url).await;
    let queue = bind_queue(&channel, COMMANDS_EXCHANGE, "missing").await;
    let _seen = spawn_responder(channel, queue, r#"{"status":"404","body":{}}"#).await;

    let dispatcher = Dispatcher::from_credentials(&credentials(&amqp_url));
    let request = SendRequest {
        message: Message::command("missing", "{}"),
        mode: TransportMode::Rabbitmq,
    };
    let outcome = dispatcher.send(&request, &mut Vec::new()).await;
    assert_eq!(outcome.code(), 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_event_goes_to_events_exchange() {
    let (_container, amqp_url) = start_rabbitmq().await;
    let (_conn, channel) = service_channel(&amqp_url).await;
    let queue = bind_queue(&channel, EVENTS_EXCHANGE, "orders.created").await;
    let mut seen = spawn_responder(channel, queue, "{}").await;

    let dispatcher = Dispatcher::from_credentials(&credentials(&amqp_url));
    let request = SendRequest {
        message: Message::event("orders.created", r#"{"id":7}"#),
        mode: TransportMode::Rabbitmq,
    };
    let outcome = dispatcher.send(&request, &mut Vec::new()).await;
    assert_eq!(outcome, ExitOutcome::Success);

    let (payload, properties) = tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .expect("Service never saw the event")
        .expect("Responder stopped");
    assert_eq!(payload, br#"{"body":{"id":7}}"#);
    // Events advertise an empty reply-to, never a queue
    assert!(properties
        .reply_to()
        .as_ref()
        .map_or(true, |reply_to| reply_to.as_str().is_empty()));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_reply_queue_is_exclusive_and_named() {
    let (_container, amqp_url) = start_rabbitmq().await;

    let mut transport = AmqpTransport::connect(&amqp_url)
        .await
        .expect("Failed to connect");
    assert_eq!(transport.kind(), BrokerKind::Amqp);

    let channel = transport
        .open_reply_channel()
        .await
        .expect("Failed to open reply channel");
    assert!(channel.reply_to().starts_with("amq.gen-"));
    assert_eq!(transport.reply_queue(), Some(channel.reply_to()));

    // Exclusive queues refuse a second connection's consumer
    let (_conn, other) = service_channel(&amqp_url).await;
    let result = other
        .basic_consume(
            channel.reply_to(),
            "intruder",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await;
    assert!(result.is_err());

    transport.close().await;
    transport.close().await;
}
