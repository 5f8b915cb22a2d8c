//! Mock transport for testing.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{BrokerKind, BusError, Connector, ReplyChannel, Result, Transport};
use crate::envelope::Envelope;

/// What the mock reply channel does once opened.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Deliver these raw bytes as the reply.
    Payload(Vec<u8>),
    /// Report a consumer failure.
    ReadError(String),
    /// Never deliver anything.
    Silent,
}

/// Everything a mock session saw. Shared with the test through `Arc`.
#[derive(Debug, Default)]
pub struct MockRecord {
    pub published: Vec<Envelope>,
    pub reply_channels_opened: usize,
    pub closes: usize,
}

/// Scripted transport session.
pub struct MockTransport {
    kind: BrokerKind,
    reply: MockReply,
    fail_on_publish: bool,
    fail_on_open: bool,
    record: Arc<Mutex<MockRecord>>,
}

impl MockTransport {
    pub fn new(kind: BrokerKind, reply: MockReply) -> Self {
        Self {
            kind,
            reply,
            fail_on_publish: false,
            fail_on_open: false,
            record: Arc::new(Mutex::new(MockRecord::default())),
        }
    }

    pub fn with_fail_on_publish(mut self, fail: bool) -> Self {
        self.fail_on_publish = fail;
        self
    }

    pub fn with_fail_on_open(mut self, fail: bool) -> Self {
        self.fail_on_open = fail;
        self
    }

    /// Handle for inspecting the session after it has been consumed.
    pub fn record(&self) -> Arc<Mutex<MockRecord>> {
        Arc::clone(&self.record)
    }

    fn with_record<T>(&self, f: impl FnOnce(&mut MockRecord) -> T) -> T {
        let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut record)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> BrokerKind {
        self.kind
    }

    async fn open_reply_channel(&mut self) -> Result<ReplyChannel> {
        if self.fail_on_open {
            return Err(BusError::Declare("Mock declare failure".to_string()));
        }
        self.with_record(|r| r.reply_channels_opened += 1);

        let (channel, tx) = ReplyChannel::new(format!("mock.{}", self.kind));
        let reply = self.reply.clone();
        let listener = tokio::spawn(async move {
            match reply {
                MockReply::Payload(bytes) => {
                    let _ = tx.send(Ok(bytes)).await;
                }
                MockReply::ReadError(message) => {
                    let _ = tx.send(Err(BusError::Consume(message))).await;
                }
                MockReply::Silent => {
                    // Keep the sender alive until aborted
                    std::future::pending::<()>().await;
                    drop(tx);
                }
            }
        });

        Ok(channel.with_listener(listener))
    }

    async fn publish(&mut self, envelope: &Envelope) -> Result<()> {
        if self.fail_on_publish {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }
        self.with_record(|r| r.published.push(envelope.clone()));
        Ok(())
    }

    async fn close(&mut self) {
        self.with_record(|r| r.closes += 1);
    }
}

/// Hands out pre-built mock sessions, one per broker kind.
#[derive(Default)]
pub struct MockConnector {
    sessions: Mutex<Vec<MockTransport>>,
    connects: Mutex<Vec<BrokerKind>>,
    fail_connect: Mutex<Vec<BrokerKind>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a session; the first queued session of the requested kind is used.
    pub fn with_session(self, session: MockTransport) -> Self {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(session);
        self
    }

    /// Make connecting to `kind` fail.
    pub fn with_connect_failure(self, kind: BrokerKind) -> Self {
        self.fail_connect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(kind);
        self
    }

    /// Kinds connected to, in order.
    pub fn connects(&self) -> Vec<BrokerKind> {
        self.connects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, kind: BrokerKind) -> Result<Box<dyn Transport>> {
        self.connects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(kind);

        if self
            .fail_connect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&kind)
        {
            return Err(BusError::Connection(format!("Mock {} unreachable", kind)));
        }

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let index = sessions
            .iter()
            .position(|s| s.kind == kind)
            .ok_or_else(|| BusError::Connection(format!("No mock session for {}", kind)))?;
        Ok(Box::new(sessions.remove(index)))
    }
}
