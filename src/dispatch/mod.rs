//! Send orchestration.
//!
//! One send per transport attempt: connect, provision a reply channel for
//! commands, encode and sign, publish, await the single reply, close. The
//! session is closed on every path, including publish failures and reply
//! timeouts.

use std::io::Write;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn, Instrument};

use crate::bus::{BrokerConnector, BrokerKind, BusError, Connector, Transport, TransportMode};
use crate::config::Credentials;
use crate::correlator::{self, CorrelateError, REPLY_TIMEOUT};
use crate::envelope::{Envelope, EnvelopeError, Message, Reply};
use crate::signing::SigningIdentity;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Correlate(#[from] CorrelateError),
}

/// Process-level result of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failure,
}

impl ExitOutcome {
    pub fn code(self) -> u8 {
        match self {
            ExitOutcome::Success => 0,
            ExitOutcome::Failure => 2,
        }
    }

    pub fn is_success(self) -> bool {
        self == ExitOutcome::Success
    }
}

impl From<ExitOutcome> for std::process::ExitCode {
    fn from(outcome: ExitOutcome) -> Self {
        std::process::ExitCode::from(outcome.code())
    }
}

/// What a single transport attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// An event was published; nothing is awaited.
    Published,
    /// A command got its reply.
    Replied(Reply),
}

impl Delivery {
    pub fn is_success(&self) -> bool {
        match self {
            Delivery::Published => true,
            Delivery::Replied(reply) => reply.is_success(),
        }
    }
}

/// A message plus where to send it.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub message: Message,
    pub mode: TransportMode,
}

/// Transport-agnostic sender.
pub struct Dispatcher<C> {
    connector: C,
    identity: SigningIdentity,
    reply_timeout: Duration,
}

impl Dispatcher<BrokerConnector> {
    /// Dispatcher for real brokers, signing as the resolved identity.
    pub fn from_credentials(credentials: &Credentials) -> Self {
        let identity = SigningIdentity::resolve(
            credentials.signing_seed_hex.as_deref(),
            credentials.user.as_deref(),
        );
        Self::new(BrokerConnector::new(credentials.clone()), identity)
    }
}

impl<C: Connector> Dispatcher<C> {
    pub fn new(connector: C, identity: SigningIdentity) -> Self {
        Self {
            connector,
            identity,
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    /// Override the reply wait bound.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Send through the transports `request.mode` names and report the outcome.
    ///
    /// Attempts are sequential: the next transport is only tried when the
    /// previous one failed, and the last attempt made is authoritative.
    /// Replies are written to `out` as they arrive.
    pub async fn send<W: Write>(&self, request: &SendRequest, out: &mut W) -> ExitOutcome {
        let attempts = request.mode.attempts();
        let mut outcome = ExitOutcome::Failure;

        for (index, kind) in attempts.iter().enumerate() {
            outcome = match self.send_via(*kind, &request.message).await {
                Ok(delivery) => {
                    if let Delivery::Replied(reply) = &delivery {
                        print_reply(reply, out);
                    }
                    if delivery.is_success() {
                        ExitOutcome::Success
                    } else {
                        ExitOutcome::Failure
                    }
                }
                Err(e) => {
                    error!(transport = %kind, error = %e, "Send failed");
                    ExitOutcome::Failure
                }
            };

            if outcome.is_success() {
                break;
            }
            if let Some(next) = attempts.get(index + 1) {
                warn!(failed = %kind, next = %next, "Falling back to next transport");
            }
        }

        outcome
    }

    /// One attempt over one transport.
    pub async fn send_via(
        &self,
        kind: BrokerKind,
        message: &Message,
    ) -> Result<Delivery, DispatchError> {
        let span = tracing::info_span!(
            "sbus.send",
            transport = %kind,
            routing_key = %message.routing_key,
            event = message.is_event
        );

        async {
            let mut transport = self.connector.connect(kind).await?;
            let result = self.exchange(transport.as_mut(), message).await;
            transport.close().await;
            result
        }
        .instrument(span)
        .await
    }

    async fn exchange(
        &self,
        transport: &mut dyn Transport,
        message: &Message,
    ) -> Result<Delivery, DispatchError> {
        let mut reply_channel = if message.is_event {
            None
        } else {
            Some(transport.open_reply_channel().await?)
        };

        let envelope = Envelope::encode(
            message,
            reply_channel.as_ref().map(|c| c.reply_to()),
            &self.identity,
            Utc::now(),
        )?;

        transport.publish(&envelope).await?;
        info!("Message published");

        match reply_channel.as_mut() {
            None => Ok(Delivery::Published),
            Some(channel) => {
                let reply = correlator::await_reply(channel, self.reply_timeout).await?;
                info!(status = %reply.status_display(), "Reply received");
                Ok(Delivery::Replied(reply))
            }
        }
    }
}

/// Raw status, blank line, pretty body, blank line.
fn print_reply<W: Write>(reply: &Reply, out: &mut W) {
    if let Err(e) = write!(
        out,
        "\n{}\n\n{}\n\n",
        reply.status_display(),
        reply.pretty_body()
    ) {
        warn!(error = %e, "Failed to write reply");
    }
}
