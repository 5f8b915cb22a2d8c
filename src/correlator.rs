//! Single-shot reply wait.
//!
//! Correlation is structural: every command owns an exclusive reply channel,
//! so the first message on it is the reply. Headers are not inspected and
//! the `correlation-id` is never matched.

use std::time::Duration;

use tracing::{debug, error};

use crate::bus::{BusError, ReplyChannel};
use crate::envelope::{EnvelopeError, Reply};

/// Hard bound on the reply wait.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum CorrelateError {
    #[error("No response in {} seconds", .0.as_secs())]
    TimedOut(Duration),

    #[error("Reply channel failed: {0}")]
    Transport(#[from] BusError),

    #[error("Reply channel closed before a reply arrived")]
    ChannelClosed,

    #[error(transparent)]
    Decode(#[from] EnvelopeError),
}

/// Wait for the one reply on `channel`.
///
/// Races the first delivery, a listener failure and the timer; whichever
/// completes first decides the outcome and nothing more is consumed.
#[tracing::instrument(name = "bus.await_reply", skip_all, fields(reply_to = %channel.reply_to()))]
pub async fn await_reply(
    channel: &mut ReplyChannel,
    timeout: Duration,
) -> Result<Reply, CorrelateError> {
    let raw = match tokio::time::timeout(timeout, channel.recv()).await {
        Ok(Some(Ok(raw))) => raw,
        Ok(Some(Err(e))) => {
            error!(error = %e, "Reply listener failed");
            return Err(CorrelateError::Transport(e));
        }
        Ok(None) => return Err(CorrelateError::ChannelClosed),
        Err(_) => {
            error!(timeout_secs = timeout.as_secs(), "No response before timeout");
            return Err(CorrelateError::TimedOut(timeout));
        }
    };

    debug!(bytes = raw.len(), "Received reply");
    Ok(Reply::decode(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_message_wins() {
        let (mut channel, tx) = ReplyChannel::new("q");
        tx.send(Ok(br#"{"status":"200","body":{"n":1}}"#.to_vec()))
            .await
            .unwrap();

        let reply = await_reply(&mut channel, REPLY_TIMEOUT).await.unwrap();
        assert_eq!(reply.body, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_listener_error_is_transport_error() {
        let (mut channel, tx) = ReplyChannel::new("q");
        tx.send(Err(BusError::Consume("broker went away".to_string())))
            .await
            .unwrap();

        let result = await_reply(&mut channel, REPLY_TIMEOUT).await;
        assert!(matches!(
            result,
            Err(CorrelateError::Transport(BusError::Consume(_)))
        ));
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (mut channel, tx) = ReplyChannel::new("q");
        drop(tx);

        let result = await_reply(&mut channel, REPLY_TIMEOUT).await;
        assert!(matches!(result, Err(CorrelateError::ChannelClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_sixty_seconds() {
        let (mut channel, _tx) = ReplyChannel::new("q");

        let started = tokio::time::Instant::now();
        let result = await_reply(&mut channel, REPLY_TIMEOUT).await;

        assert!(matches!(result, Err(CorrelateError::TimedOut(d)) if d == REPLY_TIMEOUT));
        assert!(started.elapsed() >= REPLY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_decode_error() {
        let (mut channel, tx) = ReplyChannel::new("q");
        tx.send(Ok(b"<html>".to_vec())).await.unwrap();

        let result = await_reply(&mut channel, REPLY_TIMEOUT).await;
        assert!(matches!(result, Err(CorrelateError::Decode(_))));
    }
}
