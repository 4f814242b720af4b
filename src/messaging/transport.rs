//! Transport Abstraction
//!
//! A [`Transport`] attempts to hand one message to its recipient, once. Everything
//! reliable (retries, acknowledgments, dead lettering) lives above it in the
//! delivery service. Recipients answer through the [`AckSender`] passed with each
//! send; acknowledgments flow back to the delivery loop over a channel.

use super::errors::MessagingResult;
use super::message::{Acknowledgment, Message};
use async_trait::async_trait;
use std::fmt::Debug;
use tokio::sync::mpsc;
use tracing::debug;

/// One-shot message transport to a recipient
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Attempt to deliver `message`. `Ok` means the recipient accepted it; a later
    /// acknowledgment, if the message requires one, arrives through `acks`.
    async fn send(&self, message: &Message, acks: &AckSender) -> MessagingResult<()>;
}

/// Handle recipients use to acknowledge messages back to the delivery service
#[derive(Debug, Clone)]
pub struct AckSender {
    inner: mpsc::UnboundedSender<Acknowledgment>,
}

impl AckSender {
    pub fn channel() -> (AckSender, mpsc::UnboundedReceiver<Acknowledgment>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AckSender { inner: tx }, rx)
    }

    /// Forward an acknowledgment; returns `false` once the delivery service has stopped
    pub fn acknowledge(&self, ack: Acknowledgment) -> bool {
        let message_id = ack.message_id;
        match self.inner.send(ack) {
            Ok(()) => true,
            Err(_) => {
                debug!(%message_id, "Delivery service stopped, acknowledgment discarded");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_ack_sender_forwards_to_receiver() {
        let (sender, mut receiver) = AckSender::channel();
        let id = Uuid::new_v4();
        assert!(sender.acknowledge(Acknowledgment::success(id, None, Duration::ZERO)));

        let received = receiver.recv().await.expect("ack");
        assert_eq!(received.message_id, id);
    }

    #[tokio::test]
    async fn test_ack_sender_reports_closed_receiver() {
        let (sender, receiver) = AckSender::channel();
        drop(receiver);
        assert!(sender.is_closed());
        assert!(!sender.acknowledge(Acknowledgment::failure(
            Uuid::new_v4(),
            "gone",
            Duration::ZERO
        )));
    }
}
