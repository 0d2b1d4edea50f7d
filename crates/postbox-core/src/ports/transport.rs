//! DeliveryTransport port: the email provider as a single capability.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::domain::{Address, EmailEvent, MessageId};

/// A fully formed message, ready for the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub from: Address,
    pub to: Address,
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl OutboundMessage {
    pub fn from_event(event: &EmailEvent) -> Self {
        Self {
            from: event.sender().clone(),
            to: event.recipient().clone(),
            subject: event.subject().to_string(),
            text: event.plain_text_content().to_string(),
            html: event.html_content().to_string(),
        }
    }
}

/// Errors a transport reports without a provider status code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    /// The request could not be built or was refused before reaching the
    /// provider (bad credential, malformed message).
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("delivery aborted by shutdown")]
    Aborted,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout(_) => true,
            TransportError::Rejected(_) | TransportError::Aborted => false,
        }
    }
}

/// Per-delivery context shared with the transport.
///
/// Carries the lease's visibility deadline and the worker group's abort
/// signal, so a stuck provider call can be bounded and cancelled.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub message_id: MessageId,
    pub attempt: u32,
    pub deadline: Instant,
    abort: watch::Receiver<bool>,
}

impl DeliveryContext {
    pub fn new(
        message_id: MessageId,
        attempt: u32,
        deadline: Instant,
        abort: watch::Receiver<bool>,
    ) -> Self {
        Self {
            message_id,
            attempt,
            deadline,
            abort,
        }
    }

    /// A context that is never aborted.
    pub fn detached(message_id: MessageId, attempt: u32, deadline: Instant) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(message_id, attempt, deadline, rx)
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Resolves once abort is signalled. Pends forever if the sender is gone
    /// without having signalled.
    pub async fn aborted(&self) {
        let mut rx = self.abort.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// The provider capability.
///
/// Returns the provider's HTTP status code when a response was received, even
/// a non-success one; classification is the dispatcher's job.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send(
        &self,
        message: &OutboundMessage,
        ctx: &DeliveryContext,
    ) -> Result<u16, TransportError>;
}
