//! Dispatcher - turns a delivered event into a provider call and an outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::subscription::{HandlerError, MessageHandler};
use crate::domain::{DeliveryOutcome, EmailEvent, EnvironmentPolicy};
use crate::ports::{DeliveryContext, DeliveryTransport, OutboundMessage, TransportError};

/// Map a provider status code to an outcome.
///
/// - 2xx: delivered.
/// - 408, 429, 5xx: transient, retry.
/// - anything else: the provider refused this message; retrying won't help.
pub fn classify_status(status: u16) -> DeliveryOutcome {
    match status {
        200..=299 => DeliveryOutcome::success().with_status(status),
        408 | 429 | 500..=599 => {
            DeliveryOutcome::retryable("provider temporarily unavailable").with_status(status)
        }
        _ => DeliveryOutcome::fatal("provider rejected the message").with_status(status),
    }
}

pub struct Dispatcher {
    policy: EnvironmentPolicy,
    transport: Arc<dyn DeliveryTransport>,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(policy: EnvironmentPolicy, transport: Arc<dyn DeliveryTransport>) -> Self {
        Self {
            policy,
            transport,
            send_timeout: Duration::from_secs(10),
        }
    }

    /// Bound on a single provider call, on top of the lease deadline.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn policy(&self) -> &EnvironmentPolicy {
        &self.policy
    }

    async fn deliver(
        &self,
        event: &EmailEvent,
        ctx: &DeliveryContext,
    ) -> Result<DeliveryOutcome, HandlerError> {
        let message = OutboundMessage::from_event(event);
        let deadline = ctx.deadline.min(Instant::now() + self.send_timeout);

        let result = tokio::select! {
            _ = ctx.aborted() => return Err(HandlerError::Aborted),
            res = tokio::time::timeout_at(deadline, self.transport.send(&message, ctx)) => res,
        };

        let outcome = match result {
            Err(_elapsed) => DeliveryOutcome::retryable("provider call timed out"),
            Ok(Err(TransportError::Aborted)) => return Err(HandlerError::Aborted),
            Ok(Err(e)) if e.is_retryable() => DeliveryOutcome::retryable(e.to_string()),
            Ok(Err(e)) => DeliveryOutcome::fatal(e.to_string()),
            Ok(Ok(status)) => classify_status(status),
        };
        Ok(outcome)
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(
        &self,
        event: &EmailEvent,
        ctx: &DeliveryContext,
    ) -> Result<DeliveryOutcome, HandlerError> {
        let recipient_domain = event.recipient().domain();

        // Suppression is a success: nothing to retry outside production.
        if !self.policy.is_production() {
            info!(
                environment = %self.policy.environment(),
                message_id = %ctx.message_id,
                recipient_domain,
                "skipping email delivery in non-production environment"
            );
            return Ok(DeliveryOutcome::success());
        }

        let outcome = self.deliver(event, ctx).await?;
        let status = outcome.status_code;
        if outcome.success {
            info!(message_id = %ctx.message_id, attempt = ctx.attempt, recipient_domain, status, "email delivered");
        } else if outcome.retryable {
            warn!(
                message_id = %ctx.message_id,
                attempt = ctx.attempt,
                recipient_domain,
                status,
                error = %outcome.describe(),
                "email delivery failed, will retry"
            );
        } else {
            error!(
                message_id = %ctx.message_id,
                attempt = ctx.attempt,
                recipient_domain,
                status,
                error = %outcome.describe(),
                "email rejected by provider"
            );
        }
        Ok(outcome)
    }
}
