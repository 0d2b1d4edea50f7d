//! Publisher - the request-path half of the pipeline.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::{EmailEvent, SendParams, SendResponse};
use crate::error::PublishError;
use crate::queue::MessageQueue;

/// Validates send requests and enqueues them.
///
/// Never touches the transport: the caller gets its message id as soon as the
/// queue has accepted the event.
#[derive(Clone)]
pub struct Publisher {
    queue: Arc<dyn MessageQueue>,
}

impl Publisher {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }

    pub async fn send(&self, params: &SendParams) -> Result<SendResponse, PublishError> {
        let event = EmailEvent::from_params(params).inspect_err(|e| {
            debug!(error = %e, "send request rejected");
        })?;
        let recipient_domain = event.recipient().domain().to_string();

        let message_id = self.queue.publish(event).await.inspect_err(|e| {
            warn!(topic = self.queue.topic(), error = %e, "failed to enqueue email");
        })?;

        info!(
            topic = self.queue.topic(),
            message_id = %message_id,
            recipient_domain = %recipient_domain,
            "email queued"
        );
        Ok(SendResponse { message_id })
    }
}
