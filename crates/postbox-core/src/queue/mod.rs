//! Queue module: the at-least-once topic, its retry policy, the local
//! implementation and the spool it writes through to.

mod local;
mod record;
mod retry;
mod store;

pub use local::{LocalQueue, QueueConfig};
pub use record::{AttemptRecord, MessageRecord};
pub use retry::RetryPolicy;
pub use store::{FileRecordStore, RecordStore};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::{DeliveryOutcome, DeliveryState, EmailEvent, MessageId};
use crate::error::QueueError;
use crate::observability::{MessageStatus, QueueCounts};

/// Topic email events are published to.
pub const EMAILS_TOPIC: &str = "emails";

/// The consumer group that sends them.
pub const SEND_EMAIL_GROUP: &str = "send-email";

/// A leased event.
///
/// The holder either settles it (`ack` / `fail`) or drops it. A dropped lease
/// is redelivered once its visibility deadline passes.
///
/// - The queue owns state transitions and the retry decision.
/// - The worker runs side effects and reports the result.
/// - The event is exposed by reference only; it is never mutated.
#[async_trait]
pub trait MessageLease: Send {
    fn message_id(&self) -> MessageId;

    fn event(&self) -> &EmailEvent;

    /// 1 for the first delivery, 2 for the first redelivery, ...
    fn attempt(&self) -> u32;

    /// Visibility deadline; after it the event may be handed out again.
    fn deadline(&self) -> Instant;

    /// Mark delivered. Returns the resulting state.
    async fn ack(self: Box<Self>) -> Result<DeliveryState, QueueError>;

    /// Report a failed attempt; the queue decides between retry and
    /// dead-letter. Returns the resulting state.
    async fn fail(self: Box<Self>, outcome: DeliveryOutcome) -> Result<DeliveryState, QueueError>;
}

/// Queue port.
///
/// Delivery is at-least-once: an event surfaces again if its lease is not
/// settled before the visibility deadline or if it is failed as retryable.
/// No ordering or deduplication is provided.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn topic(&self) -> &str;

    /// Enqueue an event durably and return its queue-assigned id. Does not
    /// wait for delivery. Fails with `Unavailable` when the backing store
    /// cannot take the write; nothing is enqueued then.
    async fn publish(&self, event: EmailEvent) -> Result<MessageId, QueueError>;

    /// Register the topic's single consumer group.
    async fn subscribe(&self, group: &str) -> Result<(), QueueError>;

    /// Lease one ready event, waiting until one is available. Returns `None`
    /// once the queue is closed.
    async fn lease(&self) -> Option<Box<dyn MessageLease>>;

    /// Stop handing out leases and refuse new publishes.
    async fn close(&self);

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    async fn status(&self, id: MessageId) -> Result<Option<MessageStatus>, QueueError>;

    async fn dead_letters(&self) -> Result<Vec<MessageStatus>, QueueError>;
}
