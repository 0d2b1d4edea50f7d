use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DeliveryState, MessageId};
use crate::queue::AttemptRecord;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub in_flight: usize,
    pub retry_scheduled: usize,
    pub acknowledged: usize,
    pub dead_lettered: usize,
}

impl QueueCounts {
    /// Events not yet in a terminal state.
    pub fn pending(&self) -> usize {
        self.queued + self.in_flight + self.retry_scheduled
    }
}

/// Serializable view of a single message's delivery progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStatus {
    pub message_id: MessageId,
    pub state: DeliveryState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub recipient_domain: String,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<AttemptRecord>,
}
