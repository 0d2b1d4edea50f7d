//! Delivery state machine for a single email event.

use serde::{Deserialize, Serialize};

/// Delivery state.
///
/// State transitions:
/// - Queued -> InFlight -> Acknowledged
/// - Queued -> InFlight -> RetryScheduled -> Queued (until the attempt ceiling)
/// - Queued -> InFlight -> Queued (visibility timeout expired, redelivery)
/// - Queued -> InFlight -> DeadLettered (fatal failure or ceiling reached)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Ready to be leased.
    Queued,

    /// Leased by a worker; hidden until acked, failed or the visibility
    /// timeout expires.
    InFlight,

    /// Waiting for its backoff delay to elapse.
    RetryScheduled,

    /// Delivered (or deliberately suppressed). Removed from circulation.
    Acknowledged,

    /// Needs manual inspection.
    DeadLettered,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryState::Acknowledged | DeliveryState::DeadLettered
        )
    }

    pub fn is_leasable(self) -> bool {
        matches!(self, DeliveryState::Queued)
    }
}
