//! Message record: event + delivery metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::domain::{DeliveryOutcome, DeliveryState, EmailEvent, MessageId};

/// One delivery attempt, kept for diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub outcome: DeliveryOutcome,
    pub finished_at: DateTime<Utc>,
}

/// The queue's source of truth for a single event.
///
/// Queue structures (ready / scheduled / in-flight timers) hold ids only; all
/// state transitions happen here. This is also the unit written to the spool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub event: EmailEvent,
    pub state: DeliveryState,

    /// Number of deliveries so far, including the current one if in flight.
    pub attempts: u32,

    /// Bumped on every lease. Settlements and timers carrying an older value
    /// are stale.
    pub lease_seq: u64,

    pub last_error: Option<String>,

    /// When a scheduled retry becomes due. Process-local, not spooled.
    #[serde(skip)]
    pub next_run_at: Option<Instant>,

    /// Visibility deadline of the current lease. Process-local, not spooled.
    #[serde(skip)]
    pub visible_at: Option<Instant>,

    pub history: Vec<AttemptRecord>,

    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(id: MessageId, event: EmailEvent, now: DateTime<Utc>) -> Self {
        Self {
            id,
            event,
            state: DeliveryState::Queued,
            attempts: 0,
            lease_seq: 0,
            last_error: None,
            next_run_at: None,
            visible_at: None,
            history: Vec::new(),
            published_at: now,
            updated_at: now,
        }
    }

    /// Queued -> InFlight. Returns the new lease sequence number.
    pub fn start_attempt(&mut self, visible_at: Instant, now: DateTime<Utc>) -> u64 {
        self.state = DeliveryState::InFlight;
        self.attempts += 1;
        self.lease_seq += 1;
        self.visible_at = Some(visible_at);
        self.updated_at = now;
        self.lease_seq
    }

    pub fn mark_acknowledged(&mut self, outcome: DeliveryOutcome, now: DateTime<Utc>) {
        self.record_attempt(outcome, now);
        self.state = DeliveryState::Acknowledged;
        self.visible_at = None;
        self.next_run_at = None;
    }

    pub fn mark_dead_lettered(&mut self, outcome: DeliveryOutcome, now: DateTime<Utc>) {
        self.last_error = Some(outcome.describe());
        self.record_attempt(outcome, now);
        self.state = DeliveryState::DeadLettered;
        self.visible_at = None;
        self.next_run_at = None;
    }

    pub fn schedule_retry(
        &mut self,
        next_run_at: Instant,
        outcome: DeliveryOutcome,
        now: DateTime<Utc>,
    ) {
        self.last_error = Some(outcome.describe());
        self.record_attempt(outcome, now);
        self.state = DeliveryState::RetryScheduled;
        self.visible_at = None;
        self.next_run_at = Some(next_run_at);
    }

    /// InFlight -> Queued after the visibility timeout expired.
    pub fn expire_lease(&mut self, outcome: DeliveryOutcome, now: DateTime<Utc>) {
        self.last_error = Some(outcome.describe());
        self.record_attempt(outcome, now);
        self.state = DeliveryState::Queued;
        self.visible_at = None;
    }

    /// RetryScheduled -> Queued.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.state = DeliveryState::Queued;
        self.next_run_at = None;
        self.updated_at = now;
    }

    /// Bring a record loaded from the spool back into a leasable state.
    ///
    /// A lease or backoff timer from the previous process is gone, so InFlight
    /// and RetryScheduled both go back to Queued. The interrupted attempt
    /// stays counted.
    pub fn recover(&mut self, now: DateTime<Utc>) {
        if matches!(
            self.state,
            DeliveryState::InFlight | DeliveryState::RetryScheduled
        ) {
            self.state = DeliveryState::Queued;
            self.updated_at = now;
        }
        self.visible_at = None;
        self.next_run_at = None;
    }

    fn record_attempt(&mut self, outcome: DeliveryOutcome, now: DateTime<Utc>) {
        self.history.push(AttemptRecord {
            attempt: self.attempts,
            outcome,
            finished_at: now,
        });
        self.updated_at = now;
    }
}
