//! Local queue implementation.
//!
//! The working set (ready deque, timer heaps, records) lives in process memory.
//! With a [`RecordStore`] attached every state change is written through, and
//! `LocalQueue::open` rebuilds the queue from the store after a restart.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::store::RecordStore;
use super::{MessageLease, MessageQueue, MessageRecord, RetryPolicy};
use crate::domain::{DeliveryOutcome, DeliveryState, EmailEvent, MessageId};
use crate::error::QueueError;
use crate::observability::{MessageStatus, QueueCounts};
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub topic: String,

    /// How long a leased event stays hidden before it is redelivered.
    pub visibility_timeout: Duration,

    pub retry_policy: RetryPolicy,

    /// How long an acknowledged record stays queryable through `status`
    /// before it is dropped from memory.
    pub ack_retention: Duration,

    /// Dead letters kept in memory, oldest dropped first. Spooled dead
    /// letters stay on disk regardless.
    pub max_dead_letters: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            topic: super::EMAILS_TOPIC.to_string(),
            visibility_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            ack_retention: Duration::from_secs(600),
            max_dead_letters: 1000,
        }
    }
}

/// Timer entry for the scheduled and in-flight heaps.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Timer {
    at: Instant,
    id: MessageId,
    lease_seq: u64,
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct QueueState {
    records: HashMap<MessageId, MessageRecord>,

    /// Ready queue (ids only). May hold ids that are no longer leasable; those
    /// are skipped on lease.
    ready: VecDeque<MessageId>,

    /// Retry backoff timers.
    scheduled: BinaryHeap<Timer>,

    /// Visibility deadlines of outstanding leases.
    in_flight: BinaryHeap<Timer>,

    /// Acknowledged ids in ack order, with the ack instant.
    acknowledged: VecDeque<(Instant, MessageId)>,

    dead_letters: VecDeque<MessageId>,

    consumer_group: Option<String>,

    closed: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            ready: VecDeque::new(),
            scheduled: BinaryHeap::new(),
            in_flight: BinaryHeap::new(),
            acknowledged: VecDeque::new(),
            dead_letters: VecDeque::new(),
            consumer_group: None,
            closed: false,
        }
    }

    /// Move retries whose backoff has elapsed back to the ready queue.
    fn promote_scheduled(&mut self, now: Instant, clock: &dyn Clock, changed: &mut Vec<MessageId>) {
        while let Some(timer) = self.scheduled.peek() {
            if timer.at > now {
                break;
            }
            let Some(timer) = self.scheduled.pop() else {
                break;
            };
            if let Some(record) = self.records.get_mut(&timer.id)
                && record.state == DeliveryState::RetryScheduled
                && record.lease_seq == timer.lease_seq
            {
                record.requeue(clock.now());
                self.ready.push_back(timer.id);
                changed.push(timer.id);
            }
        }
    }

    /// Return leases whose visibility deadline passed to the ready queue, or
    /// dead-letter them when no attempts are left.
    fn reclaim_expired(
        &mut self,
        now: Instant,
        policy: &RetryPolicy,
        clock: &dyn Clock,
        changed: &mut Vec<MessageId>,
    ) {
        while let Some(timer) = self.in_flight.peek() {
            if timer.at > now {
                break;
            }
            let Some(timer) = self.in_flight.pop() else {
                break;
            };
            let Some(record) = self.records.get_mut(&timer.id) else {
                continue;
            };
            if record.state != DeliveryState::InFlight || record.lease_seq != timer.lease_seq {
                continue;
            }

            let outcome = DeliveryOutcome::retryable("visibility timeout expired");
            if policy.allows_another_attempt(record.attempts) {
                debug!(message_id = %timer.id, attempt = record.attempts, "lease expired, redelivering");
                record.expire_lease(outcome, clock.now());
                self.ready.push_back(timer.id);
            } else {
                warn!(message_id = %timer.id, attempts = record.attempts, "lease expired with no attempts left, dead-lettering");
                record.mark_dead_lettered(outcome, clock.now());
                self.dead_letters.push_back(timer.id);
            }
            changed.push(timer.id);
        }
    }

    /// Drop acknowledged records older than `retention`.
    fn evict_acknowledged(&mut self, now: Instant, retention: Duration) {
        while let Some(&(acked_at, id)) = self.acknowledged.front() {
            if acked_at + retention > now {
                break;
            }
            self.acknowledged.pop_front();
            if self
                .records
                .get(&id)
                .is_some_and(|r| r.state == DeliveryState::Acknowledged)
            {
                self.records.remove(&id);
            }
        }
    }

    fn trim_dead_letters(&mut self, max: usize) {
        while self.dead_letters.len() > max {
            if let Some(id) = self.dead_letters.pop_front() {
                debug!(message_id = %id, "dropping oldest dead letter from memory");
                self.records.remove(&id);
            }
        }
    }

    /// Earliest instant at which a timer needs attention.
    fn next_wake(&self) -> Option<Instant> {
        let scheduled = self.scheduled.peek().map(|t| t.at);
        let in_flight = self.in_flight.peek().map(|t| t.at);
        match (scheduled, in_flight) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            match record.state {
                DeliveryState::Queued => counts.queued += 1,
                DeliveryState::InFlight => counts.in_flight += 1,
                DeliveryState::RetryScheduled => counts.retry_scheduled += 1,
                DeliveryState::Acknowledged => counts.acknowledged += 1,
                DeliveryState::DeadLettered => counts.dead_lettered += 1,
            }
        }
        counts
    }
}

fn status_of(record: &MessageRecord) -> MessageStatus {
    MessageStatus {
        message_id: record.id,
        state: record.state,
        attempts: record.attempts,
        last_error: record.last_error.clone(),
        recipient_domain: record.event.recipient().domain().to_string(),
        published_at: record.published_at,
        updated_at: record.updated_at,
        history: record.history.clone(),
    }
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn RecordStore>>,
}

impl Shared {
    async fn save(&self, record: &MessageRecord) -> Result<(), QueueError> {
        match &self.store {
            Some(store) => store.save(record).await,
            None => Ok(()),
        }
    }

    /// Write through records changed by a timer pass. Failures are logged:
    /// the spooled copy is older, which at worst means a redelivery after a
    /// restart.
    async fn save_changed(&self, state: &QueueState, ids: &[MessageId]) {
        for id in ids {
            if let Some(record) = state.records.get(id)
                && let Err(e) = self.save(record).await
            {
                warn!(message_id = %id, error = %e, "failed to spool record");
            }
        }
    }
}

/// The queue behind the `emails` topic.
///
/// Implements the full lease / visibility-timeout / retry / dead-letter
/// contract. `new` keeps everything in memory; `open` writes through to a
/// [`RecordStore`] so queued, in-flight, retrying and dead-lettered events
/// survive a restart.
pub struct LocalQueue {
    shared: Arc<Shared>,
    ids: Arc<dyn IdGenerator>,
}

impl LocalQueue {
    /// Memory-only queue; events do not survive a restart.
    pub fn new(config: QueueConfig) -> Self {
        Self::with_ports(
            config,
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
        )
    }

    pub fn with_ports(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self::assemble(config, clock, ids, None, QueueState::new())
    }

    /// Durable queue backed by `store`, recovering whatever it holds.
    pub async fn open(config: QueueConfig, store: Arc<dyn RecordStore>) -> Result<Self, QueueError> {
        Self::open_with_ports(
            config,
            store,
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
        )
        .await
    }

    /// Recovery rules:
    /// - Queued, InFlight and RetryScheduled records go back to the ready
    ///   queue; the previous process's leases and backoff timers are gone.
    /// - An InFlight record with no attempts left is dead-lettered instead.
    /// - DeadLettered records are listed again as dead letters.
    /// - Acknowledged records should not be spooled; any leftovers are removed.
    pub async fn open_with_ports(
        config: QueueConfig,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, QueueError> {
        let records = store.load().await?;
        let now = clock.now();
        let mut state = QueueState::new();
        let mut recovered = 0usize;

        for mut record in records {
            match record.state {
                DeliveryState::Acknowledged => {
                    store.remove(record.id).await?;
                    continue;
                }
                DeliveryState::DeadLettered => state.dead_letters.push_back(record.id),
                // Same rule as an expired lease at the attempt ceiling.
                DeliveryState::InFlight
                    if !config.retry_policy.allows_another_attempt(record.attempts) =>
                {
                    warn!(message_id = %record.id, attempts = record.attempts, "lease lost in restart with no attempts left, dead-lettering");
                    record.mark_dead_lettered(DeliveryOutcome::retryable("lease lost in restart"), now);
                    store.save(&record).await?;
                    state.dead_letters.push_back(record.id);
                }
                DeliveryState::Queued | DeliveryState::InFlight | DeliveryState::RetryScheduled => {
                    record.recover(now);
                    state.ready.push_back(record.id);
                    recovered += 1;
                }
            }
            state.records.insert(record.id, record);
        }
        state.trim_dead_letters(config.max_dead_letters);

        info!(
            topic = %config.topic,
            recovered,
            dead_letters = state.dead_letters.len(),
            "queue recovered from spool"
        );
        Ok(Self::assemble(config, clock, ids, Some(store), state))
    }

    fn assemble(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        store: Option<Arc<dyn RecordStore>>,
        state: QueueState,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                notify: Notify::new(),
                config,
                clock,
                store,
            }),
            ids,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn is_durable(&self) -> bool {
        self.shared.store.is_some()
    }
}

#[async_trait]
impl MessageQueue for LocalQueue {
    fn topic(&self) -> &str {
        &self.shared.config.topic
    }

    async fn publish(&self, event: EmailEvent) -> Result<MessageId, QueueError> {
        let shared = &self.shared;
        let id = {
            let mut state = shared.state.lock().await;
            if state.closed {
                return Err(QueueError::Closed {
                    topic: shared.config.topic.clone(),
                });
            }
            state.evict_acknowledged(Instant::now(), shared.config.ack_retention);

            let id = self.ids.generate_message_id();
            let record = MessageRecord::new(id, event, shared.clock.now());
            // Spooled before it becomes visible; a failed write enqueues nothing.
            shared.save(&record).await?;
            state.records.insert(id, record);
            state.ready.push_back(id);
            id
        };

        // Notify outside the lock
        shared.notify.notify_one();
        debug!(topic = %shared.config.topic, message_id = %id, "event published");
        Ok(id)
    }

    async fn subscribe(&self, group: &str) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().await;
        let topic = &self.shared.config.topic;
        if state.closed {
            return Err(QueueError::Closed {
                topic: topic.clone(),
            });
        }
        if let Some(existing) = &state.consumer_group {
            return Err(QueueError::AlreadySubscribed {
                topic: topic.clone(),
                group: existing.clone(),
            });
        }
        state.consumer_group = Some(group.to_string());
        info!(topic = %topic, group, "consumer group registered");
        Ok(())
    }

    async fn lease(&self) -> Option<Box<dyn MessageLease>> {
        let shared = &self.shared;
        loop {
            let mut guard = shared.state.lock().await;
            let state = &mut *guard;
            let now = Instant::now();

            let mut changed = Vec::new();
            state.promote_scheduled(now, shared.clock.as_ref(), &mut changed);
            state.reclaim_expired(
                now,
                &shared.config.retry_policy,
                shared.clock.as_ref(),
                &mut changed,
            );
            if !changed.is_empty() {
                shared.save_changed(state, &changed).await;
                state.trim_dead_letters(shared.config.max_dead_letters);
            }
            state.evict_acknowledged(now, shared.config.ack_retention);

            if state.closed {
                return None;
            }

            while let Some(id) = state.ready.pop_front() {
                let Some(record) = state.records.get_mut(&id) else {
                    continue;
                };
                if !record.state.is_leasable() {
                    continue;
                }

                let deadline = now + shared.config.visibility_timeout;
                let lease_seq = record.start_attempt(deadline, shared.clock.now());
                let lease = LocalLease {
                    id,
                    lease_seq,
                    attempt: record.attempts,
                    deadline,
                    event: record.event.clone(),
                    shared: Arc::clone(shared),
                };
                if let Err(e) = shared.save(record).await {
                    warn!(message_id = %id, error = %e, "failed to spool lease");
                }
                state.in_flight.push(Timer {
                    at: deadline,
                    id,
                    lease_seq,
                });

                // Wake an idle worker: it re-arms its timer for this deadline
                // and takes anything still ready.
                shared.notify.notify_one();
                debug!(message_id = %id, attempt = lease.attempt, "event leased");
                return Some(Box::new(lease));
            }

            let next_wake = state.next_wake();
            // Registered before the lock is released, so a close() in between
            // is not missed.
            let notified = shared.notify.notified();
            drop(guard);

            match next_wake {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {},
                        _ = tokio::time::sleep_until(at) => {},
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn close(&self) {
        {
            let mut state = self.shared.state.lock().await;
            state.closed = true;
        }
        self.shared.notify.notify_waiters();
        info!(topic = %self.shared.config.topic, "queue closed");
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.shared.state.lock().await;
        Ok(state.counts())
    }

    async fn status(&self, id: MessageId) -> Result<Option<MessageStatus>, QueueError> {
        let state = self.shared.state.lock().await;
        Ok(state.records.get(&id).map(status_of))
    }

    async fn dead_letters(&self) -> Result<Vec<MessageStatus>, QueueError> {
        let state = self.shared.state.lock().await;
        Ok(state
            .dead_letters
            .iter()
            .filter_map(|id| state.records.get(id))
            .map(status_of)
            .collect())
    }
}

struct LocalLease {
    id: MessageId,
    lease_seq: u64,
    attempt: u32,
    deadline: Instant,
    event: EmailEvent,
    shared: Arc<Shared>,
}

impl LocalLease {
    fn unknown(&self) -> QueueError {
        QueueError::Unavailable(format!("unknown message {}", self.id))
    }
}

#[async_trait]
impl MessageLease for LocalLease {
    fn message_id(&self) -> MessageId {
        self.id
    }

    fn event(&self) -> &EmailEvent {
        &self.event
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn deadline(&self) -> Instant {
        self.deadline
    }

    async fn ack(self: Box<Self>) -> Result<DeliveryState, QueueError> {
        let shared = &self.shared;
        let mut guard = shared.state.lock().await;
        let state = &mut *guard;
        let Some(record) = state.records.get_mut(&self.id) else {
            return Err(self.unknown());
        };

        if record.state.is_terminal() {
            return Ok(record.state);
        }
        // A late ack from a superseded lease still counts: the provider took
        // the message. Redelivery entries left in the queues are skipped.
        if record.lease_seq != self.lease_seq {
            debug!(message_id = %self.id, attempt = self.attempt, "late ack from superseded lease");
        }
        record.mark_acknowledged(DeliveryOutcome::success(), shared.clock.now());

        let now = Instant::now();
        state.acknowledged.push_back((now, self.id));
        state.evict_acknowledged(now, shared.config.ack_retention);

        if let Some(store) = &shared.store {
            // Memory already says acknowledged; a stale spool entry only means
            // one more delivery after a restart.
            store.remove(self.id).await?;
        }
        Ok(DeliveryState::Acknowledged)
    }

    async fn fail(self: Box<Self>, outcome: DeliveryOutcome) -> Result<DeliveryState, QueueError> {
        let shared = &self.shared;
        let (result, should_notify) = {
            let mut guard = shared.state.lock().await;
            let state = &mut *guard;
            let Some(record) = state.records.get_mut(&self.id) else {
                return Err(self.unknown());
            };

            // The newest lease owns the retry decision.
            if record.lease_seq != self.lease_seq || record.state != DeliveryState::InFlight {
                debug!(message_id = %self.id, attempt = self.attempt, state = ?record.state, "ignoring failure from superseded lease");
                return Ok(record.state);
            }

            let policy = &shared.config.retry_policy;
            let now = shared.clock.now();

            let result = if outcome.retryable && policy.allows_another_attempt(record.attempts) {
                let delay = policy.next_delay(record.attempts);
                let next_run_at = Instant::now() + delay;
                debug!(
                    message_id = %self.id,
                    attempt = record.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                record.schedule_retry(next_run_at, outcome, now);
                state.scheduled.push(Timer {
                    at: next_run_at,
                    id: self.id,
                    lease_seq: self.lease_seq,
                });
                (DeliveryState::RetryScheduled, true)
            } else {
                warn!(
                    message_id = %self.id,
                    attempts = record.attempts,
                    retryable = outcome.retryable,
                    error = %outcome.describe(),
                    "event dead-lettered"
                );
                record.mark_dead_lettered(outcome, now);
                state.dead_letters.push_back(self.id);
                (DeliveryState::DeadLettered, false)
            };

            let saved = match state.records.get(&self.id) {
                Some(record) => shared.save(record).await,
                None => Ok(()),
            };
            state.trim_dead_letters(shared.config.max_dead_letters);
            saved?;
            result
        };

        // Wake a waiting worker so it re-arms its timer for the new retry.
        if should_notify {
            shared.notify.notify_one();
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::domain::{Address, SendParams};
    use crate::ports::FixedClock;
    use crate::queue::FileRecordStore;

    fn event() -> EmailEvent {
        EmailEvent::from_params(&SendParams {
            from: Address::new("A", "a@x.com"),
            to: Address::new("B", "b@x.com"),
            subject: "Hi".to_string(),
            text: "hello".to_string(),
            html: String::new(),
        })
        .unwrap()
    }

    fn config(max_attempts: u32) -> QueueConfig {
        QueueConfig {
            visibility_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default()
                .with_max_attempts(max_attempts)
                .with_base_delay(Duration::from_secs(1)),
            ..QueueConfig::default()
        }
    }

    async fn lease_now(queue: &LocalQueue) -> Box<dyn MessageLease> {
        tokio::time::timeout(Duration::from_millis(100), queue.lease())
            .await
            .expect("lease should be immediately available")
            .expect("queue is open")
    }

    async fn spool(dir: &TempDir) -> Arc<dyn RecordStore> {
        Arc::new(FileRecordStore::open(dir.path()).await.unwrap())
    }

    #[tokio::test]
    async fn publish_assigns_id_and_queues() {
        let queue = LocalQueue::new(config(5));
        let id = queue.publish(event()).await.unwrap();
        assert!(id.to_string().starts_with("msg-"));
        assert!(!queue.is_durable());

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.in_flight, 0);

        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.state, DeliveryState::Queued);
        assert_eq!(status.attempts, 0);
        assert_eq!(status.recipient_domain, "x.com");
    }

    #[tokio::test]
    async fn publish_uses_injected_ports() {
        let fixed = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let queue = LocalQueue::with_ports(
            config(5),
            Arc::new(FixedClock::new(fixed)),
            Arc::new(UlidGenerator::new(FixedClock::new(fixed))),
        );
        let id = queue.publish(event()).await.unwrap();
        assert_eq!(id.as_ulid().timestamp_ms(), fixed.timestamp_millis() as u64);
        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.published_at, fixed);
    }

    #[tokio::test]
    async fn lease_transitions_to_in_flight() {
        let queue = LocalQueue::new(config(5));
        let id = queue.publish(event()).await.unwrap();

        let lease = lease_now(&queue).await;
        assert_eq!(lease.message_id(), id);
        assert_eq!(lease.attempt(), 1);
        assert_eq!(lease.event().subject(), "Hi");

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.queued, 0);
        assert_eq!(counts.in_flight, 1);
    }

    #[tokio::test]
    async fn ack_marks_acknowledged() {
        let queue = LocalQueue::new(config(5));
        let id = queue.publish(event()).await.unwrap();

        let lease = lease_now(&queue).await;
        assert_eq!(lease.ack().await.unwrap(), DeliveryState::Acknowledged);

        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.state, DeliveryState::Acknowledged);
        assert_eq!(status.history.len(), 1);
        assert!(status.history[0].outcome.success);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_schedules_retry_then_redelivers() {
        let queue = LocalQueue::new(config(5));
        let id = queue.publish(event()).await.unwrap();

        let lease = lease_now(&queue).await;
        let state = lease
            .fail(DeliveryOutcome::retryable("provider unavailable").with_status(503))
            .await
            .unwrap();
        assert_eq!(state, DeliveryState::RetryScheduled);
        assert_eq!(queue.counts().await.unwrap().retry_scheduled, 1);

        // Not leasable before the backoff elapses.
        assert!(
            tokio::time::timeout(Duration::from_millis(500), queue.lease())
                .await
                .is_err()
        );

        let start = Instant::now();
        let lease = queue.lease().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(lease.message_id(), id);
        assert_eq!(lease.attempt(), 2);

        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(
            status.last_error.as_deref(),
            Some("provider unavailable (status 503)")
        );
    }

    #[tokio::test]
    async fn fatal_failure_dead_letters_immediately() {
        let queue = LocalQueue::new(config(5));
        let id = queue.publish(event()).await.unwrap();

        let lease = lease_now(&queue).await;
        let state = lease
            .fail(DeliveryOutcome::fatal("rejected").with_status(400))
            .await
            .unwrap();
        assert_eq!(state, DeliveryState::DeadLettered);

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, id);
        assert_eq!(dead[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_attempt_ceiling() {
        let queue = LocalQueue::new(config(3));
        let id = queue.publish(event()).await.unwrap();

        let mut states = Vec::new();
        for _ in 0..3 {
            let lease = queue.lease().await.unwrap();
            states.push(
                lease
                    .fail(DeliveryOutcome::retryable("timeout"))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(
            states,
            vec![
                DeliveryState::RetryScheduled,
                DeliveryState::RetryScheduled,
                DeliveryState::DeadLettered,
            ]
        );

        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.state, DeliveryState::DeadLettered);
        assert_eq!(status.attempts, 3);
        assert_eq!(status.history.len(), 3);

        // Nothing left to lease.
        assert!(
            tokio::time::timeout(Duration::from_secs(3600), queue.lease())
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered() {
        let queue = LocalQueue::new(config(5));
        let id = queue.publish(event()).await.unwrap();

        let first = queue.lease().await.unwrap();
        let start = Instant::now();
        let second = queue.lease().await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(second.message_id(), id);
        assert_eq!(second.attempt(), 2);

        // The superseded lease cannot steer the retry decision...
        let state = first
            .fail(DeliveryOutcome::fatal("late failure"))
            .await
            .unwrap();
        assert_eq!(state, DeliveryState::InFlight);

        // ...but the current one can.
        assert_eq!(second.ack().await.unwrap(), DeliveryState::Acknowledged);
    }

    #[tokio::test(start_paused = true)]
    async fn late_ack_from_superseded_lease_acknowledges() {
        let queue = LocalQueue::new(config(5));
        let id = queue.publish(event()).await.unwrap();

        let first = queue.lease().await.unwrap();
        let second = queue.lease().await.unwrap();

        assert_eq!(first.ack().await.unwrap(), DeliveryState::Acknowledged);
        // The current holder's settlement is a no-op on a terminal record.
        assert_eq!(
            second
                .fail(DeliveryOutcome::retryable("timeout"))
                .await
                .unwrap(),
            DeliveryState::Acknowledged
        );
        assert_eq!(
            queue.status(id).await.unwrap().unwrap().state,
            DeliveryState::Acknowledged
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_at_ceiling_is_dead_lettered() {
        let queue = LocalQueue::new(config(1));
        let id = queue.publish(event()).await.unwrap();

        let _held = queue.lease().await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        // The next lease attempt runs the reclaim pass; nothing is handed out.
        assert!(
            tokio::time::timeout(Duration::from_secs(1), queue.lease())
                .await
                .is_err()
        );
        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.state, DeliveryState::DeadLettered);
        assert_eq!(
            status.last_error.as_deref(),
            Some("visibility timeout expired")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_waiter_picks_up_dropped_lease_after_visibility_timeout() {
        let queue = Arc::new(LocalQueue::new(config(5)));

        // Two consumers parked on an empty queue with no timers armed.
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    // Dropped unsettled, like a crashed handler.
                    queue.lease().await.map(|lease| lease.attempt())
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let id = queue.publish(event()).await.unwrap();

        let mut attempts = Vec::new();
        for waiter in waiters {
            let attempt = tokio::time::timeout(Duration::from_secs(120), waiter)
                .await
                .expect("both waiters are served")
                .unwrap();
            attempts.push(attempt);
        }
        attempts.sort();
        assert_eq!(attempts, vec![Some(1), Some(2)]);
        assert_eq!(
            queue.status(id).await.unwrap().unwrap().state,
            DeliveryState::InFlight
        );
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_records_are_evicted_after_retention() {
        let queue = LocalQueue::new(QueueConfig {
            ack_retention: Duration::from_secs(60),
            ..config(5)
        });
        let first = queue.publish(event()).await.unwrap();
        lease_now(&queue).await.ack().await.unwrap();

        // Still queryable inside the retention window.
        assert!(queue.status(first).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        let second = queue.publish(event()).await.unwrap();

        assert!(queue.status(first).await.unwrap().is_none());
        assert!(queue.status(second).await.unwrap().is_some());
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.acknowledged, 0);
        assert_eq!(counts.queued, 1);
    }

    #[tokio::test]
    async fn zero_retention_drops_acknowledged_records_immediately() {
        let queue = LocalQueue::new(QueueConfig {
            ack_retention: Duration::ZERO,
            ..config(5)
        });
        for _ in 0..50 {
            queue.publish(event()).await.unwrap();
        }
        for _ in 0..50 {
            let lease = lease_now(&queue).await;
            assert_eq!(lease.ack().await.unwrap(), DeliveryState::Acknowledged);
        }
        assert_eq!(queue.counts().await.unwrap(), QueueCounts::default());
    }

    #[tokio::test]
    async fn dead_letter_list_is_bounded() {
        let queue = LocalQueue::new(QueueConfig {
            max_dead_letters: 2,
            ..config(5)
        });
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(queue.publish(event()).await.unwrap());
        }
        for _ in 0..3 {
            let lease = lease_now(&queue).await;
            lease.fail(DeliveryOutcome::fatal("rejected")).await.unwrap();
        }

        let dead: Vec<_> = queue
            .dead_letters()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.message_id)
            .collect();
        assert_eq!(dead, ids[1..].to_vec());
        assert!(queue.status(ids[0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_consumer_group_is_rejected() {
        let queue = LocalQueue::new(config(5));
        queue.subscribe("send-email").await.unwrap();
        let err = queue.subscribe("other").await.unwrap_err();
        assert_eq!(
            err,
            QueueError::AlreadySubscribed {
                topic: "emails".to_string(),
                group: "send-email".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn close_wakes_waiting_lease_and_rejects_publish() {
        let queue = Arc::new(LocalQueue::new(config(5)));

        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.lease().await.is_none() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.close().await;

        assert!(waiter.await.unwrap());
        let err = queue.publish(event()).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed { .. }));
    }

    #[tokio::test]
    async fn publish_wakes_waiting_lease() {
        let queue = Arc::new(LocalQueue::new(config(5)));

        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.lease().await.map(|l| l.message_id()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let id = queue.publish(event()).await.unwrap();

        assert_eq!(waiter.await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn published_event_survives_restart() {
        let dir = TempDir::new().unwrap();
        let id = {
            let queue = LocalQueue::open(config(5), spool(&dir).await).await.unwrap();
            assert!(queue.is_durable());
            queue.publish(event()).await.unwrap()
        };

        let restarted = LocalQueue::open(config(5), spool(&dir).await).await.unwrap();
        let status = restarted.status(id).await.unwrap().unwrap();
        assert_eq!(status.state, DeliveryState::Queued);

        let lease = restarted.lease().await.unwrap();
        assert_eq!(lease.message_id(), id);
        assert_eq!(lease.event().recipient().email, "b@x.com");
    }

    #[tokio::test]
    async fn in_flight_and_retrying_events_are_requeued_after_restart() {
        let dir = TempDir::new().unwrap();
        let (in_flight, retrying) = {
            let queue = LocalQueue::open(config(5), spool(&dir).await).await.unwrap();
            let a = queue.publish(event()).await.unwrap();
            let b = queue.publish(event()).await.unwrap();
            let held = queue.lease().await.unwrap();
            let failed = queue.lease().await.unwrap();
            failed
                .fail(DeliveryOutcome::retryable("provider unavailable"))
                .await
                .unwrap();
            // Process dies with one lease outstanding.
            drop(held);
            (a, b)
        };

        let restarted = LocalQueue::open(config(5), spool(&dir).await).await.unwrap();
        let counts = restarted.counts().await.unwrap();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.in_flight, 0);

        let mut leased = Vec::new();
        for _ in 0..2 {
            let lease = restarted.lease().await.unwrap();
            assert_eq!(lease.attempt(), 2);
            leased.push(lease.message_id());
        }
        leased.sort();
        let mut expected = vec![in_flight, retrying];
        expected.sort();
        assert_eq!(leased, expected);

        let status = restarted.status(retrying).await.unwrap().unwrap();
        assert_eq!(status.last_error.as_deref(), Some("provider unavailable"));
    }

    #[tokio::test]
    async fn acknowledged_events_leave_the_spool_and_dead_letters_stay() {
        let dir = TempDir::new().unwrap();
        let (acked, dead) = {
            let queue = LocalQueue::open(config(5), spool(&dir).await).await.unwrap();
            let a = queue.publish(event()).await.unwrap();
            let b = queue.publish(event()).await.unwrap();
            queue.lease().await.unwrap().ack().await.unwrap();
            queue
                .lease()
                .await
                .unwrap()
                .fail(DeliveryOutcome::fatal("rejected").with_status(400))
                .await
                .unwrap();
            (a, b)
        };

        let restarted = LocalQueue::open(config(5), spool(&dir).await).await.unwrap();
        assert!(restarted.status(acked).await.unwrap().is_none());

        let dead_letters = restarted.dead_letters().await.unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].message_id, dead);
        assert_eq!(dead_letters[0].last_error.as_deref(), Some("rejected (status 400)"));
        assert_eq!(restarted.counts().await.unwrap().pending(), 0);
    }

    #[tokio::test]
    async fn lease_lost_at_the_ceiling_is_dead_lettered_on_restart() {
        let dir = TempDir::new().unwrap();
        let id = {
            let queue = LocalQueue::open(config(1), spool(&dir).await).await.unwrap();
            let id = queue.publish(event()).await.unwrap();
            let _held = queue.lease().await.unwrap();
            id
        };

        let restarted = LocalQueue::open(config(1), spool(&dir).await).await.unwrap();
        let status = restarted.status(id).await.unwrap().unwrap();
        assert_eq!(status.state, DeliveryState::DeadLettered);
        assert_eq!(status.last_error.as_deref(), Some("lease lost in restart"));
        assert_eq!(restarted.dead_letters().await.unwrap().len(), 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl RecordStore for BrokenStore {
        async fn load(&self) -> Result<Vec<MessageRecord>, QueueError> {
            Ok(Vec::new())
        }

        async fn save(&self, _record: &MessageRecord) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("disk full".to_string()))
        }

        async fn remove(&self, _id: MessageId) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_fails_when_the_store_is_unavailable() {
        let queue = LocalQueue::open(config(5), Arc::new(BrokenStore)).await.unwrap();
        let err = queue.publish(event()).await.unwrap_err();
        assert_eq!(err, QueueError::Unavailable("disk full".to_string()));
        assert_eq!(queue.counts().await.unwrap().pending(), 0);
    }

    #[test]
    fn timers_pop_earliest_first() {
        let base = Instant::now();
        let id = MessageId::from_ulid(ulid::Ulid::new());
        let mut heap = BinaryHeap::new();
        for secs in [5, 1, 3] {
            heap.push(Timer {
                at: base + Duration::from_secs(secs),
                id,
                lease_seq: 0,
            });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|t| (t.at - base).as_secs())
            .collect();
        assert_eq!(order, vec![1, 3, 5]);
    }
}
