//! Subscription - the consumer group's worker pool.
//!
//! The number of workers bounds how many provider calls are in flight at once.
//! Anything beyond that waits in the queue instead of failing the producer.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::domain::{DeliveryOutcome, EmailEvent};
use crate::error::QueueError;
use crate::ports::DeliveryContext;
use crate::queue::{MessageLease, MessageQueue, SEND_EMAIL_GROUP};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The worker group is shutting down. The lease is released unsettled so
    /// the event is redelivered later.
    #[error("delivery aborted by shutdown")]
    Aborted,
}

/// Handles one delivered event.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        event: &EmailEvent,
        ctx: &DeliveryContext,
    ) -> Result<DeliveryOutcome, HandlerError>;
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub group: String,

    /// Number of workers, i.e. the in-flight delivery limit.
    pub max_concurrency: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            group: SEND_EMAIL_GROUP.to_string(),
            max_concurrency: 4,
        }
    }
}

/// Running consumer group.
///
/// - `request_shutdown()` stops taking new leases.
/// - `shutdown(grace)` also waits for in-flight work, aborting it once the
///   grace period is over.
pub struct Subscription {
    group: String,
    stop_tx: watch::Sender<bool>,
    abort_tx: watch::Sender<bool>,
    workers: JoinSet<()>,
}

impl Subscription {
    /// Register the consumer group on `queue` and spawn its workers.
    pub async fn spawn(
        queue: Arc<dyn MessageQueue>,
        handler: Arc<dyn MessageHandler>,
        config: SubscriptionConfig,
    ) -> Result<Self, QueueError> {
        queue.subscribe(&config.group).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(false);
        let n = config.max_concurrency.max(1);

        let mut workers = JoinSet::new();
        for worker_id in 0..n {
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&queue),
                Arc::clone(&handler),
                stop_rx.clone(),
                abort_rx.clone(),
            ));
        }

        info!(topic = queue.topic(), group = %config.group, workers = n, "subscription started");
        Ok(Self {
            group: config.group,
            stop_tx,
            abort_tx,
            workers,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Stop taking new leases. In-flight handlers keep running.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.stop_tx.send(true);
    }

    /// Stop, wait up to `grace` for in-flight deliveries, then abort whatever
    /// is left and join all workers. Aborted deliveries are redelivered once
    /// their visibility timeout expires.
    pub async fn shutdown(mut self, grace: Duration) {
        self.request_shutdown();

        let workers = &mut self.workers;
        let drained = tokio::time::timeout(grace, async {
            while let Some(res) = workers.join_next().await {
                log_join_error(res);
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(group = %self.group, remaining = self.workers.len(), "grace period over, aborting in-flight deliveries");
            let _ = self.abort_tx.send(true);
            while let Some(res) = self.workers.join_next().await {
                log_join_error(res);
            }
        }
        info!(group = %self.group, "subscription stopped");
    }
}

fn log_join_error(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        warn!(error = %e, "worker task ended abnormally");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn MessageQueue>,
    handler: Arc<dyn MessageHandler>,
    mut stop_rx: watch::Receiver<bool>,
    abort_rx: watch::Receiver<bool>,
) {
    debug!(worker_id, "worker started");
    loop {
        if *stop_rx.borrow() {
            break;
        }

        // lease() may wait, so race it against shutdown
        let lease = tokio::select! {
            res = stop_rx.changed() => {
                if res.is_err() {
                    break;
                }
                continue;
            }
            lease = queue.lease() => lease,
        };

        // None means the queue was closed.
        let Some(lease) = lease else {
            break;
        };

        let message_id = lease.message_id();
        // A panicking handler must not take the worker down with it. The lease
        // is dropped unsettled and redelivered after its visibility timeout.
        let res = AssertUnwindSafe(process(worker_id, lease, handler.as_ref(), abort_rx.clone()))
            .catch_unwind()
            .await;
        if res.is_err() {
            error!(worker_id, message_id = %message_id, "handler panicked, leaving event for redelivery");
        }
    }
    debug!(worker_id, "worker stopped");
}

async fn process(
    worker_id: usize,
    lease: Box<dyn MessageLease>,
    handler: &dyn MessageHandler,
    abort_rx: watch::Receiver<bool>,
) {
    let message_id = lease.message_id();
    let attempt = lease.attempt();
    let span = info_span!("delivery", worker_id, message_id = %message_id, attempt);

    async move {
        let ctx = DeliveryContext::new(message_id, attempt, lease.deadline(), abort_rx);
        // Owned copy so no borrow of the lease is held across the handler.
        let event = lease.event().clone();
        let result = handler.handle(&event, &ctx).await;

        let settled = match result {
            Ok(outcome) if outcome.success => lease.ack().await,
            Ok(outcome) => lease.fail(outcome).await,
            Err(HandlerError::Aborted) => {
                info!("delivery aborted, leaving event for redelivery");
                return;
            }
        };

        match settled {
            Ok(state) => debug!(state = ?state, "lease settled"),
            Err(e) => warn!(error = %e, "failed to settle lease"),
        }
    }
    .instrument(span)
    .await
}
