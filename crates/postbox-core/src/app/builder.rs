//! PostboxBuilder - wiring for the whole pipeline.
//!
//! Fails at build time when a required piece is missing, instead of at the
//! first delivery.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::dispatcher::Dispatcher;
use super::publisher::Publisher;
use super::subscription::{Subscription, SubscriptionConfig};
use crate::domain::EnvironmentPolicy;
use crate::error::QueueError;
use crate::ports::DeliveryTransport;
use crate::queue::{LocalQueue, MessageQueue, QueueConfig, RecordStore, RetryPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("environment policy is not set")]
    MissingPolicy,

    #[error("delivery transport is not set")]
    MissingTransport,

    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,

    /// A zero visibility timeout redelivers every lease immediately; a zero
    /// send timeout fails every provider call.
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("failed to open queue: {0}")]
    Queue(#[from] QueueError),
}

/// Builds a [`Postbox`].
///
/// ```ignore
/// let postbox = PostboxBuilder::new()
///     .policy(EnvironmentPolicy::from_label("production")?)
///     .transport(Arc::new(SendGridTransport::new(config)?))
///     .max_concurrency(8)
///     .store(Arc::new(FileRecordStore::open("/var/spool/postbox").await?))
///     .build()
///     .await?;
/// let subscription = postbox.start().await?;
/// let response = postbox.publisher().send(&params).await?;
/// ```
pub struct PostboxBuilder {
    queue_config: QueueConfig,
    subscription_config: SubscriptionConfig,
    policy: Option<EnvironmentPolicy>,
    transport: Option<Arc<dyn DeliveryTransport>>,
    store: Option<Arc<dyn RecordStore>>,
    send_timeout: Duration,
}

impl PostboxBuilder {
    pub fn new() -> Self {
        Self {
            queue_config: QueueConfig::default(),
            subscription_config: SubscriptionConfig::default(),
            policy: None,
            transport: None,
            store: None,
            send_timeout: Duration::from_secs(10),
        }
    }

    pub fn policy(mut self, policy: EnvironmentPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn DeliveryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.queue_config.retry_policy = retry_policy;
        self
    }

    pub fn visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.queue_config.visibility_timeout = visibility_timeout;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.subscription_config.max_concurrency = max_concurrency;
        self
    }

    pub fn send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Spool the queue through `store` and recover what it already holds.
    /// Without one the queue lives in memory only.
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> Result<Postbox, BuildError> {
        let policy = self.policy.ok_or(BuildError::MissingPolicy)?;
        let transport = self.transport.ok_or(BuildError::MissingTransport)?;
        if self.subscription_config.max_concurrency == 0 {
            return Err(BuildError::ZeroConcurrency);
        }
        if self.queue_config.visibility_timeout.is_zero() {
            return Err(BuildError::ZeroDuration {
                name: "visibility_timeout",
            });
        }
        if self.send_timeout.is_zero() {
            return Err(BuildError::ZeroDuration {
                name: "send_timeout",
            });
        }

        let queue = match self.store {
            Some(store) => LocalQueue::open(self.queue_config, store).await?,
            None => LocalQueue::new(self.queue_config),
        };
        let queue = Arc::new(queue);
        let publisher = Publisher::new(queue.clone());
        let dispatcher =
            Arc::new(Dispatcher::new(policy, transport).with_send_timeout(self.send_timeout));

        Ok(Postbox {
            queue,
            publisher,
            dispatcher,
            subscription_config: self.subscription_config,
        })
    }
}

impl Default for PostboxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired pipeline: queue, publisher and dispatcher.
pub struct Postbox {
    queue: Arc<LocalQueue>,
    publisher: Publisher,
    dispatcher: Arc<Dispatcher>,
    subscription_config: SubscriptionConfig,
}

impl Postbox {
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn queue(&self) -> Arc<dyn MessageQueue> {
        self.queue.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Register the consumer group and start its workers.
    pub async fn start(&self) -> Result<Subscription, QueueError> {
        Subscription::spawn(
            self.queue.clone(),
            self.dispatcher.clone(),
            self.subscription_config.clone(),
        )
        .await
    }
}
