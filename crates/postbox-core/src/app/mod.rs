//! App - the pipeline built on top of the ports.
//!
//! # Components
//! - **Publisher**: validates a send request and enqueues it
//! - **Dispatcher**: applies the environment policy and calls the provider
//! - **Subscription**: the consumer group's worker pool
//! - **PostboxBuilder**: wiring

pub mod builder;
pub mod dispatcher;
pub mod publisher;
pub mod subscription;

pub use self::builder::{BuildError, Postbox, PostboxBuilder};
pub use self::dispatcher::{Dispatcher, classify_status};
pub use self::publisher::Publisher;
pub use self::subscription::{HandlerError, MessageHandler, Subscription, SubscriptionConfig};
