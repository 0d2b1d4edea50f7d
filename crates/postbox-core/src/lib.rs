//! postbox-core
//!
//! Asynchronous transactional email: callers publish a send request and
//! return immediately, a consumer group delivers it through the provider
//! with at-least-once semantics.
//!
//! # Modules
//! - **domain**: addresses, the email event, outcomes, delivery states, environment policy
//! - **ports**: clock, id generation and the delivery transport
//! - **queue**: the `emails` topic, retry policy, the local queue and its spool
//! - **app**: publisher, dispatcher, subscription workers and the builder
//! - **impls**: SendGrid and recording transports
//! - **observability**: counts and per-message status views

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
