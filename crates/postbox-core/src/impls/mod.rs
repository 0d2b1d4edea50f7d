//! Impls - transport implementations.
//!
//! - **SendGridTransport**: the production provider client.
//! - **RecordingTransport**: scripted fake for tests and local runs.

pub mod recording;
pub mod sendgrid;

pub use self::recording::RecordingTransport;
pub use self::sendgrid::{SendGridConfig, SendGridTransport};
