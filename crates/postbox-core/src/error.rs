use thiserror::Error;

use crate::domain::AddressField;

/// Malformed send request. Surfaced synchronously, never enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}.email is empty")]
    EmptyEmail { field: AddressField },

    #[error("{field}.email is not a valid address: {email}")]
    InvalidEmail { field: AddressField, email: String },

    #[error("at least one of text or html body is required")]
    MissingBody,
}

/// Queue-side failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue {topic} is closed")]
    Closed { topic: String },

    #[error("topic {topic} already has consumer group {group}")]
    AlreadySubscribed { topic: String, group: String },

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Error returned by `Publisher::send`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to enqueue email: {0}")]
    Enqueue(#[from] QueueError),
}

impl PublishError {
    /// Enqueue failures may succeed on a later try of the whole request;
    /// validation failures never will.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Enqueue(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown deployment environment: {0:?}")]
    UnknownEnvironment(String),

    #[error("{0} must be set in production")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
