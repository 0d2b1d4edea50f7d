//! Outcome of a single delivery attempt.
//!
//! An outcome is produced by the dispatcher per attempt and consumed right
//! away by the queue's ack/retry logic. The queue keeps a copy in the attempt
//! history for diagnosis.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub success: bool,

    /// Only meaningful when `success` is false.
    pub retryable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,

    /// Provider status code, when the transport got that far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl DeliveryOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            retryable: false,
            error_detail: None,
            status_code: None,
        }
    }

    pub fn retryable(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            retryable: true,
            error_detail: Some(detail.into()),
            status_code: None,
        }
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            retryable: false,
            error_detail: Some(detail.into()),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Short description used in logs and as the record's last error.
    pub fn describe(&self) -> String {
        match (&self.error_detail, self.status_code) {
            (Some(detail), Some(code)) => format!("{detail} (status {code})"),
            (Some(detail), None) => detail.clone(),
            (None, Some(code)) => format!("status {code}"),
            (None, None) if self.success => "delivered".to_string(),
            (None, None) => "failed".to_string(),
        }
    }
}
