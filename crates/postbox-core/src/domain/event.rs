//! Request, response and event shapes.

use serde::{Deserialize, Serialize};

use super::address::{Address, AddressField};
use super::ids::MessageId;
use crate::error::ValidationError;

/// Inbound send request, as accepted at the public boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendParams {
    pub from: Address,
    pub to: Address,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub html: String,
}

/// Response handed back to the caller once the event is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub message_id: MessageId,
}

/// The payload stored in the queue.
///
/// Built once from validated [`SendParams`] and never mutated afterwards; the
/// fields are private so nothing downstream can edit a queued event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailEvent {
    from: Address,
    to: Address,
    subject: String,
    plain_text_content: String,
    html_content: String,
}

impl EmailEvent {
    /// Validate `params` and build the event.
    ///
    /// At least one of the text and html bodies must be non-empty.
    pub fn from_params(params: &SendParams) -> Result<Self, ValidationError> {
        let from = params.from.validated(AddressField::From)?;
        let to = params.to.validated(AddressField::To)?;

        if params.text.trim().is_empty() && params.html.trim().is_empty() {
            return Err(ValidationError::MissingBody);
        }

        Ok(Self {
            from,
            to,
            subject: params.subject.clone(),
            plain_text_content: params.text.clone(),
            html_content: params.html.clone(),
        })
    }

    pub fn sender(&self) -> &Address {
        &self.from
    }

    pub fn recipient(&self) -> &Address {
        &self.to
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn plain_text_content(&self) -> &str {
        &self.plain_text_content
    }

    pub fn html_content(&self) -> &str {
        &self.html_content
    }
}
