//! Address: a display name plus an email address.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // local@label.label[...], every domain label non-empty
    Regex::new(r"^[^@\s]+@[^@\s.]+(\.[^@\s.]+)+$").expect("email regex is valid")
});

/// Which side of the message an address belongs to.
///
/// Only used to name the offending field in validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressField {
    From,
    To,
}

impl AddressField {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressField::From => "from",
            AddressField::To => "to",
        }
    }
}

impl std::fmt::Display for AddressField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mailbox: `{name, email}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub name: String,
    pub email: String,
}

impl Address {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Validate the email syntax and return a normalized copy.
    ///
    /// Normalization only trims whitespace around the email; the name is kept
    /// verbatim.
    pub fn validated(&self, field: AddressField) -> Result<Address, ValidationError> {
        let email = self.email.trim();
        if email.is_empty() {
            return Err(ValidationError::EmptyEmail { field });
        }
        if !EMAIL_REGEX.is_match(email) {
            return Err(ValidationError::InvalidEmail {
                field,
                email: email.to_string(),
            });
        }
        Ok(Address {
            name: self.name.clone(),
            email: email.to_string(),
        })
    }

    /// Domain part of the email, used where logging the full address is
    /// unnecessary.
    pub fn domain(&self) -> &str {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or("")
    }
}
