//! Notification — a bulk-send campaign with a recipient filter and validity window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::client::Client;
use crate::error::{NotifydError, Result};

/// A stored notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    /// Message body sent to every matched client.
    pub text: String,
    /// Which clients receive it.
    pub filter: Filter,
    /// Declared start of the sending window.
    pub start_at: DateTime<Utc>,
    /// End of the sending window; nothing is sent afterwards.
    pub end_at: DateTime<Utc>,
}

impl Notification {
    /// Whether the sending window closed before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_at < now
    }
}

/// Recipient filter: phone code and/or tag.
///
/// A client matches when either configured field equals the client's value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl Filter {
    pub fn new(phone_code: Option<&str>, tag: Option<&str>) -> Self {
        Self {
            phone_code: phone_code.map(str::to_string),
            tag: tag.map(str::to_string),
        }
        .normalized()
    }

    pub fn by_tag(tag: &str) -> Self {
        Self::new(None, Some(tag))
    }

    pub fn by_phone_code(code: &str) -> Self {
        Self::new(Some(code), None)
    }

    /// Blank fields are treated as unset.
    pub fn normalized(self) -> Self {
        fn clean(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }
        Self {
            phone_code: clean(self.phone_code),
            tag: clean(self.tag),
        }
    }

    /// A filter with no field set matches nobody.
    pub fn is_empty(&self) -> bool {
        self.phone_code.is_none() && self.tag.is_none()
    }

    pub fn matches(&self, client: &Client) -> bool {
        let by_code = self
            .phone_code
            .as_deref()
            .is_some_and(|code| code == client.phone_code);
        let by_tag = self.tag.as_deref().is_some_and(|tag| tag == client.tag);
        by_code || by_tag
    }
}

/// Create/update payload for a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub text: String,
    #[serde(default)]
    pub filter: Filter,
    /// Older clients send the start time as `created_at`.
    #[serde(alias = "created_at")]
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl NotificationRequest {
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(NotifydError::validation("text must not be empty"));
        }
        if self.end_at < self.start_at {
            return Err(NotifydError::validation("end_at must not be before start_at"));
        }
        Ok(())
    }

    /// Build the snapshot stored under `id`.
    pub fn into_notification(self, id: i64) -> Notification {
        Notification {
            id,
            text: self.text,
            filter: self.filter.normalized(),
            start_at: self.start_at,
            end_at: self.end_at,
        }
    }
}
