//! Client — a recipient that notifications are matched against.

use serde::{Deserialize, Serialize};

use crate::error::{NotifydError, Result};

/// A stored client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    /// Full phone number, digits only (e.g. 79998887766).
    pub phone_number: i64,
    /// Operator/country code used by filters.
    pub phone_code: String,
    pub tag: String,
    pub time_zone: String,
}

/// Create/update payload for a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub phone_number: i64,
    #[serde(default)]
    pub phone_code: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub time_zone: String,
}

impl ClientRequest {
    pub fn validate(&self) -> Result<()> {
        if self.phone_number <= 0 {
            return Err(NotifydError::validation("phone_number must be positive"));
        }
        Ok(())
    }

    pub fn into_client(self, id: i64) -> Client {
        Client {
            id,
            phone_number: self.phone_number,
            phone_code: self.phone_code,
            tag: self.tag,
            time_zone: self.time_zone,
        }
    }
}
