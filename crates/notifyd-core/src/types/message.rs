//! Message — one per-recipient delivery attempt of a notification,
//! plus the payload/response exchanged with the sending service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::NotifydError;

/// A stored message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub client_id: i64,
    pub notification_id: i64,
    pub text: String,
    pub state: MessageState,
    pub created_at: DateTime<Utc>,
}

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    Created,
    Error,
    Sent,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Created => "CREATED",
            MessageState::Error => "ERROR",
            MessageState::Sent => "SENT",
        }
    }

    /// State recorded for a sending-service response code.
    pub fn from_response_code(code: i64) -> Self {
        if code == 0 {
            MessageState::Sent
        } else {
            MessageState::Error
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageState {
    type Err = NotifydError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(MessageState::Created),
            "ERROR" => Ok(MessageState::Error),
            "SENT" => Ok(MessageState::Sent),
            other => Err(NotifydError::database(format!("unknown message state '{other}'"))),
        }
    }
}

/// Body posted to the sending service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPayload {
    /// Message row id.
    pub id: i64,
    pub text: String,
    pub phone_number: i64,
}

/// Structured reply of the sending service. `code == 0` means accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Code recorded when the send attempt itself failed.
pub const TRANSPORT_FAILURE_CODE: i64 = 500;

impl SendResponse {
    pub fn ok() -> Self {
        Self {
            code: 0,
            message: "OK".into(),
        }
    }

    /// Synthetic response for a failed transport attempt.
    pub fn transport_failure(reason: impl Into<String>) -> Self {
        Self {
            code: TRANSPORT_FAILURE_CODE,
            message: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_code() {
        assert_eq!(MessageState::from_response_code(0), MessageState::Sent);
        assert_eq!(MessageState::from_response_code(7), MessageState::Error);
        assert_eq!(MessageState::from_response_code(-1), MessageState::Error);
    }

    #[test]
    fn test_state_strings() {
        for state in [MessageState::Created, MessageState::Error, MessageState::Sent] {
            assert_eq!(state.as_str().parse::<MessageState>().unwrap(), state);
        }
        assert!("DELIVERED".parse::<MessageState>().is_err());
        assert_eq!(serde_json::to_string(&MessageState::Sent).unwrap(), r#""SENT""#);
    }

    #[test]
    fn test_response_parsing() {
        let resp: SendResponse = serde_json::from_str(r#"{"code":0,"message":"OK"}"#).unwrap();
        assert!(resp.is_accepted());
        let resp: SendResponse = serde_json::from_str(r#"{"code":7}"#).unwrap();
        assert!(!resp.is_accepted());
        assert!(!SendResponse::transport_failure("timeout").is_accepted());
    }
}
