//! Message dispatch — hands one message to the external sending service.

use std::time::Duration;

use async_trait::async_trait;
use notifyd_core::config::SenderConfig;
use notifyd_core::types::{SendPayload, SendResponse};
use notifyd_core::{NotifydError, Result};

/// Something that can deliver a message.
///
/// `Err` means the attempt itself failed (network, status, body) and the
/// message should be tried again. An `Ok` response with a non-zero code is an
/// application-level rejection.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, payload: &SendPayload) -> Result<SendResponse>;
}

/// Sender backed by the HTTP sending service.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
    base_url: String,
    token: String,
    timeout: Duration,
}

impl HttpSender {
    pub fn new(config: &SenderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            timeout: config.timeout(),
        }
    }

    fn endpoint(&self, id: i64) -> String {
        format!("{}/{id}", self.base_url)
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, payload: &SendPayload) -> Result<SendResponse> {
        let resp = self
            .client
            .post(self.endpoint(payload.id))
            .header(reqwest::header::AUTHORIZATION, &self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| NotifydError::send(format!("send of message {} failed: {e}", payload.id)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifydError::send(format!(
                "sending service error {status}: {body}"
            )));
        }

        let response: SendResponse = resp
            .json()
            .await
            .map_err(|e| NotifydError::send(format!("unreadable response: {e}")))?;
        if response.is_accepted() {
            tracing::debug!("✅ Message {} accepted", payload.id);
        } else {
            tracing::warn!(
                "⚠️ Message {} rejected with code {}: {}",
                payload.id,
                response.code,
                response.message
            );
        }
        Ok(response)
    }
}
