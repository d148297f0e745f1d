//! Event bus — three bounded queues feeding the single pipeline loop.

use notifyd_core::config::PipelineConfig;
use notifyd_core::types::{Notification, SendPayload, SendResponse};
use notifyd_core::{NotifydError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A message waiting to go out to the sending service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub notification_id: i64,
    pub payload: SendPayload,
}

/// Outcome of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub payload: SendPayload,
    pub response: SendResponse,
}

/// Capacities of the three queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSizes {
    pub messages: usize,
    pub responses: usize,
    pub notifications: usize,
}

impl Default for QueueSizes {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for QueueSizes {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            messages: config.messages_queue,
            responses: config.responses_queue,
            notifications: config.notifications_queue,
        }
    }
}

/// Producer side. Pushes wait while the target queue is full.
#[derive(Clone, Debug)]
pub struct EventBus {
    messages: mpsc::Sender<OutboundMessage>,
    responses: mpsc::Sender<SendResult>,
    notifications: mpsc::Sender<Notification>,
}

/// Consumer side, owned by the pipeline loop.
#[derive(Debug)]
pub struct BusReceivers {
    pub messages: mpsc::Receiver<OutboundMessage>,
    pub responses: mpsc::Receiver<SendResult>,
    pub notifications: mpsc::Receiver<Notification>,
}

impl EventBus {
    pub fn new(sizes: QueueSizes) -> (Self, BusReceivers) {
        let (msg_tx, msg_rx) = mpsc::channel(sizes.messages.max(1));
        let (resp_tx, resp_rx) = mpsc::channel(sizes.responses.max(1));
        let (notif_tx, notif_rx) = mpsc::channel(sizes.notifications.max(1));
        (
            Self {
                messages: msg_tx,
                responses: resp_tx,
                notifications: notif_tx,
            },
            BusReceivers {
                messages: msg_rx,
                responses: resp_rx,
                notifications: notif_rx,
            },
        )
    }

    pub async fn push_message(&self, message: OutboundMessage) -> Result<()> {
        tracing::debug!(
            "📤 Queued message {} of notification {}",
            message.payload.id,
            message.notification_id
        );
        self.messages
            .send(message)
            .await
            .map_err(|_| NotifydError::Bus("messages queue closed".into()))
    }

    pub async fn push_response(&self, result: SendResult) -> Result<()> {
        tracing::debug!(
            "📥 Queued response for message {} (code {})",
            result.payload.id,
            result.response.code
        );
        self.responses
            .send(result)
            .await
            .map_err(|_| NotifydError::Bus("responses queue closed".into()))
    }

    pub async fn push_notification(&self, notification: Notification) -> Result<()> {
        tracing::debug!("🔔 Queued notification {}", notification.id);
        self.notifications
            .send(notification)
            .await
            .map_err(|_| NotifydError::Bus("notifications queue closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use notifyd_core::types::Filter;
    use std::time::Duration;

    fn payload(id: i64) -> SendPayload {
        SendPayload {
            id,
            text: "hi".into(),
            phone_number: 79990000000 + id,
        }
    }

    #[tokio::test]
    async fn test_fifo_within_queue() {
        let (bus, mut rx) = EventBus::new(QueueSizes::default());
        for id in 1..=3 {
            bus.push_message(OutboundMessage {
                notification_id: 1,
                payload: payload(id),
            })
            .await
            .unwrap();
        }
        for id in 1..=3 {
            assert_eq!(rx.messages.recv().await.unwrap().payload.id, id);
        }
    }

    #[tokio::test]
    async fn test_push_blocks_when_full() {
        let sizes = QueueSizes {
            messages: 1,
            responses: 1,
            notifications: 1,
        };
        let (bus, mut rx) = EventBus::new(sizes);
        bus.push_response(SendResult {
            payload: payload(1),
            response: SendResponse::ok(),
        })
        .await
        .unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            bus.push_response(SendResult {
                payload: payload(2),
                response: SendResponse::ok(),
            }),
        )
        .await;
        assert!(blocked.is_err(), "second push should wait for capacity");

        assert_eq!(rx.responses.recv().await.unwrap().payload.id, 1);
    }

    #[tokio::test]
    async fn test_closed_queue_is_error() {
        let (bus, rx) = EventBus::new(QueueSizes::default());
        drop(rx);
        let now = Utc::now();
        let err = bus
            .push_notification(Notification {
                id: 1,
                text: "x".into(),
                filter: Filter::by_tag("vip"),
                start_at: now,
                end_at: now,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NotifydError::Bus(_)));
    }

    #[test]
    fn test_sizes_from_config() {
        let sizes = QueueSizes::default();
        assert_eq!(sizes.messages, 10);
        assert_eq!(sizes.responses, 10);
        assert_eq!(sizes.notifications, 5);
    }
}
