//! Send pipeline — the event loop tying the bus, the scheduler, storage and
//! the external sender together.
//!
//! ```text
//! notifications queue ──► handle_notification ──► Scheduler (add / update)
//!                                                     │ timer
//!                                                     ▼
//!                          process_notification ──► messages queue
//! messages queue ──► on_outbound ──► spawn dispatch ──► responses queue
//! responses queue ──► on_response ──► message state
//! ```
//!
//! The loop only makes decisions. Sending and task bodies run on their own
//! tokio tasks and talk back through the bus.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use notifyd_core::config::PipelineConfig;
use notifyd_core::types::{Client, MessageState, Notification, SendPayload, SendResponse};
use notifyd_core::{NotifydError, Result};
use tokio::sync::watch;

use crate::bus::{BusReceivers, EventBus, OutboundMessage, SendResult};
use crate::dispatch::Sender;
use crate::engine::{Presence, Scheduler};
use crate::persistence::DeliveryStore;
use crate::tasks::Task;

/// Timing knobs of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Delay before the first pass when the start time already passed.
    pub grace_delay: Duration,
    /// Pause between passes of one notification.
    pub rerun_interval: Duration,
    /// Pause before a message that failed in transport is queued again.
    pub redispatch_delay: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            grace_delay: config.grace_delay(),
            rerun_interval: config.rerun_interval().max(Duration::from_secs(1)),
            redispatch_delay: config.redispatch_delay(),
        }
    }
}

struct Shared {
    store: Arc<dyn DeliveryStore>,
    sender: Arc<dyn Sender>,
    bus: EventBus,
    scheduler: Scheduler,
    settings: PipelineSettings,
    /// Message ids with a transport retry pending.
    retrying: Mutex<HashSet<i64>>,
}

/// Handle to the send pipeline. Clones share the same state.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        sender: Arc<dyn Sender>,
        bus: EventBus,
        scheduler: Scheduler,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                sender,
                bus,
                scheduler,
                settings,
                retrying: Mutex::default(),
            }),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn settings(&self) -> PipelineSettings {
        self.shared.settings
    }

    /// Push every stored notification onto the bus. Returns how many were queued.
    ///
    /// Call after [`Pipeline::run`] is spawned, otherwise a full queue blocks.
    pub async fn seed(&self) -> Result<usize> {
        let notifications = self.shared.store.all_notifications()?;
        let count = notifications.len();
        for notification in notifications {
            self.shared.bus.push_notification(notification).await?;
        }
        tracing::info!("🌱 Re-seeded {count} notification(s) from storage");
        Ok(count)
    }

    /// Consume the bus until `shutdown` turns true.
    ///
    /// Always ends with [`NotifydError::Stopped`]. In-flight sends and
    /// scheduler timers keep going; call [`Scheduler::stop_all`] for those.
    pub async fn run(&self, mut rx: BusReceivers, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("🚀 Send pipeline started");
        loop {
            tokio::select! {
                // Err means the shutdown handle is gone, which also ends the loop.
                _ = shutdown.wait_for(|stop| *stop) => {
                    tracing::info!("🛑 Send pipeline stopping");
                    return Err(NotifydError::Stopped);
                }
                Some(notification) = rx.notifications.recv() => self.handle_notification(notification),
                Some(message) = rx.messages.recv() => self.on_outbound(message),
                Some(result) = rx.responses.recv() => self.on_response(result),
            }
        }
    }

    pub(crate) fn handle_notification(&self, notification: Notification) {
        match self.shared.scheduler.exists(notification.id) {
            Presence::Found(task) => self.update_task(&task, &notification),
            Presence::Absent => self.add_task(notification),
        }
    }

    fn update_task(&self, task: &Task, notification: &Notification) {
        task.update(|timing| {
            timing.first_run = notification.start_at;
            timing.expiry = notification.end_at;
        });
        tracing::debug!(
            "Task {} updated: start {}, end {}",
            notification.id,
            notification.start_at.to_rfc3339(),
            notification.end_at.to_rfc3339()
        );
    }

    fn add_task(&self, notification: Notification) {
        let now = Utc::now();
        if notification.is_expired(now) {
            tracing::debug!("Notification {} already ended, not scheduled", notification.id);
            return;
        }

        let settings = self.shared.settings;
        let first_run = if notification.start_at < now {
            now + chrono::Duration::from_std(settings.grace_delay)
                .unwrap_or_else(|_| chrono::Duration::zero())
        } else {
            notification.start_at
        };

        // The task table lives inside `shared`, so closures only hold a weak handle.
        let id = notification.id;
        let (work, work_snapshot) = (Arc::downgrade(&self.shared), notification.clone());
        let (on_err, err_snapshot) = (work.clone(), notification.clone());
        let task = Task::new(id, first_run, settings.rerun_interval, notification.end_at)
            .with_work(move || {
                let (pipeline, notification) = (Pipeline::upgrade(&work), work_snapshot.clone());
                async move {
                    match pipeline {
                        Some(pipeline) => pipeline.process_notification(&notification).await,
                        None => Ok(()),
                    }
                }
            })
            .on_error(move |err| {
                let (pipeline, notification) = (Pipeline::upgrade(&on_err), err_snapshot.clone());
                async move {
                    tracing::debug!("Re-queueing notification {} after failed pass: {err}", notification.id);
                    if let Some(pipeline) = pipeline {
                        pipeline.requeue_notification(notification).await;
                    }
                }
            });

        if let Err(err) = self.shared.scheduler.add_task(id, task) {
            tracing::warn!("⚠️ Could not schedule notification {id}: {err}");
            let pipeline = self.clone();
            tokio::spawn(async move { pipeline.requeue_notification(notification).await });
        }
    }

    fn upgrade(shared: &Weak<Shared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    fn retrying(&self) -> std::sync::MutexGuard<'_, HashSet<i64>> {
        self.shared.retrying.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn requeue_notification(&self, notification: Notification) {
        let id = notification.id;
        if let Err(err) = self.shared.bus.push_notification(notification).await {
            tracing::error!("❌ Could not re-queue notification {id}: {err}");
        }
    }

    pub(crate) fn on_outbound(&self, message: OutboundMessage) {
        if !self.shared.scheduler.exists(message.notification_id).is_found() {
            tracing::debug!(
                "Notification {} closed, dropping message {}",
                message.notification_id,
                message.payload.id
            );
            self.retrying().remove(&message.payload.id);
            return;
        }
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.dispatch(message).await });
    }

    /// Send one message and queue the result.
    ///
    /// A transport failure keeps retrying the same message every
    /// `redispatch_delay` until it goes through or its notification closes.
    /// While that retry is pending, passes skip the message so an unreachable
    /// sender does not collect one retry loop per pass.
    async fn dispatch(&self, message: OutboundMessage) {
        let bus = &self.shared.bus;
        match self.shared.sender.send(&message.payload).await {
            Ok(response) => {
                self.retrying().remove(&message.payload.id);
                let result = SendResult {
                    payload: message.payload,
                    response,
                };
                if let Err(err) = bus.push_response(result).await {
                    tracing::error!("❌ Could not queue send result: {err}");
                }
            }
            Err(err) => {
                tracing::warn!("⚠️ Message {} not delivered, will retry: {err}", message.payload.id);
                let failed = SendResult {
                    payload: message.payload.clone(),
                    response: SendResponse::transport_failure(err.to_string()),
                };
                if let Err(err) = bus.push_response(failed).await {
                    tracing::error!("❌ Could not queue send result: {err}");
                }
                self.retrying().insert(message.payload.id);
                tokio::time::sleep(self.shared.settings.redispatch_delay).await;
                let id = message.payload.id;
                if let Err(err) = bus.push_message(message).await {
                    tracing::error!("❌ Could not re-queue message: {err}");
                    self.retrying().remove(&id);
                }
            }
        }
    }

    pub(crate) fn on_response(&self, result: SendResult) {
        let state = MessageState::from_response_code(result.response.code);
        match self.shared.store.set_message_state(result.payload.id, state) {
            Ok(()) => tracing::debug!("Message {} → {state}", result.payload.id),
            Err(err) => tracing::error!("❌ Could not store state of message {}: {err}", result.payload.id),
        }
    }

    /// One pass over a notification.
    ///
    /// First pass: create and queue a message for every matching client.
    /// Later passes: queue unsent messages again and cover clients that
    /// started matching since. When neither is left the task is removed.
    pub async fn process_notification(&self, notification: &Notification) -> Result<()> {
        let store = &self.shared.store;

        if !store.has_messages(notification.id)? {
            let clients = store.matching_clients(&notification.filter)?;
            let created = self.create_messages(notification, &clients).await?;
            tracing::info!(
                "📨 Notification {}: {created} message(s) queued for {} matching client(s)",
                notification.id,
                clients.len()
            );
            return Ok(());
        }

        let mut unsent = store.unsent_messages(notification.id)?;
        let fresh = store.unmessaged_clients(notification.id, &notification.filter)?;
        if unsent.is_empty() && fresh.is_empty() {
            tracing::info!("✅ Notification {} delivered to every client", notification.id);
            self.shared.scheduler.remove(notification.id);
            return Ok(());
        }

        let pending = {
            let retrying = self.retrying();
            let before = unsent.len();
            unsent.retain(|payload| !retrying.contains(&payload.id));
            before - unsent.len()
        };
        let resent = unsent.len();
        for payload in unsent {
            self.shared
                .bus
                .push_message(OutboundMessage {
                    notification_id: notification.id,
                    payload,
                })
                .await?;
        }
        let created = self.create_messages(notification, &fresh).await?;
        tracing::info!(
            "🔁 Notification {}: {resent} message(s) retried, {pending} awaiting redispatch, {created} new",
            notification.id
        );
        Ok(())
    }

    /// Insert and queue a message per client. Insert failures skip the
    /// client; it shows up again as unmessaged on the next pass.
    async fn create_messages(&self, notification: &Notification, clients: &[Client]) -> Result<usize> {
        let mut created = 0;
        for client in clients {
            let message = match self
                .shared
                .store
                .create_message(notification.id, client.id, &notification.text)
            {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!("⚠️ Skipping client {}: {err}", client.id);
                    continue;
                }
            };
            self.shared
                .bus
                .push_message(OutboundMessage {
                    notification_id: notification.id,
                    payload: SendPayload {
                        id: message.id,
                        text: message.text,
                        phone_number: client.phone_number,
                    },
                })
                .await?;
            created += 1;
        }
        Ok(created)
    }
}
