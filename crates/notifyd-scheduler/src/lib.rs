//! # notifyd Scheduler
//!
//! Per-notification recurring tasks, the event bus and the send pipeline.
//!
//! ## Architecture
//! ```text
//! Gateway / seed ──► notifications queue ─┐
//!                                         ▼
//!                                   Pipeline loop ──► Scheduler
//!                                    ▲        │        ├── Task #1  (first run, every 30min, expiry)
//!                                    │        │        └── Task #2  ...
//!                   responses queue ─┘        │             │ pass
//!                          ▲                  │             ▼
//!                          │             spawn dispatch ◄── messages queue
//!                          └── Sender (HTTP POST /send/{id})
//! ```
//! - SQLite persistence (clients, notifications, messages)
//! - Tokio timers only — an idle scheduler sleeps
//! - At-least-once delivery: unsent messages are retried every pass

pub mod bus;
pub mod dispatch;
pub mod engine;
pub mod persistence;
pub mod pipeline;
pub mod tasks;

pub use bus::{BusReceivers, EventBus, OutboundMessage, QueueSizes, SendResult};
pub use dispatch::{HttpSender, Sender};
pub use engine::{Presence, Scheduler};
pub use persistence::{DeliveryStore, NotifydDb, Page};
pub use pipeline::{Pipeline, PipelineSettings};
pub use tasks::{Task, TaskTiming};
