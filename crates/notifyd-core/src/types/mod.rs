//! Domain types shared across notifyd crates.

pub mod client;
pub mod message;
pub mod notification;

pub use client::{Client, ClientRequest};
pub use message::{Message, MessageState, SendPayload, SendResponse, TRANSPORT_FAILURE_CODE};
pub use notification::{Filter, Notification, NotificationRequest};
