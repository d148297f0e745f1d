//! # notifyd Gateway
//! HTTP REST API for clients, notifications and their delivery messages.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
