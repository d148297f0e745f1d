//! # notifyd core
//!
//! Domain types, the workspace error type and configuration shared by the
//! scheduler, gateway and binary crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::NotifydConfig;
pub use error::{NotifydError, Result};
