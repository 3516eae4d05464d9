//! HIS backend notifier
//!
//! Fire-and-forget HTTP client that reports port bindings and tenant
//! heartbeats to the directory backend. Failures are logged and never
//! affect tenant liveness.

pub mod client;

pub use client::{HisClient, HisError};
