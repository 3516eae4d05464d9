//! Tatbeeb Link relay assembly
//!
//! Loads configuration, terminates TLS on the control port, and wires the
//! control plane, forwarders, liveness supervisor, directory notifier, and
//! admin surface together.

pub mod config;
pub mod relay;

pub use config::{ConfigError, HisConfig, JwtConfig, RelayConfig};
pub use relay::{Relay, RelayError};
