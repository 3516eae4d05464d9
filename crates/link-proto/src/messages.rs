//! Control protocol message types
//!
//! Messages are JSON objects tagged with a `type` field, carried
//! length-delimited on the control stream of a mux session.

use serde::{Deserialize, Serialize};

/// Registration request sent by an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub tenant_id: String,
    pub jwt: String,
    pub version: String,
}

/// Registration confirmation sent back to the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    pub tenant_id: String,
    pub assigned_port: u16,
    pub sql_user: String,
    pub sql_password: String,
    pub public_host: String,
    pub connection_string: String,
}

/// Error codes understood by agents
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    #[serde(rename = "INVALID_JWT")]
    InvalidJwt,
    #[serde(rename = "TENANT_ID_MISMATCH")]
    TenantIdMismatch,
    #[serde(rename = "NO_AVAILABLE_PORTS")]
    NoAvailablePorts,
    #[serde(rename = "REGISTRATION_FAILED")]
    RegistrationFailed,
}

/// Main control protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum ControlMessage {
    #[serde(rename = "register")]
    Register(RegisterPayload),

    #[serde(rename = "registered")]
    Registered(RegisteredPayload),

    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },

    /// Application keepalive from the agent; refreshes the tenant heartbeat
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,
}
