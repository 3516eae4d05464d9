//! Authentication for the Tatbeeb Link relay
//!
//! Verifies agent-supplied JWTs during registration and synthesises the
//! per-tenant SQL credentials echoed back to the agent.

pub mod credentials;
pub mod jwt;

pub use credentials::{connection_string, generate_password, sql_user};
pub use jwt::{JwtError, JwtValidator, LinkClaims};
