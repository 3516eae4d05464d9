//! Tatbeeb Link Protocol Definitions
//!
//! This crate defines the control messages, framing, and stream multiplexing
//! used between the relay and on-premise agents over a single TLS connection.

pub mod codec;
pub mod frame;
pub mod messages;
pub mod session;

pub use codec::{read_message, write_message, CodecError, MessageCodec};
pub use frame::{Frame, FrameFlags, FrameType, MuxError, StreamId};
pub use messages::{ControlMessage, ErrorCode, RegisterPayload, RegisteredPayload};
pub use session::{MuxSession, MuxStream, MuxStreamReceiver, MuxStreamSender, SessionConfig, SessionMode};

/// Protocol version advertised in registration messages
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum payload carried by a single data frame (64KB)
pub const MAX_FRAME_PAYLOAD: u32 = 64 * 1024;

/// Stream ID 0 is reserved and never carries data
pub const RESERVED_STREAM_ID: u32 = 0;
