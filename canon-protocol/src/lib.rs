//! canon-protocol: Wire definitions for session synchronization
//!
//! This crate defines the message types and session report shapes
//! exchanged between a canon client and the session backend, plus the
//! length-prefixed JSON codec used on the transport.

pub mod codec;
pub mod messages;
pub mod types;

pub use codec::{ClientCodec, CodecError, FrameCodec, Inbound, ServerCodec, MAX_FRAME_SIZE};
pub use messages::{ClientMessage, ServerMessage};
pub use types::{RemoteSession, SessionEntry, SessionStatus};
