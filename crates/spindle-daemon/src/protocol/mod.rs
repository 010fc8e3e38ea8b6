//! Wire protocol: framing, message types, protocol errors.
//!
//! The protocol stack, bottom to top:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Typed message bodies (JSON)       │  messages
//! ├─────────────────────────────────────────┤
//! │   Body encryption (per-client XXTEA)     │  spindle_core::crypto
//! ├─────────────────────────────────────────┤
//! │  Framing: u16 header len + JSON header   │  framing
//! ├─────────────────────────────────────────┤
//! │              TCP transport               │  tokio
//! └─────────────────────────────────────────┘
//! ```
//!
//! Headers are never encrypted; the `encrypted` header flag says whether
//! the body was. Frame limits are enforced before allocation.

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{MAX_BODY_LEN, MAX_HEADER_LEN, ProtocolError, ProtocolResult};
pub use framing::MessageCodec;
pub use messages::{
    AuthRequestBody, AuthResponseBody, CommandRequestBody, CommandResponseBody, ErrorResponseBody,
    Header, HeartbeatRequestBody, HeartbeatResponseBody, Message, MessageType, parse_body,
};
