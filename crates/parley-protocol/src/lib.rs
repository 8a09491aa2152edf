//! # parley-protocol
//!
//! Wire definitions for the Parley realtime messaging engine.
//!
//! Every event exchanged with a client is one variant of a closed enum:
//!
//! - [`ClientEvent`] - inbound requests (`chat:send-dm`, `chat:join-group`, ...)
//! - [`ServerEvent`] - outbound acknowledgements, live messages and errors
//!
//! Payloads are validated when an envelope is turned into a [`ClientEvent`],
//! so nothing past the session boundary ever sees an untyped blob.
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientEvent};
//!
//! let event = codec::decode_text(
//!     r#"{"event":"chat:join-group","data":{"groupId":"rust"}}"#,
//! ).unwrap();
//! assert!(matches!(event, ClientEvent::JoinGroup(ref g) if g.group_id == "rust"));
//! ```

pub mod codec;
pub mod events;
pub mod types;

pub use codec::{ProtocolError, WireFormat};
pub use events::{ClientEvent, Envelope, ErrorCode, ServerEvent};
pub use types::{
    validate_identifier, ChatMessage, ConversationKind, DeliveryState, LiveMessage,
    MessageStatus, Notification,
};
