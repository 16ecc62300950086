//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle room chat service.
//!
//! Clients send [`Action`]s and receive [`Event`]s over a WebSocket. Text
//! frames carry JSON, binary frames carry length-prefixed MessagePack.
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, Action};
//!
//! let action = Action::join("user-1", None);
//! let text = codec::encode_text(&action).unwrap();
//! let decoded: Action = codec::decode_text(&text).unwrap();
//! assert_eq!(action, decoded);
//! ```

pub mod actions;
pub mod codec;
pub mod events;
pub mod records;
pub mod token;

pub use actions::{Action, DEFAULT_PAGE_SIZE};
pub use codec::{Encoding, ProtocolError};
pub use events::{codes, Event};
pub use records::{
    LinkPreview, Member, MessageId, MessageKind, MessageRecord, UserRecord, SYSTEM_USER_ID,
};
pub use token::{Token, TokenError};

/// Current protocol version, announced in [`Event::Connected`].
pub const PROTOCOL_VERSION: u8 = 1;
