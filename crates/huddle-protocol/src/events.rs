//! Outbound events pushed by the server.

use crate::records::{Member, MessageId, MessageRecord, UserRecord};
use serde::{Deserialize, Serialize};

/// Error codes carried by [`Event::Error`].
pub mod codes {
    pub const VALIDATION: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL: u16 = 500;
    pub const UNAVAILABLE: u16 = 503;
}

/// An event delivered to one or more connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Event {
    /// First event on every connection.
    Connected {
        connection_id: u64,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Full room state: members, last page of messages, pinned set.
    RoomData {
        room_id: String,
        members: Vec<Member>,
        messages: Vec<MessageRecord>,
        pinned_messages: Vec<MessageRecord>,
    },

    /// A message was appended to the room.
    NewMessage { message: MessageRecord },

    /// A message's pin state changed.
    MessageUpdated {
        message: MessageRecord,
        pinned_messages: Vec<MessageRecord>,
    },

    /// Messages were soft-deleted by a member.
    MessagesDeleted { message_ids: Vec<MessageId> },

    /// Messages were removed permanently.
    MessagesHardDeleted { message_ids: Vec<MessageId> },

    /// Soft-deleted messages were restored.
    MessagesRestored { message_ids: Vec<MessageId> },

    /// Every soft-deleted message of the room was restored.
    AllMessagesRestored { message_ids: Vec<MessageId> },

    /// Reply to `load_more_messages`, ascending order.
    MoreMessagesLoaded {
        room_id: String,
        messages: Vec<MessageRecord>,
    },

    /// A member changed its profile.
    UserUpdated { user: UserRecord },

    /// Directed at the kicked user's connections.
    UserKicked { user_id: String, room_id: String },

    /// Directed at an invited user's connections.
    ForceJoinRoom {
        target_user_id: String,
        room_id: String,
    },

    /// Directed at the connection whose action failed.
    Error { code: u16, message: String },

    /// Reply to `ping`.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Event {
    /// The wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "connected",
            Event::RoomData { .. } => "room_data",
            Event::NewMessage { .. } => "new_message",
            Event::MessageUpdated { .. } => "message_updated",
            Event::MessagesDeleted { .. } => "messages_deleted",
            Event::MessagesHardDeleted { .. } => "messages_hard_deleted",
            Event::MessagesRestored { .. } => "messages_restored",
            Event::AllMessagesRestored { .. } => "all_messages_restored",
            Event::MoreMessagesLoaded { .. } => "more_messages_loaded",
            Event::UserUpdated { .. } => "user_updated",
            Event::UserKicked { .. } => "user_kicked",
            Event::ForceJoinRoom { .. } => "force_join_room",
            Event::Error { .. } => "error",
            Event::Pong { .. } => "pong",
        }
    }

    /// Create an Error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Event::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a Connected event.
    #[must_use]
    pub fn connected(connection_id: u64, heartbeat: u32) -> Self {
        Event::Connected {
            connection_id,
            version: crate::PROTOCOL_VERSION,
            heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_match_tags() {
        let events = vec![
            Event::connected(1, 30_000),
            Event::MessagesDeleted {
                message_ids: vec![1, 2],
            },
            Event::ForceJoinRoom {
                target_user_id: "u2".into(),
                room_id: "room-1".into(),
            },
            Event::error(codes::FORBIDDEN, "You cannot kick the Host."),
        ];

        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.name());
        }
    }

    #[test]
    fn test_camel_case_fields() {
        let json = serde_json::to_value(Event::MessagesHardDeleted {
            message_ids: vec![3],
        })
        .unwrap();
        assert_eq!(json["messageIds"][0], 3);

        let json = serde_json::to_value(Event::UserKicked {
            user_id: "u2".into(),
            room_id: "room-1".into(),
        })
        .unwrap();
        assert_eq!(json["userId"], "u2");
        assert_eq!(json["roomId"], "room-1");
    }
}
