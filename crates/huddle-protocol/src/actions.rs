//! Inbound actions sent by clients.
//!
//! Each action is a tagged object, e.g.
//! `{"type": "join_room", "userId": "...", "roomId": "room-..."}`.

use crate::records::{LinkPreview, MessageId};
use serde::{Deserialize, Serialize};

/// Default page size for `load_more_messages`.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// An action issued by a client over its real-time connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Action {
    /// Bind the connection to a user without touching membership.
    Identify { user_id: String },

    /// Join a room, or create one when `room_id` is absent.
    JoinRoom {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// Send a text message to the user's current room.
    SendMessage {
        user_id: String,
        content: String,
        #[serde(
            default,
            alias = "url_metadata",
            skip_serializing_if = "Option::is_none"
        )]
        url_metadata: Option<LinkPreview>,
    },

    /// Flip the pinned flag of a message.
    TogglePin {
        user_id: String,
        message_id: MessageId,
    },

    /// Leave the current room.
    LeaveRoom { user_id: String },

    /// Remove another member from the room.
    KickMember {
        action_user_id: String,
        target_user_id: String,
    },

    /// Ask a paired device to join the host's room.
    InvitePairedDevice {
        host_id: String,
        target_token: String,
    },

    /// Page backwards through a room's history.
    LoadMoreMessages {
        room_id: String,
        before_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    /// Delete messages: hard for the host, soft for everyone else.
    SoftDeleteMessages {
        user_id: String,
        message_ids: Vec<MessageId>,
    },

    /// Clear the soft-delete mark of some messages (host only).
    RestoreMessages {
        user_id: String,
        message_ids: Vec<MessageId>,
    },

    /// Clear every soft-delete mark in the room (host only).
    RestoreAllMessages { user_id: String },

    /// Application-level keepalive.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Action {
    /// The wire name of the action.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Action::Identify { .. } => "identify",
            Action::JoinRoom { .. } => "join_room",
            Action::SendMessage { .. } => "send_message",
            Action::TogglePin { .. } => "toggle_pin",
            Action::LeaveRoom { .. } => "leave_room",
            Action::KickMember { .. } => "kick_member",
            Action::InvitePairedDevice { .. } => "invite_paired_device",
            Action::LoadMoreMessages { .. } => "load_more_messages",
            Action::SoftDeleteMessages { .. } => "soft_delete_messages",
            Action::RestoreMessages { .. } => "restore_messages",
            Action::RestoreAllMessages { .. } => "restore_all_messages",
            Action::Ping { .. } => "ping",
        }
    }

    /// The user the action claims to act for, if any.
    #[must_use]
    pub fn acting_user(&self) -> Option<&str> {
        match self {
            Action::Identify { user_id }
            | Action::JoinRoom { user_id, .. }
            | Action::SendMessage { user_id, .. }
            | Action::TogglePin { user_id, .. }
            | Action::LeaveRoom { user_id }
            | Action::SoftDeleteMessages { user_id, .. }
            | Action::RestoreMessages { user_id, .. }
            | Action::RestoreAllMessages { user_id } => Some(user_id),
            Action::KickMember { action_user_id, .. } => Some(action_user_id),
            Action::InvitePairedDevice { host_id, .. } => Some(host_id),
            Action::LoadMoreMessages { .. } | Action::Ping { .. } => None,
        }
    }

    /// Create a JoinRoom action.
    #[must_use]
    pub fn join(user_id: impl Into<String>, room_id: Option<String>) -> Self {
        Action::JoinRoom {
            user_id: user_id.into(),
            room_id,
        }
    }

    /// Create a SendMessage action without a preview.
    #[must_use]
    pub fn send(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Action::SendMessage {
            user_id: user_id.into(),
            content: content.into(),
            url_metadata: None,
        }
    }

    /// Create a LeaveRoom action.
    #[must_use]
    pub fn leave(user_id: impl Into<String>) -> Self {
        Action::LeaveRoom {
            user_id: user_id.into(),
        }
    }
}
