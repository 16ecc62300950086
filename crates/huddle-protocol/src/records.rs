//! Records carried inside events.
//!
//! These mirror the persisted rows closely; field names stay snake_case so
//! that clients can treat a record as a plain row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A message identifier. Monotonic across all rooms.
pub type MessageId = i64;

/// Identifier of the reserved user that authors system messages.
pub const SYSTEM_USER_ID: &str = "system";

/// Message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    File,
    System,
}

impl MessageKind {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for MessageKind {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "text" => Ok(MessageKind::Text),
            "file" => Ok(MessageKind::File),
            "system" => Ok(MessageKind::System),
            _ => Err("Invalid message kind"),
        }
    }
}

/// Link preview attached to a text message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPreview {
    /// Page title (`og:title` or `<title>`).
    #[serde(default)]
    pub title: String,
    /// Preview image URL, absolute.
    #[serde(default)]
    pub image: String,
}

impl LinkPreview {
    /// A preview with neither title nor image carries nothing worth showing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.image.is_empty()
    }
}

/// A message as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub room_id: String,
    pub user_id: String,
    /// Author display name, resolved at read time.
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Text body, or the public URL of the stored file.
    pub content: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub file_thumbnail: Option<String>,
    #[serde(default)]
    pub url_metadata: Option<LinkPreview>,
    pub is_pinned: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Upload correlation id echoed back to the uploading client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl MessageRecord {
    /// Whether the message is soft-deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Default render rule: hosts see soft-deleted messages, members do not.
    #[must_use]
    pub fn visible_to(&self, viewer_is_host: bool) -> bool {
        viewer_is_host || !self.is_deleted()
    }

    /// Sort key of the total message order.
    #[must_use]
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

/// A user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub room_id: Option<String>,
    pub is_host: bool,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
}

/// A room member as listed in a resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub is_host: bool,
}

impl From<&UserRecord> for Member {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id.clone(),
            name: user.name.clone(),
            is_host: user.is_host,
        }
    }
}
