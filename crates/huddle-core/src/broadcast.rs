//! Effects produced by a command and their delivery.
//!
//! Handlers never touch the hub or the file store directly. They record what
//! should happen in an [`Outbox`] while their transaction is open; the engine
//! flushes the outbox after commit, in the order the effects were produced.

use crate::hub::{ConnId, Hub};
use crate::services::FileStore;
use crate::store::{messages, rooms, users, Store};
use huddle_protocol::{Event, Member, MessageRecord};
use sqlx::SqliteConnection;
use std::sync::Arc;
use tracing::{debug, warn};

/// One deferred side effect.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    Bind { conn: ConnId, user: String },
    Subscribe { conn: ConnId, room: String },
    Unsubscribe { conn: ConnId },
    UnsubscribeUser { user: String, room: String },
    ToRoom { room: String, event: Event },
    ToUser { user: String, event: Event },
    ToConn { conn: ConnId, event: Event },
    /// Full room state to every subscriber.
    Resync { room: String },
    /// Full room state to one connection.
    ResyncConn { conn: ConnId, room: String },
    DropRoom { room: String },
    RemovePayloads { urls: Vec<String> },
    ReleaseRoom { room: String },
}

/// Ordered effects of one command.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    effects: Vec<Effect>,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind(&mut self, conn: ConnId, user: &str) {
        self.effects.push(Effect::Bind {
            conn,
            user: user.to_string(),
        });
    }

    pub(crate) fn subscribe(&mut self, conn: ConnId, room: &str) {
        self.effects.push(Effect::Subscribe {
            conn,
            room: room.to_string(),
        });
    }

    pub(crate) fn unsubscribe(&mut self, conn: ConnId) {
        self.effects.push(Effect::Unsubscribe { conn });
    }

    pub(crate) fn unsubscribe_user(&mut self, user: &str, room: &str) {
        self.effects.push(Effect::UnsubscribeUser {
            user: user.to_string(),
            room: room.to_string(),
        });
    }

    pub(crate) fn to_room(&mut self, room: &str, event: Event) {
        self.effects.push(Effect::ToRoom {
            room: room.to_string(),
            event,
        });
    }

    pub(crate) fn to_user(&mut self, user: &str, event: Event) {
        self.effects.push(Effect::ToUser {
            user: user.to_string(),
            event,
        });
    }

    pub(crate) fn to_conn(&mut self, conn: ConnId, event: Event) {
        self.effects.push(Effect::ToConn { conn, event });
    }

    pub(crate) fn new_message(&mut self, message: MessageRecord) {
        let room = message.room_id.clone();
        self.to_room(&room, Event::NewMessage { message });
    }

    pub(crate) fn resync(&mut self, room: &str) {
        self.effects.push(Effect::Resync {
            room: room.to_string(),
        });
    }

    pub(crate) fn resync_conn(&mut self, conn: ConnId, room: &str) {
        self.effects.push(Effect::ResyncConn {
            conn,
            room: room.to_string(),
        });
    }

    pub(crate) fn drop_room(&mut self, room: &str) {
        self.effects.push(Effect::DropRoom {
            room: room.to_string(),
        });
    }

    pub(crate) fn remove_payloads(&mut self, urls: Vec<String>) {
        if !urls.is_empty() {
            self.effects.push(Effect::RemovePayloads { urls });
        }
    }

    pub(crate) fn release_room(&mut self, room: &str) {
        self.effects.push(Effect::ReleaseRoom {
            room: room.to_string(),
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.effects.len()
    }

    #[cfg(test)]
    pub(crate) fn effects(&self) -> &[Effect] {
        &self.effects
    }
}

/// Build the full-state event of a room, or `None` if it no longer exists.
pub async fn room_snapshot(
    conn: &mut SqliteConnection,
    room_id: &str,
    page_size: u32,
) -> Result<Option<Event>, sqlx::Error> {
    if !rooms::exists(conn, room_id).await? {
        return Ok(None);
    }

    let members = users::members(conn, room_id)
        .await?
        .iter()
        .map(|row| Member::from(&row.to_record()))
        .collect();
    let messages = messages::latest(conn, room_id, page_size)
        .await?
        .into_iter()
        .map(messages::MessageRow::into_record)
        .collect();
    let pinned_messages = messages::pinned(conn, room_id)
        .await?
        .into_iter()
        .map(messages::MessageRow::into_record)
        .collect();

    Ok(Some(Event::RoomData {
        room_id: room_id.to_string(),
        members,
        messages,
        pinned_messages,
    }))
}

/// Where committed effects go.
pub(crate) struct Delivery<'a> {
    pub store: &'a Store,
    pub hub: &'a Hub,
    pub files: &'a dyn FileStore,
    pub page_size: u32,
}

impl Delivery<'_> {
    /// Apply committed effects in order. Returns how many were applied.
    pub(crate) async fn flush(&self, outbox: Outbox) -> usize {
        let count = outbox.len();
        for effect in outbox.effects {
            match effect {
                Effect::Bind { conn, user } => {
                    self.hub.bind(conn, &user);
                }
                Effect::Subscribe { conn, room } => {
                    self.hub.subscribe(conn, &room);
                }
                Effect::Unsubscribe { conn } => {
                    self.hub.unsubscribe(conn);
                }
                Effect::UnsubscribeUser { user, room } => self.hub.unsubscribe_user(&user, &room),
                Effect::ToRoom { room, event } => {
                    self.hub.send_to_room(&room, Arc::new(event));
                }
                Effect::ToUser { user, event } => {
                    let reached = self.hub.send_to_user(&user, Arc::new(event));
                    debug!(user = %user, connections = reached, "Directed event");
                }
                Effect::ToConn { conn, event } => {
                    self.hub.send_to_conn(conn, Arc::new(event));
                }
                Effect::Resync { room } => {
                    if let Some(event) = self.snapshot(&room).await {
                        self.hub.send_to_room(&room, Arc::new(event));
                    }
                }
                Effect::ResyncConn { conn, room } => {
                    if let Some(event) = self.snapshot(&room).await {
                        self.hub.send_to_conn(conn, Arc::new(event));
                    }
                }
                Effect::DropRoom { room } => self.hub.drop_room(&room),
                Effect::RemovePayloads { urls } => {
                    for url in urls {
                        if let Err(e) = self.files.remove(&url).await {
                            warn!(url = %url, error = %e, "Failed to remove payload");
                        }
                    }
                }
                Effect::ReleaseRoom { room } => {
                    if let Err(e) = self.files.release_room(&room).await {
                        warn!(room = %room, error = %e, "Failed to release room storage");
                    }
                }
            }
        }
        count
    }

    async fn snapshot(&self, room: &str) -> Option<Event> {
        let result = async {
            let mut conn = self.store.pool().acquire().await?;
            room_snapshot(&mut conn, room, self.page_size).await
        }
        .await;
        match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(room = %room, error = %e, "Failed to build room snapshot");
                None
            }
        }
    }
}
