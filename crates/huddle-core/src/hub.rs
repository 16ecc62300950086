//! Connection registry and fan-out.
//!
//! The hub knows every live connection, which user it is bound to and which
//! room's fan-out it is subscribed to. Rooms and users are both indexed so
//! that room broadcasts and directed signals are point-to-point lookups.

use dashmap::{DashMap, DashSet};
use huddle_protocol::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Connection identifier, unique for the lifetime of the process.
pub type ConnId = u64;

/// Receiving half handed to the connection task.
pub type EventReceiver = mpsc::UnboundedReceiver<Arc<Event>>;

struct ConnectionEntry {
    sender: mpsc::UnboundedSender<Arc<Event>>,
    user: Option<String>,
    room: Option<String>,
}

/// The connection hub.
#[derive(Default)]
pub struct Hub {
    next_id: AtomicU64,
    connections: DashMap<ConnId, ConnectionEntry>,
    /// room id -> subscribed connections
    rooms: DashMap<String, DashSet<ConnId>>,
    /// user id -> bound connections
    users: DashMap<String, DashSet<ConnId>>,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    pub fn connect(&self) -> (ConnId, EventReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.connections.insert(
            id,
            ConnectionEntry {
                sender,
                user: None,
                room: None,
            },
        );
        debug!(connection = id, "Connection registered");
        (id, receiver)
    }

    /// Forget a connection. Returns the user it was bound to.
    pub fn disconnect(&self, conn: ConnId) -> Option<String> {
        let (_, entry) = self.connections.remove(&conn)?;
        if let Some(room) = &entry.room {
            remove_from(&self.rooms, room, conn);
        }
        if let Some(user) = &entry.user {
            remove_from(&self.users, user, conn);
        }
        debug!(connection = conn, user = ?entry.user, "Connection removed");
        entry.user
    }

    /// Bind a connection to a user, replacing any previous binding.
    ///
    /// Returns `false` if the connection is unknown.
    pub fn bind(&self, conn: ConnId, user: &str) -> bool {
        let previous = {
            let Some(mut entry) = self.connections.get_mut(&conn) else {
                return false;
            };
            entry.user.replace(user.to_string())
        };
        if let Some(previous) = previous.filter(|p| p != user) {
            remove_from(&self.users, &previous, conn);
        }
        self.users.entry(user.to_string()).or_default().insert(conn);
        trace!(connection = conn, user = %user, "Connection bound");
        true
    }

    /// The user a connection is bound to.
    #[must_use]
    pub fn user_of(&self, conn: ConnId) -> Option<String> {
        self.connections.get(&conn).and_then(|e| e.user.clone())
    }

    /// The room a connection is subscribed to.
    #[must_use]
    pub fn room_of(&self, conn: ConnId) -> Option<String> {
        self.connections.get(&conn).and_then(|e| e.room.clone())
    }

    /// Subscribe a connection to a room's fan-out, leaving any other room.
    pub fn subscribe(&self, conn: ConnId, room: &str) -> bool {
        let previous = {
            let Some(mut entry) = self.connections.get_mut(&conn) else {
                return false;
            };
            entry.room.replace(room.to_string())
        };
        if let Some(previous) = previous.filter(|p| p != room) {
            remove_from(&self.rooms, &previous, conn);
        }
        self.rooms.entry(room.to_string()).or_default().insert(conn);
        debug!(connection = conn, room = %room, "Subscribed");
        true
    }

    /// Unsubscribe one connection from whatever room it follows.
    ///
    /// Returns the room it left.
    pub fn unsubscribe(&self, conn: ConnId) -> Option<String> {
        let room = self.connections.get_mut(&conn)?.room.take()?;
        remove_from(&self.rooms, &room, conn);
        debug!(connection = conn, room = %room, "Unsubscribed");
        Some(room)
    }

    /// Unsubscribe every connection of `user` from `room`.
    pub fn unsubscribe_user(&self, user: &str, room: &str) {
        for conn in self.connections_of(user) {
            let subscribed = self
                .connections
                .get_mut(&conn)
                .map(|mut entry| {
                    if entry.room.as_deref() == Some(room) {
                        entry.room = None;
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if subscribed {
                remove_from(&self.rooms, room, conn);
                debug!(connection = conn, room = %room, "Unsubscribed");
            }
        }
    }

    /// Drop a room's fan-out entirely.
    pub fn drop_room(&self, room: &str) {
        let Some((_, members)) = self.rooms.remove(room) else {
            return;
        };
        for conn in members.iter() {
            if let Some(mut entry) = self.connections.get_mut(&*conn) {
                if entry.room.as_deref() == Some(room) {
                    entry.room = None;
                }
            }
        }
        debug!(room = %room, "Room fan-out dropped");
    }

    /// Deliver an event to one connection.
    pub fn send_to_conn(&self, conn: ConnId, event: Arc<Event>) -> bool {
        match self.connections.get(&conn) {
            Some(entry) => entry.sender.send(event).is_ok(),
            None => {
                trace!(connection = conn, "Send to unknown connection");
                false
            }
        }
    }

    /// Deliver an event to every connection subscribed to a room.
    ///
    /// Returns the number of connections reached.
    pub fn send_to_room(&self, room: &str, event: Arc<Event>) -> usize {
        let targets: Vec<ConnId> = self
            .rooms
            .get(room)
            .map(|set| set.iter().map(|c| *c).collect())
            .unwrap_or_default();
        let delivered = targets
            .into_iter()
            .filter(|conn| self.send_to_conn(*conn, Arc::clone(&event)))
            .count();
        trace!(room = %room, event = event.name(), recipients = delivered, "Room event");
        delivered
    }

    /// Deliver an event to every connection bound to a user.
    pub fn send_to_user(&self, user: &str, event: Arc<Event>) -> usize {
        self.connections_of(user)
            .into_iter()
            .filter(|conn| self.send_to_conn(*conn, Arc::clone(&event)))
            .count()
    }

    /// Whether a user has at least one live connection.
    #[must_use]
    pub fn is_user_connected(&self, user: &str) -> bool {
        self.users.get(user).is_some_and(|set| !set.is_empty())
    }

    /// Connections subscribed to a room.
    #[must_use]
    pub fn room_connections(&self, room: &str) -> Vec<ConnId> {
        let mut conns: Vec<ConnId> = self
            .rooms
            .get(room)
            .map(|set| set.iter().map(|c| *c).collect())
            .unwrap_or_default();
        conns.sort_unstable();
        conns
    }

    fn connections_of(&self, user: &str) -> Vec<ConnId> {
        self.users
            .get(user)
            .map(|set| set.iter().map(|c| *c).collect())
            .unwrap_or_default()
    }

    /// Hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connection_count: self.connections.len(),
            room_count: self.rooms.len(),
            user_count: self.users.len(),
        }
    }
}

/// Remove `conn` from a keyed set, dropping the key once the set is empty.
fn remove_from(index: &DashMap<String, DashSet<ConnId>>, key: &str, conn: ConnId) {
    let empty = index
        .get(key)
        .map(|set| {
            set.remove(&conn);
            set.is_empty()
        })
        .unwrap_or(false);
    if empty {
        index.remove_if(key, |_, set| set.is_empty());
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Live connections.
    pub connection_count: usize,
    /// Rooms with at least one subscribed connection.
    pub room_count: usize,
    /// Users with at least one bound connection.
    pub user_count: usize,
}
