//! Who belongs to which room, and who hosts it.

use crate::broadcast::Outbox;
use crate::engine::{load_user, Engine};
use crate::error::{CoreError, CoreResult};
use crate::hub::ConnId;
use crate::store::{messages, rooms, users, NewMessage, UserRow};
use huddle_protocol::{Event, Token};
use sqlx::SqliteConnection;
use tracing::{debug, info};
use uuid::Uuid;

/// Why a member is leaving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Departure {
    Left,
    Kicked { by: String },
}

impl Departure {
    fn announcement(&self, name: &str) -> String {
        match self {
            Departure::Left => format!("{name} left the room."),
            Departure::Kicked { by } => format!("{name} was kicked by {by}."),
        }
    }
}

impl Engine {
    /// Join `room_id`, or create a fresh room when it is absent.
    pub(crate) async fn join(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        conn: ConnId,
        user_id: &str,
        room_id: Option<&str>,
    ) -> CoreResult<()> {
        let user = load_user(tx, user_id).await?;
        let target = room_id.map(str::trim).filter(|r| !r.is_empty()).map(room_from_input);

        let Some(room) = target else {
            return self.create_room(tx, out, conn, &user).await;
        };

        if !rooms::exists(tx, &room).await? {
            return Err(CoreError::room_not_found());
        }

        if user.is_in(&room) {
            out.subscribe(conn, &room);
            out.resync(&room);
            return Ok(());
        }

        self.leave_current(tx, out, &user).await?;

        let now = self.now_millis();
        users::enter_room(tx, user_id, &room, false, now).await?;
        let joined = messages::insert(
            tx,
            &NewMessage::system(&room, &format!("{} joined the room.", user.name), now),
        )
        .await?;

        out.subscribe(conn, &room);
        out.new_message(joined.into_record());
        out.resync(&room);
        debug!(user = %user_id, room = %room, "Joined room");
        Ok(())
    }

    async fn create_room(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        conn: ConnId,
        user: &UserRow,
    ) -> CoreResult<()> {
        self.leave_current(tx, out, user).await?;

        let room = format!("room-{}", Uuid::new_v4());
        let now = self.now_millis();
        rooms::insert(tx, &room, now).await?;
        users::enter_room(tx, &user.id, &room, true, now).await?;
        let created = messages::insert(tx, &NewMessage::system(&room, "Room created.", now)).await?;

        out.subscribe(conn, &room);
        out.new_message(created.into_record());
        out.resync(&room);
        info!(user = %user.id, room = %room, "Room created");
        Ok(())
    }

    /// Leave the current room, if any.
    pub(crate) async fn leave(&self, tx: &mut SqliteConnection, out: &mut Outbox, user_id: &str) -> CoreResult<()> {
        let user = load_user(tx, user_id).await?;
        self.leave_current(tx, out, &user).await
    }

    /// Remove a user from its room as the first half of a swap or a plain
    /// leave. Its connections stop receiving the old room before anything
    /// is announced there.
    async fn leave_current(&self, tx: &mut SqliteConnection, out: &mut Outbox, user: &UserRow) -> CoreResult<()> {
        let Some(room) = user.room_id.as_deref() else {
            return Ok(());
        };
        out.unsubscribe_user(&user.id, room);
        self.depart(tx, out, user, room, Departure::Left).await
    }

    /// Clear membership and settle the room: destroy it when empty, hand the
    /// host flag on when needed, announce the departure otherwise.
    pub(crate) async fn depart(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        user: &UserRow,
        room: &str,
        reason: Departure,
    ) -> CoreResult<()> {
        users::clear_room(tx, &user.id).await?;
        let remaining = users::members(tx, room).await?;

        if remaining.is_empty() {
            rooms::delete(tx, room).await?;
            out.drop_room(room);
            out.release_room(room);
            info!(room = %room, "Room destroyed");
            return Ok(());
        }

        let now = self.now_millis();
        let left = messages::insert(tx, &NewMessage::system(room, &reason.announcement(&user.name), now)).await?;
        out.new_message(left.into_record());

        if !remaining.iter().any(|member| member.is_host) {
            let heir = &remaining[0];
            users::promote(tx, &heir.id).await?;
            let promoted = messages::insert(
                tx,
                &NewMessage::system(room, &format!("{} is now the Host.", heir.name), now),
            )
            .await?;
            out.new_message(promoted.into_record());
            info!(room = %room, host = %heir.id, "Host transferred");
        }

        out.resync(room);
        debug!(user = %user.id, room = %room, reason = ?reason, "Left room");
        Ok(())
    }

    /// Remove `target_id` from the room it shares with `actor_id`.
    pub(crate) async fn kick(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        actor_id: &str,
        target_id: &str,
    ) -> CoreResult<()> {
        if actor_id == target_id {
            return Err(CoreError::Validation("You cannot kick yourself.".to_string()));
        }
        let actor = load_user(tx, actor_id).await?;
        let target = load_user(tx, target_id).await?;
        let room = actor.room_id.clone().ok_or_else(CoreError::not_in_room)?;

        if !target.is_in(&room) {
            return Err(CoreError::NotFound(format!("{} is not in this room.", target.name)));
        }
        if target.is_host && !actor.is_host {
            return Err(CoreError::Forbidden("You cannot kick the Host.".to_string()));
        }

        out.to_user(
            target_id,
            Event::UserKicked {
                user_id: target_id.to_string(),
                room_id: room.clone(),
            },
        );
        out.unsubscribe_user(target_id, &room);
        self.depart(tx, out, &target, &room, Departure::Kicked { by: actor.name })
            .await
    }

    /// Ask a paired device to join the host's room.
    pub(crate) async fn invite(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        host_id: &str,
        token: &str,
    ) -> CoreResult<()> {
        let token: Token = token
            .parse()
            .map_err(|e: huddle_protocol::TokenError| CoreError::Validation(e.to_string()))?;
        let target = token
            .as_pairing()
            .ok_or_else(|| CoreError::Validation("Expected a pairing token.".to_string()))?;

        let host = load_user(tx, host_id).await?;
        let room = host.room_id.clone().ok_or_else(CoreError::not_in_room)?;
        if !host.is_host {
            return Err(CoreError::host_only());
        }
        if !self.hub.is_user_connected(target) {
            return Err(CoreError::NotFound("The paired device is not connected.".to_string()));
        }

        out.to_user(
            target,
            Event::ForceJoinRoom {
                target_user_id: target.to_string(),
                room_id: room.clone(),
            },
        );
        debug!(host = %host_id, target = %target, room = %room, "Invite sent");
        Ok(())
    }

    /// Bind a connection to a user and bring it up to date.
    pub(crate) async fn identify_connection(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        conn: ConnId,
        user_id: &str,
    ) -> CoreResult<()> {
        let user = load_user(tx, user_id).await?;
        // The connection may still follow the room of its previous user.
        if user.room_id.is_none() {
            out.unsubscribe(conn);
        }
        out.bind(conn, user_id);
        out.to_conn(conn, Event::UserUpdated { user: user.to_record() });
        if let Some(room) = &user.room_id {
            out.subscribe(conn, room);
            out.resync_conn(conn, room);
        }
        Ok(())
    }
}

/// Accept a bare room id or a `join_room:` token.
fn room_from_input(input: &str) -> String {
    match input.parse::<Token>() {
        Ok(token) => token.as_room().unwrap_or(input).to_string(),
        Err(_) => input.to_string(),
    }
}
