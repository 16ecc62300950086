//! Message creation, pinning, deletion, restoration, paging and expiry.

use crate::broadcast::Outbox;
use crate::engine::{load_user, Engine, FileArrival, SweepReport};
use crate::error::{CoreError, CoreResult};
use crate::hub::ConnId;
use crate::store::{messages, millis, users, NewMessage};
use chrono::{DateTime, Utc};
use huddle_protocol::{Event, LinkPreview, MessageId, MessageKind, MessageRecord};
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl Engine {
    pub(crate) async fn send_message(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        user_id: &str,
        content: &str,
        preview: Option<LinkPreview>,
    ) -> CoreResult<()> {
        let user = load_user(tx, user_id).await?;
        let Some(room) = user.room_id else {
            debug!(user = %user_id, "Message from user without a room ignored");
            return Ok(());
        };
        if content.trim().is_empty() {
            return Err(CoreError::Validation("Message content is empty.".to_string()));
        }

        let mut new = NewMessage::text(&room, user_id, content, self.now_millis());
        new.url_metadata = preview.filter(|p| !p.is_empty());
        let row = messages::insert(tx, &new).await?;

        out.new_message(row.into_record());
        Ok(())
    }

    pub(crate) async fn ensure_member(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
        room_id: &str,
    ) -> CoreResult<()> {
        let member = users::find(conn, user_id)
            .await?
            .is_some_and(|user| user.is_in(room_id));
        if member {
            Ok(())
        } else {
            Err(CoreError::Forbidden(
                "You are not a member of this room.".to_string(),
            ))
        }
    }

    pub(crate) async fn file_arrived(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        arrival: FileArrival,
    ) -> CoreResult<MessageRecord> {
        self.ensure_member(tx, &arrival.user_id, &arrival.room_id).await?;

        let new = NewMessage {
            kind: MessageKind::File,
            file_name: Some(arrival.file_name),
            file_size: Some(i64::try_from(arrival.file.size).unwrap_or(i64::MAX)),
            file_thumbnail: arrival.file.thumbnail,
            ..NewMessage::text(
                &arrival.room_id,
                &arrival.user_id,
                &arrival.file.url,
                self.now_millis(),
            )
        };
        let mut record = messages::insert(tx, &new).await?.into_record();
        record.client_id = arrival.client_id;

        out.new_message(record.clone());
        debug!(room = %record.room_id, message = record.id, "File message recorded");
        Ok(record)
    }

    pub(crate) async fn toggle_pin(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        user_id: &str,
        message_id: MessageId,
    ) -> CoreResult<()> {
        let user = load_user(tx, user_id).await?;
        let room = user.room_id.ok_or_else(CoreError::not_in_room)?;
        let message = messages::find(tx, message_id)
            .await?
            .ok_or_else(CoreError::message_not_found)?;
        if message.room_id != room {
            return Err(CoreError::Forbidden(
                "That message belongs to another room.".to_string(),
            ));
        }

        messages::set_pinned(tx, message_id, !message.is_pinned).await?;
        let message = messages::find(tx, message_id)
            .await?
            .ok_or_else(CoreError::message_not_found)?
            .into_record();
        let pinned_messages = messages::pinned(tx, &room)
            .await?
            .into_iter()
            .map(messages::MessageRow::into_record)
            .collect();

        out.to_room(
            &room,
            Event::MessageUpdated {
                message,
                pinned_messages,
            },
        );
        Ok(())
    }

    /// The host deletes for good; everyone else only hides.
    pub(crate) async fn delete_messages(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        user_id: &str,
        message_ids: &[MessageId],
    ) -> CoreResult<()> {
        let ids = selection(message_ids)?;
        let user = load_user(tx, user_id).await?;
        let room = user.room_id.clone().ok_or_else(CoreError::not_in_room)?;

        if user.is_host {
            let rows = messages::find_in_room(tx, &room, &ids).await?;
            let removed = messages::delete_in_room(tx, &room, &ids).await?;
            if removed.is_empty() {
                return Ok(());
            }
            let payloads = rows
                .iter()
                .filter(|row| removed.contains(&row.id))
                .flat_map(messages::MessageRow::payload_urls)
                .collect();
            out.to_room(
                &room,
                Event::MessagesHardDeleted {
                    message_ids: removed,
                },
            );
            out.remove_payloads(payloads);
        } else {
            let deleted = messages::soft_delete(tx, &room, &ids, self.now_millis()).await?;
            if deleted.is_empty() {
                return Ok(());
            }
            out.to_room(
                &room,
                Event::MessagesDeleted {
                    message_ids: deleted,
                },
            );
        }
        Ok(())
    }

    pub(crate) async fn restore_messages(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        user_id: &str,
        message_ids: &[MessageId],
    ) -> CoreResult<()> {
        let ids = selection(message_ids)?;
        let room = self.hosted_room(tx, user_id).await?;

        let restored = messages::restore(tx, &room, &ids).await?;
        if !restored.is_empty() {
            out.to_room(
                &room,
                Event::MessagesRestored {
                    message_ids: restored,
                },
            );
        }
        Ok(())
    }

    pub(crate) async fn restore_all(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        user_id: &str,
    ) -> CoreResult<()> {
        let room = self.hosted_room(tx, user_id).await?;

        let restored = messages::restore_all(tx, &room).await?;
        if !restored.is_empty() {
            out.to_room(
                &room,
                Event::AllMessagesRestored {
                    message_ids: restored,
                },
            );
        }
        Ok(())
    }

    async fn hosted_room(&self, tx: &mut SqliteConnection, user_id: &str) -> CoreResult<String> {
        let user = load_user(tx, user_id).await?;
        let room = user.room_id.ok_or_else(CoreError::not_in_room)?;
        if !user.is_host {
            return Err(CoreError::host_only());
        }
        Ok(room)
    }

    /// Page backwards from `before_id` for the connection's user.
    pub(crate) async fn load_more(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        conn: ConnId,
        room_id: &str,
        before_id: MessageId,
        limit: Option<u32>,
    ) -> CoreResult<()> {
        let user_id = self.hub.user_of(conn).ok_or_else(CoreError::not_in_room)?;
        let user = load_user(tx, &user_id).await?;
        if !user.is_in(room_id) {
            return Err(CoreError::Forbidden(
                "You are not a member of this room.".to_string(),
            ));
        }

        let messages = self.page(tx, room_id, before_id, limit).await?;
        out.to_conn(
            conn,
            Event::MoreMessagesLoaded {
                room_id: room_id.to_string(),
                messages,
            },
        );
        Ok(())
    }

    /// Messages of a room strictly older than `before_id`, oldest first.
    pub(crate) async fn page(
        &self,
        tx: &mut SqliteConnection,
        room_id: &str,
        before_id: MessageId,
        limit: Option<u32>,
    ) -> CoreResult<Vec<MessageRecord>> {
        let limit = limit
            .unwrap_or(self.config.page_size)
            .min(self.config.max_page_size.max(1));
        if limit == 0 {
            return Ok(Vec::new());
        }

        let Some(reference) = messages::find(tx, before_id)
            .await?
            .filter(|row| row.room_id == room_id)
        else {
            return Ok(Vec::new());
        };

        Ok(messages::before(tx, room_id, reference.created_at, reference.id, limit)
            .await?
            .into_iter()
            .map(messages::MessageRow::into_record)
            .collect())
    }

    /// Permanently remove messages soft-deleted longer than the retention
    /// window. Each row commits on its own.
    pub async fn sweep(&self, now: DateTime<Utc>) -> CoreResult<SweepReport> {
        let cutoff = millis(now - self.config.retention);
        let candidates = {
            let mut conn = self.store.pool().acquire().await?;
            messages::expired(&mut conn, cutoff).await?
        };

        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };
        let mut removed: BTreeMap<String, Vec<MessageId>> = BTreeMap::new();

        for row in candidates {
            match self.sweep_row(row.id, cutoff).await {
                Ok(true) => {
                    report.removed += 1;
                    for url in row.payload_urls() {
                        if let Err(e) = self.files.remove(&url).await {
                            warn!(url = %url, error = %e, "Failed to remove expired payload");
                        }
                    }
                    removed.entry(row.room_id).or_default().push(row.id);
                }
                Ok(false) => debug!(message = row.id, "No longer eligible for expiry"),
                Err(e) => {
                    report.failed += 1;
                    error!(message = row.id, error = %e, "Failed to expire message");
                }
            }
        }

        for (room, message_ids) in removed {
            self.hub
                .send_to_room(&room, Arc::new(Event::MessagesHardDeleted { message_ids }));
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                removed = report.removed,
                failed = report.failed,
                "Sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_row(&self, id: MessageId, cutoff: i64) -> CoreResult<bool> {
        let mut tx = self.store.begin().await?;
        let deleted = messages::delete_if_expired(&mut tx, id, cutoff).await?;
        tx.commit().await?;
        Ok(deleted)
    }
}

/// Validate and deduplicate a message selection.
fn selection(ids: &[MessageId]) -> CoreResult<Vec<MessageId>> {
    if ids.is_empty() {
        return Err(CoreError::Validation("No messages selected.".to_string()));
    }
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}
