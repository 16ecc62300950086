use crate::clock::from_millis;
use huddle_protocol::{LinkPreview, MessageId, MessageKind, MessageRecord, SYSTEM_USER_ID};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};

/// A row of the messages table joined with its author's name.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct MessageRow {
    pub id: MessageId,
    pub room_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub kind: String,
    pub content: String,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub file_thumbnail: Option<String>,
    pub url_metadata: Option<String>,
    pub is_pinned: bool,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
}

impl MessageRow {
    #[must_use]
    pub fn into_record(self) -> MessageRecord {
        let kind = MessageKind::try_from(self.kind.as_str()).unwrap_or(MessageKind::Text);
        let url_metadata = self
            .url_metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str::<LinkPreview>(raw).ok());

        MessageRecord {
            id: self.id,
            room_id: self.room_id,
            user_id: self.user_id,
            user_name: self.user_name,
            kind,
            content: self.content,
            file_name: self.file_name,
            file_size: self.file_size,
            file_thumbnail: self.file_thumbnail,
            url_metadata,
            is_pinned: self.is_pinned,
            deleted_at: self.deleted_at.map(from_millis),
            created_at: from_millis(self.created_at),
            client_id: None,
        }
    }

    /// Stored file URLs this row references (the file and its thumbnail).
    #[must_use]
    pub fn payload_urls(&self) -> Vec<String> {
        if self.kind != MessageKind::File.as_str() {
            return Vec::new();
        }
        std::iter::once(self.content.clone())
            .chain(self.file_thumbnail.clone())
            .collect()
    }
}

/// A message about to be inserted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: String,
    pub user_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub file_thumbnail: Option<String>,
    pub url_metadata: Option<LinkPreview>,
    pub created_at: i64,
}

impl NewMessage {
    pub fn text(room_id: &str, user_id: &str, content: &str, created_at: i64) -> Self {
        Self {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            kind: MessageKind::Text,
            content: content.to_string(),
            file_name: None,
            file_size: None,
            file_thumbnail: None,
            url_metadata: None,
            created_at,
        }
    }

    pub fn system(room_id: &str, content: &str, created_at: i64) -> Self {
        Self {
            kind: MessageKind::System,
            ..Self::text(room_id, SYSTEM_USER_ID, content, created_at)
        }
    }
}

const SELECT: &str = "SELECT m.id, m.room_id, m.user_id, u.name AS user_name, m.kind, m.content, \
     m.file_name, m.file_size, m.file_thumbnail, m.url_metadata, m.is_pinned, m.deleted_at, \
     m.created_at FROM messages m LEFT JOIN users u ON u.id = m.user_id";

pub async fn insert(conn: &mut SqliteConnection, new: &NewMessage) -> Result<MessageRow, sqlx::Error> {
    let url_metadata = new
        .url_metadata
        .as_ref()
        .filter(|preview| !preview.is_empty())
        .and_then(|preview| serde_json::to_string(preview).ok());

    let result = sqlx::query(
        "INSERT INTO messages \
         (room_id, user_id, kind, content, file_name, file_size, file_thumbnail, url_metadata, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&new.room_id)
    .bind(&new.user_id)
    .bind(new.kind.as_str())
    .bind(&new.content)
    .bind(&new.file_name)
    .bind(new.file_size)
    .bind(&new.file_thumbnail)
    .bind(url_metadata)
    .bind(new.created_at)
    .execute(&mut *conn)
    .await?;

    let id = result.last_insert_rowid();
    find(conn, id).await?.ok_or(sqlx::Error::RowNotFound)
}

pub async fn find(conn: &mut SqliteConnection, id: MessageId) -> Result<Option<MessageRow>, sqlx::Error> {
    sqlx::query_as(&format!("{SELECT} WHERE m.id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
}

/// The most recent `limit` messages of a room, oldest first.
pub async fn latest(
    conn: &mut SqliteConnection,
    room_id: &str,
    limit: u32,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    let mut rows: Vec<MessageRow> = sqlx::query_as(&format!(
        "{SELECT} WHERE m.room_id = ? ORDER BY m.created_at DESC, m.id DESC LIMIT ?"
    ))
    .bind(room_id)
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await?;
    rows.reverse();
    Ok(rows)
}

/// Up to `limit` messages strictly older than `(created_at, id)`, oldest first.
pub async fn before(
    conn: &mut SqliteConnection,
    room_id: &str,
    created_at: i64,
    id: MessageId,
    limit: u32,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    let mut rows: Vec<MessageRow> = sqlx::query_as(&format!(
        "{SELECT} WHERE m.room_id = ? \
         AND (m.created_at < ? OR (m.created_at = ? AND m.id < ?)) \
         ORDER BY m.created_at DESC, m.id DESC LIMIT ?"
    ))
    .bind(room_id)
    .bind(created_at)
    .bind(created_at)
    .bind(id)
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await?;
    rows.reverse();
    Ok(rows)
}

/// Every pinned message of a room, oldest first.
pub async fn pinned(conn: &mut SqliteConnection, room_id: &str) -> Result<Vec<MessageRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        "{SELECT} WHERE m.room_id = ? AND m.is_pinned = 1 ORDER BY m.created_at ASC, m.id ASC"
    ))
    .bind(room_id)
    .fetch_all(&mut *conn)
    .await
}

pub async fn set_pinned(conn: &mut SqliteConnection, id: MessageId, pinned: bool) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE messages SET is_pinned = ? WHERE id = ?")
        .bind(pinned)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Rows among `ids` that belong to `room_id`.
pub async fn find_in_room(
    conn: &mut SqliteConnection,
    room_id: &str,
    ids: &[MessageId],
) -> Result<Vec<MessageRow>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut query = QueryBuilder::<Sqlite>::new(SELECT);
    query.push(" WHERE m.room_id = ");
    query.push_bind(room_id.to_string());
    push_id_list(&mut query, "m.id", ids);
    query.push(" ORDER BY m.id ASC");
    query.build_query_as().fetch_all(&mut *conn).await
}

/// Hard-delete `ids` within a room. Returns the ids actually removed.
pub async fn delete_in_room(
    conn: &mut SqliteConnection,
    room_id: &str,
    ids: &[MessageId],
) -> Result<Vec<MessageId>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM messages WHERE room_id = ");
    query.push_bind(room_id.to_string());
    push_id_list(&mut query, "id", ids);
    query.push(" RETURNING id");
    returned_ids(query, conn).await
}

/// Soft-delete `ids` within a room. Already deleted rows keep their
/// original timestamp and are not reported.
pub async fn soft_delete(
    conn: &mut SqliteConnection,
    room_id: &str,
    ids: &[MessageId],
    at: i64,
) -> Result<Vec<MessageId>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut query = QueryBuilder::<Sqlite>::new("UPDATE messages SET deleted_at = ");
    query.push_bind(at);
    query.push(" WHERE deleted_at IS NULL AND room_id = ");
    query.push_bind(room_id.to_string());
    push_id_list(&mut query, "id", ids);
    query.push(" RETURNING id");
    returned_ids(query, conn).await
}

/// Clear the deletion mark on `ids` within a room.
pub async fn restore(
    conn: &mut SqliteConnection,
    room_id: &str,
    ids: &[MessageId],
) -> Result<Vec<MessageId>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut query = QueryBuilder::<Sqlite>::new(
        "UPDATE messages SET deleted_at = NULL WHERE deleted_at IS NOT NULL AND room_id = ",
    );
    query.push_bind(room_id.to_string());
    push_id_list(&mut query, "id", ids);
    query.push(" RETURNING id");
    returned_ids(query, conn).await
}

/// Clear every deletion mark in a room.
pub async fn restore_all(conn: &mut SqliteConnection, room_id: &str) -> Result<Vec<MessageId>, sqlx::Error> {
    let rows: Vec<(MessageId,)> = sqlx::query_as(
        "UPDATE messages SET deleted_at = NULL \
         WHERE deleted_at IS NOT NULL AND room_id = ? RETURNING id",
    )
    .bind(room_id)
    .fetch_all(&mut *conn)
    .await?;
    let mut ids: Vec<MessageId> = rows.into_iter().map(|(id,)| id).collect();
    ids.sort_unstable();
    Ok(ids)
}

/// Soft-deleted rows whose deletion mark is older than `cutoff`.
pub async fn expired(conn: &mut SqliteConnection, cutoff: i64) -> Result<Vec<MessageRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        "{SELECT} WHERE m.deleted_at IS NOT NULL AND m.deleted_at < ? ORDER BY m.id ASC"
    ))
    .bind(cutoff)
    .fetch_all(&mut *conn)
    .await
}

/// Delete one row if it is still soft-deleted past `cutoff`.
pub async fn delete_if_expired(
    conn: &mut SqliteConnection,
    id: MessageId,
    cutoff: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM messages WHERE id = ? AND deleted_at IS NOT NULL AND deleted_at < ?",
    )
    .bind(id)
    .bind(cutoff)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn push_id_list(query: &mut QueryBuilder<'_, Sqlite>, column: &str, ids: &[MessageId]) {
    query.push(format!(" AND {column} IN ("));
    let mut list = query.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
    list.push_unseparated(")");
}

async fn returned_ids(
    mut query: QueryBuilder<'_, Sqlite>,
    conn: &mut SqliteConnection,
) -> Result<Vec<MessageId>, sqlx::Error> {
    let rows: Vec<(MessageId,)> = query.build_query_as().fetch_all(&mut *conn).await?;
    let mut ids: Vec<MessageId> = rows.into_iter().map(|(id,)| id).collect();
    ids.sort_unstable();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{rooms, users, Store};

    async fn seeded() -> (Store, sqlx::pool::PoolConnection<Sqlite>) {
        let store = Store::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        rooms::insert(&mut conn, "room-1", 0).await.unwrap();
        rooms::insert(&mut conn, "room-2", 0).await.unwrap();
        users::insert(&mut conn, "u1", "Alice", 0).await.unwrap();
        (store, conn)
    }

    #[tokio::test]
    async fn test_insert_resolves_author_name() {
        let (_store, mut conn) = seeded().await;

        let mut new = NewMessage::text("room-1", "u1", "hello", 100);
        new.url_metadata = Some(LinkPreview {
            title: "Example".into(),
            image: String::new(),
        });
        let row = insert(&mut conn, &new).await.unwrap();
        let record = row.into_record();

        assert_eq!(record.user_name.as_deref(), Some("Alice"));
        assert_eq!(record.kind, MessageKind::Text);
        assert_eq!(record.url_metadata.unwrap().title, "Example");
        assert_eq!(record.created_at.timestamp_millis(), 100);
    }

    #[tokio::test]
    async fn test_pages_break_ties_by_id() {
        let (_store, mut conn) = seeded().await;

        let mut ids = Vec::new();
        for ts in [10, 20, 20, 20, 30] {
            let row = insert(&mut conn, &NewMessage::text("room-1", "u1", "m", ts))
                .await
                .unwrap();
            ids.push(row.id);
        }
        insert(&mut conn, &NewMessage::text("room-2", "u1", "other", 25))
            .await
            .unwrap();

        let latest_ids: Vec<_> = latest(&mut conn, "room-1", 3).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(latest_ids, ids[2..].to_vec());

        let older: Vec<_> = before(&mut conn, "room-1", 20, ids[2], 10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(older, vec![ids[0], ids[1]]);
    }

    #[tokio::test]
    async fn test_soft_delete_reports_only_new_marks() {
        let (_store, mut conn) = seeded().await;
        let a = insert(&mut conn, &NewMessage::text("room-1", "u1", "a", 1)).await.unwrap().id;
        let b = insert(&mut conn, &NewMessage::text("room-1", "u1", "b", 2)).await.unwrap().id;
        let foreign = insert(&mut conn, &NewMessage::text("room-2", "u1", "c", 3)).await.unwrap().id;

        assert_eq!(soft_delete(&mut conn, "room-1", &[a], 50).await.unwrap(), vec![a]);
        assert_eq!(
            soft_delete(&mut conn, "room-1", &[a, b, foreign], 60).await.unwrap(),
            vec![b]
        );

        let first = find(&mut conn, a).await.unwrap().unwrap();
        assert_eq!(first.deleted_at, Some(50));
        assert!(find(&mut conn, foreign).await.unwrap().unwrap().deleted_at.is_none());

        assert_eq!(restore(&mut conn, "room-1", &[a]).await.unwrap(), vec![a]);
        assert_eq!(restore_all(&mut conn, "room-1").await.unwrap(), vec![b]);
        assert!(restore_all(&mut conn, "room-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_guarded_delete() {
        let (_store, mut conn) = seeded().await;
        let old = insert(&mut conn, &NewMessage::text("room-1", "u1", "old", 1)).await.unwrap().id;
        let fresh = insert(&mut conn, &NewMessage::text("room-1", "u1", "new", 2)).await.unwrap().id;
        soft_delete(&mut conn, "room-1", &[old], 10).await.unwrap();
        soft_delete(&mut conn, "room-1", &[fresh], 500).await.unwrap();

        let candidates = expired(&mut conn, 100).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, old);

        restore(&mut conn, "room-1", &[old]).await.unwrap();
        assert!(!delete_if_expired(&mut conn, old, 100).await.unwrap());
        assert!(find(&mut conn, old).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_payload_urls_only_for_files() {
        let (_store, mut conn) = seeded().await;
        let mut file = NewMessage::text("room-1", "u1", "/uploads/room-1/a.png", 1);
        file.kind = MessageKind::File;
        file.file_name = Some("a.png".into());
        file.file_thumbnail = Some("/uploads/room-1/thumb-a.png".into());
        let file = insert(&mut conn, &file).await.unwrap();
        let text = insert(&mut conn, &NewMessage::text("room-1", "u1", "/uploads/x", 2)).await.unwrap();

        assert_eq!(file.payload_urls().len(), 2);
        assert!(text.payload_urls().is_empty());
    }
}
