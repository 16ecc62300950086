use crate::clock::from_millis;
use huddle_protocol::UserRecord;
use sqlx::{FromRow, SqliteConnection};

/// A row of the users table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct UserRow {
    pub id: String,
    pub name: String,
    pub room_id: Option<String>,
    pub is_host: bool,
    pub joined_at: Option<i64>,
    pub created_at: i64,
}

impl UserRow {
    #[must_use]
    pub fn to_record(&self) -> UserRecord {
        UserRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            room_id: self.room_id.clone(),
            is_host: self.is_host,
            joined_at: self.joined_at.map(from_millis),
        }
    }

    /// Whether this user is currently in `room_id`.
    #[must_use]
    pub fn is_in(&self, room_id: &str) -> bool {
        self.room_id.as_deref() == Some(room_id)
    }
}

const SELECT: &str = "SELECT id, name, room_id, is_host, joined_at, created_at FROM users";

pub async fn find(conn: &mut SqliteConnection, id: &str) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as(&format!("{SELECT} WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
}

pub async fn insert(
    conn: &mut SqliteConnection,
    id: &str,
    name: &str,
    created_at: i64,
) -> Result<UserRow, sqlx::Error> {
    sqlx::query("INSERT INTO users (id, name, created_at) VALUES (?, ?, ?)")
        .bind(id)
        .bind(name)
        .bind(created_at)
        .execute(&mut *conn)
        .await?;

    Ok(UserRow {
        id: id.to_string(),
        name: name.to_string(),
        room_id: None,
        is_host: false,
        joined_at: None,
        created_at,
    })
}

pub async fn rename(conn: &mut SqliteConnection, id: &str, name: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE users SET name = ? WHERE id = ?")
        .bind(name)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Place a user in a room. Membership and host flag change together.
pub async fn enter_room(
    conn: &mut SqliteConnection,
    id: &str,
    room_id: &str,
    is_host: bool,
    joined_at: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET room_id = ?, is_host = ?, joined_at = ? WHERE id = ?")
        .bind(room_id)
        .bind(is_host)
        .bind(joined_at)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn clear_room(conn: &mut SqliteConnection, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET room_id = NULL, is_host = 0 WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn promote(conn: &mut SqliteConnection, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET is_host = 1 WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Members of a room by seniority: join time, then id.
pub async fn members(conn: &mut SqliteConnection, room_id: &str) -> Result<Vec<UserRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        "{SELECT} WHERE room_id = ? ORDER BY joined_at ASC, id ASC"
    ))
    .bind(room_id)
    .fetch_all(&mut *conn)
    .await
}
