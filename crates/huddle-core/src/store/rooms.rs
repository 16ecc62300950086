use sqlx::SqliteConnection;

pub async fn insert(conn: &mut SqliteConnection, id: &str, created_at: i64) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO rooms (id, created_at) VALUES (?, ?)")
        .bind(id)
        .bind(created_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn exists(conn: &mut SqliteConnection, id: &str) -> Result<bool, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as("SELECT id FROM rooms WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

/// Delete a room. Its messages go with it.
pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM rooms WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{messages, Store};

    #[tokio::test]
    async fn test_delete_cascades_to_messages() {
        let store = Store::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        insert(&mut conn, "room-1", 10).await.unwrap();
        assert!(exists(&mut conn, "room-1").await.unwrap());

        let msg = messages::insert(&mut conn, &messages::NewMessage::system("room-1", "Room created.", 10))
            .await
            .unwrap();

        assert!(delete(&mut conn, "room-1").await.unwrap());
        assert!(!exists(&mut conn, "room-1").await.unwrap());
        assert!(messages::find(&mut conn, msg.id).await.unwrap().is_none());
    }
}
