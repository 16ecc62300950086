//! Table definitions.

/// Statements applied in order on every start. All are idempotent.
pub(crate) const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS rooms (
        id          TEXT PRIMARY KEY,
        created_at  INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        room_id     TEXT REFERENCES rooms (id) ON DELETE SET NULL,
        is_host     INTEGER NOT NULL DEFAULT 0,
        joined_at   INTEGER,
        created_at  INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        room_id         TEXT NOT NULL REFERENCES rooms (id) ON DELETE CASCADE,
        user_id         TEXT NOT NULL REFERENCES users (id),
        kind            TEXT NOT NULL CHECK (kind IN ('text', 'file', 'system')),
        content         TEXT NOT NULL,
        file_name       TEXT,
        file_size       INTEGER,
        file_thumbnail  TEXT,
        url_metadata    TEXT,
        is_pinned       INTEGER NOT NULL DEFAULT 0,
        deleted_at      INTEGER,
        created_at      INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_users_room ON users (room_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_room_order ON messages (room_id, created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_room_pinned ON messages (room_id, is_pinned)",
    "CREATE INDEX IF NOT EXISTS idx_messages_deleted ON messages (deleted_at)",
    "INSERT OR IGNORE INTO users (id, name, created_at) VALUES ('system', 'System', 0)",
];
