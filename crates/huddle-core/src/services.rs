//! External collaborators consumed by the engine.

use async_trait::async_trait;
use huddle_protocol::LinkPreview;
use std::io;
use std::sync::Mutex;

/// A payload persisted by a [`FileStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Public URL of the payload.
    pub url: String,
    /// Size in bytes.
    pub size: u64,
    /// Public URL of a thumbnail, when one could be produced.
    pub thumbnail: Option<String>,
}

impl StoredFile {
    /// Every URL owned by this payload.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        std::iter::once(self.url.clone())
            .chain(self.thumbnail.clone())
            .collect()
    }
}

/// Raw file storage.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Persist `bytes` for a room.
    async fn save(&self, room_id: &str, file_name: &str, bytes: &[u8]) -> io::Result<StoredFile>;

    /// Remove one payload by its public URL. Missing payloads are not an error.
    async fn remove(&self, url: &str) -> io::Result<()>;

    /// Remove everything stored for a room.
    async fn release_room(&self, room_id: &str) -> io::Result<()>;
}

/// Outbound link preview fetching.
#[async_trait]
pub trait LinkPreviewer: Send + Sync {
    /// Fetch a preview. Any failure yields `None`.
    async fn preview(&self, url: &str) -> Option<LinkPreview>;
}

/// A previewer that never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPreviews;

#[async_trait]
impl LinkPreviewer for NoPreviews {
    async fn preview(&self, _url: &str) -> Option<LinkPreview> {
        None
    }
}

/// In-memory file store that records what happened to each payload.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    state: Mutex<MemoryFiles>,
}

#[derive(Debug, Default)]
struct MemoryFiles {
    stored: Vec<String>,
    removed: Vec<String>,
    released: Vec<String>,
}

impl MemoryFileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// URLs currently stored.
    #[must_use]
    pub fn stored(&self) -> Vec<String> {
        self.lock().stored.clone()
    }

    /// URLs removed so far, in order.
    #[must_use]
    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    /// Rooms released so far, in order.
    #[must_use]
    pub fn released(&self) -> Vec<String> {
        self.lock().released.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryFiles> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn save(&self, room_id: &str, file_name: &str, bytes: &[u8]) -> io::Result<StoredFile> {
        let url = format!("/uploads/{room_id}/{file_name}");
        self.lock().stored.push(url.clone());
        Ok(StoredFile {
            url,
            size: bytes.len() as u64,
            thumbnail: None,
        })
    }

    async fn remove(&self, url: &str) -> io::Result<()> {
        let mut state = self.lock();
        state.stored.retain(|u| u != url);
        state.removed.push(url.to_string());
        Ok(())
    }

    async fn release_room(&self, room_id: &str) -> io::Result<()> {
        let prefix = format!("/uploads/{room_id}/");
        let mut state = self.lock();
        state.stored.retain(|u| !u.starts_with(&prefix));
        state.released.push(room_id.to_string());
        Ok(())
    }
}
