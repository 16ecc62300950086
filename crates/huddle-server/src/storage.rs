//! Upload storage on the local filesystem.
//!
//! Every room owns one directory under the upload root, so destroying a room
//! removes its payloads in one step. Images get a WebP thumbnail stored next
//! to them.

use async_trait::async_trait;
use huddle_core::{FileStore, StoredFile};
use image::{DynamicImage, ImageFormat};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_NAME_LEN: usize = 100;

/// Width of generated thumbnails. Smaller images keep their size.
pub const THUMBNAIL_WIDTH: u32 = 400;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// [`FileStore`] writing under a root directory and served under a URL prefix.
#[derive(Debug, Clone)]
pub struct DiskFileStore {
    root: PathBuf,
    public_prefix: String,
}

impl DiskFileStore {
    /// Create a store rooted at `root`, served under `public_prefix`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_prefix: public_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    fn room_dir(&self, room_id: &str) -> io::Result<PathBuf> {
        if room_id.is_empty()
            || !room_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid room id {room_id:?}"),
            ));
        }
        Ok(self.root.join(room_id))
    }

    /// Map a public URL back to a path inside the root.
    fn path_for(&self, url: &str) -> Option<PathBuf> {
        let relative = url.strip_prefix(&self.public_prefix)?.trim_start_matches('/');
        let relative = Path::new(relative);
        let contained = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        (contained && relative.components().count() == 2).then(|| self.root.join(relative))
    }

    /// Render `thumb_<stored>.webp` beside an image upload.
    ///
    /// Returns the thumbnail's file name, or `None` if the upload is not an
    /// image or cannot be rendered.
    async fn thumbnail(&self, dir: &Path, stored_name: &str, bytes: &[u8]) -> Option<String> {
        if !is_image(stored_name) {
            return None;
        }
        let name = format!("thumb_{stored_name}.webp");
        let target = dir.join(&name);
        let bytes = bytes.to_vec();

        let rendered = tokio::task::spawn_blocking(move || render_thumbnail(&bytes, &target)).await;
        match rendered {
            Ok(Ok(())) => Some(name),
            Ok(Err(e)) => {
                debug!(file = %stored_name, error = %e, "No thumbnail");
                None
            }
            Err(e) => {
                warn!(file = %stored_name, error = %e, "Thumbnail task failed");
                None
            }
        }
    }
}

fn is_image(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|i| ext.eq_ignore_ascii_case(i)))
}

fn render_thumbnail(bytes: &[u8], target: &Path) -> image::ImageResult<()> {
    let img = image::load_from_memory(bytes)?;
    let img = if img.width() > THUMBNAIL_WIDTH {
        img.thumbnail(THUMBNAIL_WIDTH, u32::MAX)
    } else {
        img
    };
    // The WebP encoder takes 8-bit RGBA.
    let img = DynamicImage::ImageRgba8(img.to_rgba8());
    let result = img.save_with_format(target, ImageFormat::WebP);
    if result.is_err() {
        let _ = std::fs::remove_file(target);
    }
    result
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn save(&self, room_id: &str, file_name: &str, bytes: &[u8]) -> io::Result<StoredFile> {
        let dir = self.room_dir(room_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let stored_name = format!(
            "{}-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            Uuid::new_v4().simple(),
            sanitize_file_name(file_name)
        );
        tokio::fs::write(dir.join(&stored_name), bytes).await?;
        debug!(room = %room_id, file = %stored_name, size = bytes.len(), "Upload stored");

        let thumbnail = self
            .thumbnail(&dir, &stored_name, bytes)
            .await
            .map(|name| format!("{}/{}/{}", self.public_prefix, room_id, name));

        Ok(StoredFile {
            url: format!("{}/{}/{}", self.public_prefix, room_id, stored_name),
            size: bytes.len() as u64,
            thumbnail,
        })
    }

    async fn remove(&self, url: &str) -> io::Result<()> {
        let Some(path) = self.path_for(url) else {
            debug!(url = %url, "Not a stored upload");
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    async fn release_room(&self, room_id: &str) -> io::Result<()> {
        let dir = self.room_dir(room_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Reduce a client file name to a safe single path segment.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    let mut cleaned: String = cleaned.chars().rev().take(MAX_NAME_LEN).collect();
    cleaned = cleaned.chars().rev().collect();

    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}
