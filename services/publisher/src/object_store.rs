use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Content type of generated card documents
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Keyed blob storage for photos and generated artifacts.
///
/// Callers only ever hold the opaque reference returned by [`ObjectStore::put`];
/// backend-specific addressing stays inside the implementation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` under `key`, replacing any previous object, and return its external reference
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    /// Read an object back by the reference `put` returned
    async fn get(&self, reference: &str) -> Result<Vec<u8>>;

    /// Remove an object by reference
    async fn delete(&self, reference: &str) -> Result<()>;
}

/// Storage key of a card's published document
pub fn artifact_key(slug: &str) -> String {
    format!("cards/{}/index.html", sanitize_path_component(slug))
}

/// Storage key of an uploaded photo's original bytes
pub fn photo_original_key(slug: &str, unit_id: Uuid, extension: &str) -> String {
    format!(
        "cards/{}/photos/{}/original.{}",
        sanitize_path_component(slug),
        unit_id,
        sanitize_path_component(extension)
    )
}

/// Storage key of a normalized photo
pub fn photo_display_key(slug: &str, unit_id: Uuid) -> String {
    format!("cards/{}/photos/{}/display.jpg", sanitize_path_component(slug), unit_id)
}

/// Sanitize a path component to prevent path traversal
pub(crate) fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Map a declared file extension onto a content type
pub(crate) fn content_type_for_extension(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "html" => HTML_CONTENT_TYPE,
        _ => "application/octet-stream",
    }
}

/// Join a public base URL and a key, tolerating a trailing slash on the base
pub(crate) fn join_public_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key)
}

/// Filesystem-backed object store
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    /// Create a store rooted at `root`; references are `{public_base_url}/{key}`
    pub async fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create storage root {}", root.display()))?;

        let public_base_url = public_base_url.into();
        info!(root = %root.display(), public_base_url = %public_base_url, "Local object store initialized");

        Ok(Self {
            root,
            public_base_url,
        })
    }

    fn path_for_key(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Invalid object key: {key}");
        }
        Ok(self.root.join(relative))
    }

    fn key_for_reference<'a>(&self, reference: &'a str) -> Result<&'a str> {
        let base = self.public_base_url.trim_end_matches('/');
        reference
            .strip_prefix(base)
            .and_then(|rest| rest.strip_prefix('/'))
            .with_context(|| format!("Reference {reference} does not belong to this store"))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let path = self.path_for_key(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        // Write then rename so readers never see a partial object
        let tmp_path = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e).with_context(|| format!("Failed to move object into {}", path.display()));
        }

        debug!(key = %key, content_type = %content_type, "Object stored on local filesystem");

        Ok(join_public_url(&self.public_base_url, key))
    }

    async fn get(&self, reference: &str) -> Result<Vec<u8>> {
        let key = self.key_for_reference(reference)?;
        let path = self.path_for_key(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        let key = self.key_for_reference(reference)?;
        let path = self.path_for_key(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_key_is_stable_per_slug() {
        assert_eq!(artifact_key("grandma-jo-550e8400"), "cards/grandma-jo-550e8400/index.html");
        assert_eq!(artifact_key("../etc"), "cards/___etc/index.html");
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("card-001"), "card-001");
        assert_eq!(sanitize_path_component("card/path"), "card_path");
        assert_eq!(sanitize_path_component("ca..rd"), "ca__rd");
        assert_eq!(sanitize_path_component("hello world"), "hello_world");
    }

    #[test]
    fn test_content_type_for_extension() {
        assert_eq!(content_type_for_extension("jpeg"), "image/jpeg");
        assert_eq!(content_type_for_extension("JPG"), "image/jpeg");
        assert_eq!(content_type_for_extension("heic"), "image/heic");
        assert_eq!(content_type_for_extension("unknown"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_local_store_put_get_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "https://cards.example/")
            .await
            .unwrap();

        let reference = store
            .put("cards/abc/index.html", b"<p>one</p>".to_vec(), HTML_CONTENT_TYPE)
            .await
            .unwrap();
        assert_eq!(reference, "https://cards.example/cards/abc/index.html");
        assert_eq!(store.get(&reference).await.unwrap(), b"<p>one</p>");

        // Last write wins at the same key
        let second = store
            .put("cards/abc/index.html", b"<p>two</p>".to_vec(), HTML_CONTENT_TYPE)
            .await
            .unwrap();
        assert_eq!(second, reference);
        assert_eq!(store.get(&reference).await.unwrap(), b"<p>two</p>");

        store.delete(&reference).await.unwrap();
        assert!(store.get(&reference).await.is_err());
        // Deleting twice is fine
        store.delete(&reference).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "file:///objects").await.unwrap();

        assert!(store.put("../escape.html", vec![1], HTML_CONTENT_TYPE).await.is_err());
        assert!(store.put("/abs.html", vec![1], HTML_CONTENT_TYPE).await.is_err());
        assert!(store.get("https://elsewhere/cards/x").await.is_err());
    }
}
