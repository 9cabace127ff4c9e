//! Image content store: one file per (channel, message) at a deterministic path.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;
use tracing::warn;

use crate::{sha256_hex, write_file_atomically};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub path: PathBuf,
    pub content_hash: Option<String>,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// An image found in the store, with its identity recovered from the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub channel_name: String,
    pub message_id: i64,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_path(&self, channel_name: &str, message_id: i64) -> PathBuf {
        self.root
            .join(channel_name)
            .join(format!("{message_id}.jpg"))
    }

    pub async fn contains(&self, channel_name: &str, message_id: i64) -> anyhow::Result<bool> {
        let path = self.image_path(channel_name, message_id);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking image path {}", path.display()))
    }

    /// Download-once write: when a file already exists for this message the
    /// bytes are not produced at all and the existing path is returned.
    pub async fn store_with<F, Fut, E>(
        &self,
        channel_name: &str,
        message_id: i64,
        fetch: F,
    ) -> anyhow::Result<StoredImage>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>, E>>,
        E: Into<anyhow::Error>,
    {
        let path = self.image_path(channel_name, message_id);
        if self.contains(channel_name, message_id).await? {
            return Ok(StoredImage {
                path,
                content_hash: None,
                byte_size: 0,
                deduplicated: true,
            });
        }

        let bytes = match fetch().await {
            Ok(bytes) => bytes,
            Err(err) => {
                let err: anyhow::Error = err.into();
                return Err(err.context(format!(
                    "downloading image for {channel_name}/{message_id}"
                )));
            }
        };
        write_file_atomically(&path, &bytes).await?;
        Ok(StoredImage {
            path,
            content_hash: Some(sha256_hex(&bytes)),
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }

    /// Every image under `{root}/{channel}/{message_id}.{ext}`, sorted by
    /// channel then message id. Files that do not fit the layout are skipped.
    pub async fn list(&self) -> anyhow::Result<Vec<ImageRef>> {
        let mut images = Vec::new();
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking {}", self.root.display()))?
        {
            return Ok(images);
        }

        let mut channels = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading {}", self.root.display()))?;
        while let Some(channel_entry) = channels.next_entry().await? {
            if !channel_entry.file_type().await?.is_dir() {
                continue;
            }
            let channel_name = channel_entry.file_name().to_string_lossy().to_string();
            let mut files = fs::read_dir(channel_entry.path())
                .await
                .with_context(|| format!("reading {}", channel_entry.path().display()))?;
            while let Some(file_entry) = files.next_entry().await? {
                let path = file_entry.path();
                match parse_image_file_name(&path) {
                    Some(message_id) => images.push(ImageRef {
                        channel_name: channel_name.clone(),
                        message_id,
                        path,
                    }),
                    None if is_temp_file(&path) => {}
                    None => warn!(path = %path.display(), "skipping file outside image layout"),
                }
            }
        }

        images.sort_by(|a, b| {
            (a.channel_name.as_str(), a.message_id).cmp(&(b.channel_name.as_str(), b.message_id))
        });
        Ok(images)
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

fn parse_image_file_name(path: &Path) -> Option<i64> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    path.file_stem()?.to_str()?.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[tokio::test]
    async fn second_store_skips_download() {
        let dir = tempdir().expect("tempdir");
        let store = ImageStore::new(dir.path());
        let calls = AtomicUsize::new(0);

        let first = store
            .store_with("tikvahpharma", 101, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(b"jpeg-bytes".to_vec())
            })
            .await
            .expect("first store");
        let second = store
            .store_with("tikvahpharma", 101, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(b"other-bytes".to_vec())
            })
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert_eq!(first.content_hash.as_deref(), Some(sha256_hex(b"jpeg-bytes").as_str()));
        assert_eq!(first.byte_size, 10);
        assert!(second.deduplicated);
        assert_eq!(second.content_hash, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.path, second.path);
        assert_eq!(first.path, dir.path().join("tikvahpharma").join("101.jpg"));
        assert_eq!(std::fs::read(&first.path).expect("read"), b"jpeg-bytes");
    }

    #[tokio::test]
    async fn failed_download_leaves_no_file() {
        let dir = tempdir().expect("tempdir");
        let store = ImageStore::new(dir.path());

        let result = store
            .store_with("CheMed123", 5, || async {
                Err::<Vec<u8>, _>(std::io::Error::other("connection reset"))
            })
            .await;

        assert!(result.is_err());
        assert!(!store.contains("CheMed123", 5).await.expect("contains"));
    }

    #[tokio::test]
    async fn list_recovers_identity_from_layout() {
        let dir = tempdir().expect("tempdir");
        let store = ImageStore::new(dir.path());
        for (channel, id) in [("b_channel", 3), ("a_channel", 20), ("a_channel", 4)] {
            let path = store.image_path(channel, id);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"x").unwrap();
        }
        std::fs::write(dir.path().join("a_channel").join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("a_channel").join("cover.png"), b"x").unwrap();

        let images = store.list().await.expect("list");
        let ids: Vec<_> = images
            .iter()
            .map(|i| (i.channel_name.as_str(), i.message_id))
            .collect();
        assert_eq!(ids, vec![("a_channel", 4), ("a_channel", 20), ("b_channel", 3)]);
    }

    #[tokio::test]
    async fn list_of_missing_root_is_empty() {
        let dir = tempdir().expect("tempdir");
        let store = ImageStore::new(dir.path().join("never-created"));
        assert!(store.list().await.expect("list").is_empty());
    }
}
