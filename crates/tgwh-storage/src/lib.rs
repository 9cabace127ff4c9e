//! Local stores (message shards, images) and the gateway HTTP client.

use std::path::Path;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod http;
pub mod images;
pub mod shard;

pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RequestPacer, RetryPolicy};
pub use images::{ImageRef, ImageStore, StoredImage};
pub use shard::{MergeOutcome, ShardStore};

pub const CRATE_NAME: &str = "tgwh-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Replace `path` with `bytes` via a hidden sibling temp file and a rename.
/// A crash mid-write leaves the previous content in place.
pub(crate) async fn write_file_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let staging = dir.join(format!(".{}.tmp", Uuid::new_v4().simple()));
    let written = async {
        let mut file = fs::File::create(&staging).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&staging, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&staging).await;
        return Err(err).with_context(|| format!("writing {}", path.display()));
    }
    Ok(())
}
