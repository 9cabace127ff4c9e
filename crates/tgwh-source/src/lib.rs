//! Message source contracts, source implementations and the channel ingestor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tgwh_storage::FetchError;
use thiserror::Error;

pub mod fixture;
pub mod gateway;
pub mod ingest;

pub use fixture::FixtureSource;
pub use gateway::{GatewayConfig, GatewaySource};
pub use ingest::{ChannelIngestor, ChannelReport, ChannelTarget, IngestSummary};

pub const CRATE_NAME: &str = "tgwh-source";

/// Reference to a downloadable photo attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRef {
    pub file_id: String,
}

/// One message event as delivered by a source, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub id: i64,
    pub posted_at: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub has_media: bool,
    pub photo: Option<PhotoRef>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("channel {0} not found")]
    ChannelNotFound(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type MessageStream<'a> = BoxStream<'a, Result<ChannelMessage, SourceError>>;

/// External history provider.
///
/// `connect` authenticates once per ingestion sweep. `history` is a lazy,
/// finite, newest-first sequence of at most `limit` messages; it is not
/// resumable, so calling it again starts over from the newest message.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn connect(&self) -> Result<(), SourceError>;

    fn history<'a>(&'a self, channel_name: &'a str, limit: usize) -> MessageStream<'a>;

    async fn download_photo(
        &self,
        channel_name: &str,
        photo: &PhotoRef,
    ) -> Result<Vec<u8>, SourceError>;
}

/// Message shape shared by the history gateway and fixture files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: i64,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<WireMedia>,
    #[serde(default)]
    pub views: Option<i64>,
    #[serde(default)]
    pub forwards: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMedia {
    pub kind: String,
    #[serde(default)]
    pub file_id: Option<String>,
}

impl From<WireMessage> for ChannelMessage {
    fn from(wire: WireMessage) -> Self {
        let photo = wire.media.as_ref().and_then(|media| {
            if media.kind == "photo" {
                media.file_id.clone().map(|file_id| PhotoRef { file_id })
            } else {
                None
            }
        });
        Self {
            id: wire.id,
            posted_at: wire.date,
            text: wire.text.filter(|t| !t.is_empty()),
            has_media: wire.media.is_some(),
            photo,
            views: wire.views,
            forwards: wire.forwards,
        }
    }
}

/// `https://t.me/name`, `t.me/name/`, `@name` and `name` all name `name`.
pub fn channel_name_from_handle(handle: &str) -> String {
    let trimmed = handle.trim().trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    last.trim_start_matches('@').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_normalize_to_channel_names() {
        assert_eq!(channel_name_from_handle("https://t.me/Lobelia4Cosmetics"), "Lobelia4Cosmetics");
        assert_eq!(channel_name_from_handle("t.me/tikvahpharma/"), "tikvahpharma");
        assert_eq!(channel_name_from_handle("@CheMed123"), "CheMed123");
        assert_eq!(channel_name_from_handle(" CheMed123 "), "CheMed123");
    }

    #[test]
    fn only_photo_media_yields_a_download() {
        let photo: ChannelMessage = serde_json::from_str::<WireMessage>(
            r#"{"id": 5, "date": "2024-01-14T10:00:00Z", "media": {"kind": "photo", "file_id": "AgAD5"}}"#,
        )
        .expect("parse")
        .into();
        assert!(photo.has_media);
        assert_eq!(photo.photo, Some(PhotoRef { file_id: "AgAD5".into() }));

        let document: ChannelMessage = serde_json::from_str::<WireMessage>(
            r#"{"id": 6, "text": "", "media": {"kind": "document", "file_id": "BQAD"}}"#,
        )
        .expect("parse")
        .into();
        assert!(document.has_media);
        assert!(document.photo.is_none());
        assert!(document.text.is_none());
        assert!(document.posted_at.is_none());
    }
}
