//! Channel ingestor: source history → image store + merge store.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tgwh_core::{validate_channel_name, MessageRecord};
use tgwh_storage::{ImageStore, ShardStore};
use tracing::{info, info_span, warn, Instrument};

use crate::{channel_name_from_handle, ChannelMessage, ChannelSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub handle: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelReport {
    pub handle: String,
    pub channel_name: String,
    pub messages: usize,
    pub skipped_undated: usize,
    pub images_downloaded: usize,
    pub images_reused: usize,
    pub inserted: usize,
    pub updated: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub source: String,
    pub channels: Vec<ChannelReport>,
}

impl IngestSummary {
    pub fn failed_channels(&self) -> impl Iterator<Item = &ChannelReport> {
        self.channels.iter().filter(|c| c.error.is_some())
    }

    pub fn total_messages(&self) -> usize {
        self.channels.iter().map(|c| c.messages).sum()
    }
}

pub struct ChannelIngestor {
    source: Arc<dyn ChannelSource>,
    images: ImageStore,
    shards: ShardStore,
}

impl ChannelIngestor {
    pub fn new(source: Arc<dyn ChannelSource>, images: ImageStore, shards: ShardStore) -> Self {
        Self {
            source,
            images,
            shards,
        }
    }

    /// Connect once, then sweep the channels one after another. A channel
    /// that fails is reported and skipped; only a failed connect is an error.
    pub async fn run(&self, targets: &[ChannelTarget]) -> Result<IngestSummary> {
        self.source
            .connect()
            .await
            .with_context(|| format!("connecting to {} message source", self.source.kind()))?;
        info!(source = self.source.kind(), channels = targets.len(), "connected to message source");

        let mut summary = IngestSummary {
            source: self.source.kind().to_string(),
            channels: Vec::with_capacity(targets.len()),
        };

        for target in targets {
            let channel_name = channel_name_from_handle(&target.handle);
            let span = info_span!("ingest_channel", channel = %channel_name, limit = target.limit);
            let mut report = ChannelReport {
                handle: target.handle.clone(),
                channel_name: channel_name.clone(),
                ..Default::default()
            };

            if let Err(err) = validate_channel_name(&channel_name) {
                warn!(handle = %target.handle, error = %err, "unusable channel handle; skipping");
                report.error = Some(err.to_string());
                summary.channels.push(report);
                continue;
            }

            match self
                .scrape_channel(&channel_name, target.limit, &mut report)
                .instrument(span)
                .await
            {
                Ok(()) => info!(
                    channel = %channel_name,
                    messages = report.messages,
                    inserted = report.inserted,
                    updated = report.updated,
                    images_downloaded = report.images_downloaded,
                    "channel ingested"
                ),
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(channel = %channel_name, error = %message, "channel failed; continuing sweep");
                    report.error = Some(message);
                }
            }
            summary.channels.push(report);
        }

        Ok(summary)
    }

    async fn scrape_channel(
        &self,
        channel_name: &str,
        limit: usize,
        report: &mut ChannelReport,
    ) -> Result<()> {
        let mut records = Vec::new();
        let mut history = self.source.history(channel_name, limit);

        while let Some(message) = history.next().await {
            let message =
                message.with_context(|| format!("reading history of {channel_name}"))?;
            let Some(record) = self.to_record(channel_name, message, report).await? else {
                report.skipped_undated += 1;
                continue;
            };
            records.push(record);
        }

        report.messages = records.len();
        let outcome = self
            .shards
            .merge_records(records)
            .await
            .with_context(|| format!("merging shards for {channel_name}"))?;
        report.inserted = outcome.inserted;
        report.updated = outcome.updated;
        Ok(())
    }

    async fn to_record(
        &self,
        channel_name: &str,
        message: ChannelMessage,
        report: &mut ChannelReport,
    ) -> Result<Option<MessageRecord>> {
        let Some(posted_at) = message.posted_at else {
            return Ok(None);
        };

        let image_path = match &message.photo {
            Some(photo) => {
                let stored = self
                    .images
                    .store_with(channel_name, message.id, || {
                        self.source.download_photo(channel_name, photo)
                    })
                    .await?;
                if stored.deduplicated {
                    report.images_reused += 1;
                } else {
                    report.images_downloaded += 1;
                    info!(
                        channel = channel_name,
                        message_id = message.id,
                        sha256 = stored.content_hash.as_deref().unwrap_or_default(),
                        bytes = stored.byte_size,
                        "image stored"
                    );
                }
                Some(stored.path.display().to_string())
            }
            None => None,
        };

        Ok(Some(MessageRecord {
            message_id: message.id,
            channel_name: channel_name.to_string(),
            posted_at,
            text: message.text,
            has_media: message.has_media,
            image_path,
            view_count: message.views.unwrap_or(0).max(0),
            forward_count: message.forwards.unwrap_or(0).max(0),
            ingested_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageStream, PhotoRef, SourceError};
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use futures::stream;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeSource {
        channels: HashMap<String, Vec<ChannelMessage>>,
        fail_connect: bool,
        downloads: AtomicUsize,
    }

    #[async_trait]
    impl ChannelSource for FakeSource {
        fn kind(&self) -> &'static str {
            "fake"
        }

        async fn connect(&self) -> Result<(), SourceError> {
            if self.fail_connect {
                Err(SourceError::Unauthorized("session expired".into()))
            } else {
                Ok(())
            }
        }

        fn history<'a>(&'a self, channel_name: &'a str, limit: usize) -> MessageStream<'a> {
            match self.channels.get(channel_name) {
                Some(messages) => {
                    stream::iter(messages.iter().take(limit).cloned().map(Ok).collect::<Vec<_>>()).boxed()
                }
                None => stream::iter(vec![Err(SourceError::ChannelNotFound(channel_name.into()))]).boxed(),
            }
        }

        async fn download_photo(&self, _channel: &str, photo: &PhotoRef) -> Result<Vec<u8>, SourceError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(photo.file_id.as_bytes().to_vec())
        }
    }

    fn message(id: i64, day: u32, photo: bool) -> ChannelMessage {
        ChannelMessage {
            id,
            posted_at: Some(Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).single().unwrap()),
            text: Some(format!("message {id}")),
            has_media: photo,
            photo: photo.then(|| PhotoRef { file_id: format!("photo-{id}") }),
            views: Some(10 * id),
            forwards: None,
        }
    }

    fn ingestor(source: Arc<FakeSource>, root: &std::path::Path) -> ChannelIngestor {
        ChannelIngestor::new(
            source,
            ImageStore::new(root.join("images")),
            ShardStore::new(root.join("messages")),
        )
    }

    fn target(handle: &str) -> ChannelTarget {
        ChannelTarget {
            handle: handle.into(),
            limit: 100,
        }
    }

    #[tokio::test]
    async fn messages_are_sharded_by_post_date_and_images_downloaded_once() {
        let dir = tempdir().expect("tempdir");
        let mut fake = FakeSource::default();
        fake.channels.insert(
            "tikvahpharma".into(),
            vec![message(12, 16, true), message(11, 14, false), message(10, 14, true)],
        );
        let source = Arc::new(fake);
        let ingestor = ingestor(source.clone(), dir.path());

        let summary = ingestor
            .run(&[target("https://t.me/tikvahpharma")])
            .await
            .expect("run");
        assert_eq!(summary.total_messages(), 3);
        assert_eq!(source.downloads.load(Ordering::SeqCst), 2);

        let shards = ShardStore::new(dir.path().join("messages"));
        let jan14 = shards
            .load("tikvahpharma", NaiveDate::from_ymd_opt(2024, 1, 14).unwrap())
            .await;
        assert_eq!(jan14.iter().map(|r| r.message_id).collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(jan14[0].view_count, 100);
        assert_eq!(jan14[0].forward_count, 0);
        assert!(jan14[0].image_path.as_deref().unwrap().ends_with("10.jpg"));

        let again = ingestor
            .run(&[target("tikvahpharma")])
            .await
            .expect("second run");
        assert_eq!(source.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(again.channels[0].images_reused, 2);
        assert_eq!(again.channels[0].inserted, 0);
        assert_eq!(again.channels[0].updated, 3);
    }

    #[tokio::test]
    async fn failing_channel_does_not_stop_the_sweep() {
        let dir = tempdir().expect("tempdir");
        let mut fake = FakeSource::default();
        fake.channels.insert("CheMed123".into(), vec![message(1, 14, false)]);
        let ingestor = ingestor(Arc::new(fake), dir.path());

        let summary = ingestor
            .run(&[target("@missing_channel"), target("CheMed123")])
            .await
            .expect("run");

        let failed: Vec<_> = summary.failed_channels().map(|c| c.channel_name.as_str()).collect();
        assert_eq!(failed, vec!["missing_channel"]);
        assert_eq!(summary.channels[1].messages, 1);
        assert!(summary.channels[1].error.is_none());
    }

    #[tokio::test]
    async fn handles_that_escape_the_stores_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("store");
        let mut fake = FakeSource::default();
        fake.channels.insert("..".into(), vec![message(5, 14, true)]);
        fake.channels.insert("CheMed123".into(), vec![message(1, 14, false)]);
        let source = Arc::new(fake);
        let ingestor = ingestor(source.clone(), &root);

        let summary = ingestor
            .run(&[target("https://t.me/.."), target("..\\outside"), target("CheMed123")])
            .await
            .expect("run");

        let failed: Vec<_> = summary.failed_channels().map(|c| c.handle.as_str()).collect();
        assert_eq!(failed, vec!["https://t.me/..", "..\\outside"]);
        assert_eq!(summary.channels[2].messages, 1);
        assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
        assert!(!root.join("5.jpg").exists());
        assert!(!root.join("2024-01-14.json").exists());
    }

    #[tokio::test]
    async fn connect_failure_aborts_the_invocation() {
        let dir = tempdir().expect("tempdir");
        let fake = FakeSource {
            fail_connect: true,
            ..Default::default()
        };
        let ingestor = ingestor(Arc::new(fake), dir.path());

        let err = ingestor.run(&[target("CheMed123")]).await.expect_err("must fail");
        assert!(format!("{err:#}").contains("session expired"));
        assert!(!dir.path().join("messages").exists());
    }

    #[tokio::test]
    async fn undated_messages_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let mut undated = message(3, 14, false);
        undated.posted_at = None;
        let mut fake = FakeSource::default();
        fake.channels.insert("CheMed123".into(), vec![undated, message(2, 14, false)]);
        let ingestor = ingestor(Arc::new(fake), dir.path());

        let summary = ingestor.run(&[target("CheMed123")]).await.expect("run");
        assert_eq!(summary.channels[0].messages, 1);
        assert_eq!(summary.channels[0].skipped_undated, 1);
    }
}
