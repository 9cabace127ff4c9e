//! Fixture-backed source: replays captured channel history from local files.
//!
//! Layout: `{root}/{channel_name}.json` holding a [`FixtureChannel`]; photo
//! `file_id`s are paths relative to `root`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{ChannelMessage, ChannelSource, MessageStream, PhotoRef, SourceError, WireMessage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureChannel {
    #[serde(default)]
    pub captured_from_url: Option<String>,
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn channel_path(&self, channel_name: &str) -> PathBuf {
        self.root.join(format!("{channel_name}.json"))
    }

    async fn load_channel(&self, channel_name: &str, limit: usize) -> Result<Vec<ChannelMessage>, SourceError> {
        let path = self.channel_path(channel_name);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::ChannelNotFound(channel_name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let fixture: FixtureChannel =
            serde_json::from_str(&text).map_err(|source| SourceError::Decode {
                what: path.display().to_string(),
                source,
            })?;

        let mut messages: Vec<ChannelMessage> =
            fixture.messages.into_iter().map(ChannelMessage::from).collect();
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        messages.truncate(limit);
        Ok(messages)
    }
}

#[async_trait]
impl ChannelSource for FixtureSource {
    fn kind(&self) -> &'static str {
        "fixtures"
    }

    async fn connect(&self) -> Result<(), SourceError> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SourceError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(err) => Err(SourceError::Unavailable(format!(
                "fixture directory {}: {err}",
                self.root.display()
            ))),
        }
    }

    fn history<'a>(&'a self, channel_name: &'a str, limit: usize) -> MessageStream<'a> {
        stream::once(self.load_channel(channel_name, limit))
            .flat_map(|loaded| match loaded {
                Ok(messages) => stream::iter(messages.into_iter().map(Ok).collect::<Vec<_>>()),
                Err(err) => stream::iter(vec![Err(err)]),
            })
            .boxed()
    }

    async fn download_photo(
        &self,
        _channel_name: &str,
        photo: &PhotoRef,
    ) -> Result<Vec<u8>, SourceError> {
        let relative = Path::new(&photo.file_id);
        if relative.is_absolute() || relative.components().any(|c| c.as_os_str() == "..") {
            return Err(SourceError::Unavailable(format!(
                "photo reference {} escapes the fixture directory",
                photo.file_id
            )));
        }
        Ok(fs::read(self.root.join(relative)).await?)
    }
}
