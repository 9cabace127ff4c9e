//! History gateway source: paginated JSON message history over HTTP.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use tgwh_storage::{FetchError, HttpFetcher};
use tracing::debug;
use uuid::Uuid;

use crate::{ChannelMessage, ChannelSource, MessageStream, PhotoRef, SourceError, WireMessage};

/// Largest page the gateway serves per request.
pub const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
}

#[derive(Debug, Deserialize)]
struct HistoryPage {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

pub struct GatewaySource {
    base_url: Url,
    http: Arc<HttpFetcher>,
    run_id: Uuid,
}

impl GatewaySource {
    pub fn new(config: GatewayConfig, http: Arc<HttpFetcher>, run_id: Uuid) -> Result<Self, SourceError> {
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| SourceError::Unavailable(format!("invalid gateway url {base}: {e}")))?;
        Ok(Self {
            base_url,
            http,
            run_id,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        self.base_url
            .join(path)
            .map_err(|e| SourceError::Unavailable(format!("building gateway url for {path}: {e}")))
    }

    pub fn history_url(
        &self,
        channel_name: &str,
        limit: usize,
        before_id: Option<i64>,
    ) -> Result<Url, SourceError> {
        let mut url = self.endpoint(&format!("v1/channels/{channel_name}/messages"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(before_id) = before_id {
                query.append_pair("before_id", &before_id.to_string());
            }
        }
        Ok(url)
    }

    async fn fetch_page(
        &self,
        channel_name: &str,
        limit: usize,
        before_id: Option<i64>,
    ) -> Result<Vec<ChannelMessage>, SourceError> {
        let url = self.history_url(channel_name, limit, before_id)?;
        let resp = self
            .http
            .fetch_bytes(self.run_id, channel_name, url.as_str())
            .await
            .map_err(|err| map_fetch_error(channel_name, err))?;
        let page: HistoryPage =
            serde_json::from_slice(&resp.body).map_err(|source| SourceError::Decode {
                what: format!("history page for {channel_name}"),
                source,
            })?;
        debug!(
            channel = channel_name,
            before_id,
            received = page.messages.len(),
            "fetched history page"
        );
        Ok(page.messages.into_iter().map(ChannelMessage::from).collect())
    }
}

fn map_fetch_error(channel_name: &str, err: FetchError) -> SourceError {
    match err.status() {
        Some(401) | Some(403) => SourceError::Unauthorized(err.to_string()),
        Some(404) => SourceError::ChannelNotFound(channel_name.to_string()),
        _ => SourceError::Fetch(err),
    }
}

struct PageCursor {
    before_id: Option<i64>,
    remaining: usize,
    buffered: VecDeque<ChannelMessage>,
    exhausted: bool,
}

#[async_trait]
impl ChannelSource for GatewaySource {
    fn kind(&self) -> &'static str {
        "gateway"
    }

    async fn connect(&self) -> Result<(), SourceError> {
        let url = self.endpoint("v1/auth/check")?;
        self.http
            .fetch_bytes(self.run_id, "auth", url.as_str())
            .await
            .map_err(|err| match err.status() {
                Some(401) | Some(403) => SourceError::Unauthorized(err.to_string()),
                _ => SourceError::Unavailable(err.to_string()),
            })?;
        Ok(())
    }

    fn history<'a>(&'a self, channel_name: &'a str, limit: usize) -> MessageStream<'a> {
        let cursor = PageCursor {
            before_id: None,
            remaining: limit,
            buffered: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(cursor, move |mut cursor| async move {
            loop {
                if cursor.remaining == 0 {
                    return None;
                }
                if let Some(message) = cursor.buffered.pop_front() {
                    cursor.remaining -= 1;
                    return Some((Ok(message), cursor));
                }
                if cursor.exhausted {
                    return None;
                }

                let page_size = cursor.remaining.min(PAGE_SIZE);
                match self.fetch_page(channel_name, page_size, cursor.before_id).await {
                    Ok(page) => {
                        if page.len() < page_size {
                            cursor.exhausted = true;
                        }
                        let previous = cursor.before_id;
                        let fresh: Vec<ChannelMessage> = page
                            .into_iter()
                            .filter(|m| previous.map_or(true, |b| m.id < b))
                            .collect();
                        // A page that does not move the cursor back would loop forever.
                        match fresh.iter().map(|m| m.id).min() {
                            Some(oldest) => cursor.before_id = Some(oldest),
                            None => cursor.exhausted = true,
                        }
                        cursor.buffered.extend(fresh);
                    }
                    Err(err) => {
                        cursor.remaining = 0;
                        return Some((Err(err), cursor));
                    }
                }
            }
        })
        .boxed()
    }

    async fn download_photo(
        &self,
        channel_name: &str,
        photo: &PhotoRef,
    ) -> Result<Vec<u8>, SourceError> {
        let url = self.endpoint(&format!("v1/media/{}", photo.file_id))?;
        let resp = self
            .http
            .fetch_bytes(self.run_id, channel_name, url.as_str())
            .await
            .map_err(|err| map_fetch_error(channel_name, err))?;
        Ok(resp.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tgwh_storage::HttpClientConfig;

    fn source(base: &str) -> GatewaySource {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http"));
        GatewaySource::new(
            GatewayConfig {
                base_url: base.to_string(),
            },
            http,
            Uuid::nil(),
        )
        .expect("source")
    }

    #[test]
    fn history_urls_page_backwards() {
        let gw = source("https://gateway.example/api");
        let first = gw.history_url("tikvahpharma", 100, None).expect("url");
        assert_eq!(
            first.as_str(),
            "https://gateway.example/api/v1/channels/tikvahpharma/messages?limit=100"
        );
        let next = gw.history_url("tikvahpharma", 50, Some(9120)).expect("url");
        assert_eq!(
            next.as_str(),
            "https://gateway.example/api/v1/channels/tikvahpharma/messages?limit=50&before_id=9120"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http"));
        let result = GatewaySource::new(
            GatewayConfig {
                base_url: "not a url".into(),
            },
            http,
            Uuid::nil(),
        );
        assert!(matches!(result, Err(SourceError::Unavailable(_))));
    }
}
