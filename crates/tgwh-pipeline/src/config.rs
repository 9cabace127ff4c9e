//! Run configuration and the tracked-channel registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tgwh_source::ChannelTarget;
use tokio::fs;

pub const DEFAULT_MESSAGE_LIMIT: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Gateway,
    Fixtures,
}

impl SourceMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gateway" => Some(SourceMode::Gateway),
            "fixtures" | "fixture" => Some(SourceMode::Fixtures),
            _ => None,
        }
    }
}

/// Everything a run needs, resolved once and handed to each component.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub data_dir: PathBuf,
    pub channels_file: PathBuf,
    pub message_limit: usize,
    pub source_mode: SourceMode,
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
    pub fixtures_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub detector_program: String,
    pub detector_args: Vec<String>,
    pub transform_program: String,
    pub transform_args: Vec<String>,
    pub stage_timeout_secs: u64,
    pub lock_stale_secs: u64,
    pub schedule_cron: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let split = |value: String| -> Vec<String> {
            value.split_whitespace().map(str::to_string).collect()
        };

        let database_url = get("DATABASE_URL").unwrap_or_else(|| {
            format!(
                "postgres://{}:{}@{}:{}/{}",
                get("POSTGRES_USER").unwrap_or_else(|| "postgres".to_string()),
                get("POSTGRES_PASSWORD").unwrap_or_default(),
                get("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string()),
                get("POSTGRES_PORT").unwrap_or_else(|| "5432".to_string()),
                get("POSTGRES_DB").unwrap_or_else(|| "medical_warehouse".to_string()),
            )
        });

        Self {
            database_url,
            data_dir: get("TGWH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            channels_file: get("TGWH_CHANNELS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("channels.yaml")),
            message_limit: get("TGWH_MESSAGE_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MESSAGE_LIMIT),
            source_mode: get("TGWH_SOURCE")
                .and_then(|v| SourceMode::parse(&v))
                .unwrap_or(SourceMode::Gateway),
            gateway_url: get("TGWH_GATEWAY_URL"),
            gateway_token: get("TGWH_GATEWAY_TOKEN"),
            fixtures_dir: get("TGWH_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("fixtures/channels")),
            user_agent: get("TGWH_USER_AGENT").unwrap_or_else(|| "tgwh/0.1".to_string()),
            http_timeout_secs: get("TGWH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            detector_program: get("TGWH_DETECTOR_CMD").unwrap_or_else(|| "yolo-detect".to_string()),
            detector_args: get("TGWH_DETECTOR_ARGS").map(split).unwrap_or_default(),
            transform_program: get("TGWH_TRANSFORM_CMD").unwrap_or_else(|| "dbt".to_string()),
            transform_args: get("TGWH_TRANSFORM_ARGS").map(split).unwrap_or_else(|| {
                vec![
                    "build".to_string(),
                    "--project-dir".to_string(),
                    "medical_warehouse".to_string(),
                ]
            }),
            stage_timeout_secs: get("TGWH_STAGE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            lock_stale_secs: get("TGWH_LOCK_STALE_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(6 * 3600),
            schedule_cron: get("TGWH_SCHEDULE_CRON").unwrap_or_else(|| "0 0 * * *".to_string()),
        }
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.data_dir.join("raw").join("telegram_messages")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("raw").join("images")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("processed").join("detections.parquet")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(".tgwh-run.lock")
    }

    /// `None` when the per-stage budget is disabled (`0`).
    pub fn stage_timeout(&self) -> Option<Duration> {
        (self.stage_timeout_secs > 0).then(|| Duration::from_secs(self.stage_timeout_secs))
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn redacted_database_url(&self) -> String {
        redact_url_password(&self.database_url)
    }

    pub fn log_summary(&self) {
        tracing::info!(
            database = %self.redacted_database_url(),
            data_dir = %self.data_dir.display(),
            channels_file = %self.channels_file.display(),
            source = ?self.source_mode,
            gateway_token = if self.gateway_token.is_some() { "<set>" } else { "<not set>" },
            stage_timeout_secs = self.stage_timeout_secs,
            "configuration loaded"
        );
    }
}

fn redact_url_password(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let Some(at) = rest.find('@') else {
        return url.to_string();
    };
    let userinfo = &rest[..at];
    match userinfo.find(':') {
        Some(colon) => format!(
            "{}{}:***{}",
            &url[..scheme_end + 3],
            &userinfo[..colon],
            &rest[at..]
        ),
        None => url.to_string(),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRegistry {
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    pub handle: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ChannelRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn targets(&self, default_limit: usize) -> Vec<ChannelTarget> {
        self.channels
            .iter()
            .filter(|c| c.enabled)
            .map(|c| ChannelTarget {
                handle: c.handle.clone(),
                limit: c.limit.unwrap_or(default_limit),
            })
            .collect()
    }
}
