//! Core record types and image taxonomy for the channel warehouse.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod classify;

pub use classify::{best_confidence, classify, ClassTaxonomy};

pub const CRATE_NAME: &str = "tgwh-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("channel_name must not be empty (message_id={message_id})")]
    EmptyChannel { message_id: i64 },
    #[error("message_id must be non-negative, got {0}")]
    NegativeMessageId(i64),
    #[error("{field} must be non-negative for {channel_name}/{message_id}, got {value}")]
    NegativeCounter {
        channel_name: String,
        message_id: i64,
        field: &'static str,
        value: i64,
    },
    #[error("unknown image category {0:?}")]
    UnknownCategory(String),
    #[error("channel name {0:?} is not a single path segment")]
    InvalidChannelName(String),
}

/// Channel names become directories under the shard and image stores.
pub fn validate_channel_name(name: &str) -> Result<(), RecordError> {
    let plain = !name.trim().is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if plain {
        Ok(())
    } else {
        Err(RecordError::InvalidChannelName(name.to_string()))
    }
}

/// One channel post as observed by a single fetch.
///
/// Identity is `(message_id, channel_name)`. `text`, the counters and
/// `ingested_at` change between observations; the identity and `posted_at`
/// do not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: i64,
    pub channel_name: String,
    pub posted_at: DateTime<Utc>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub view_count: i64,
    #[serde(default)]
    pub forward_count: i64,
    pub ingested_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.message_id < 0 {
            return Err(RecordError::NegativeMessageId(self.message_id));
        }
        if self.channel_name.trim().is_empty() {
            return Err(RecordError::EmptyChannel {
                message_id: self.message_id,
            });
        }
        validate_channel_name(&self.channel_name)?;
        for (field, value) in [
            ("view_count", self.view_count),
            ("forward_count", self.forward_count),
        ] {
            if value < 0 {
                return Err(RecordError::NegativeCounter {
                    channel_name: self.channel_name.clone(),
                    message_id: self.message_id,
                    field,
                    value,
                });
            }
        }
        Ok(())
    }

    /// Calendar date (UTC) of the post; selects the shard the record lives in.
    pub fn shard_date(&self) -> NaiveDate {
        self.posted_at.date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageCategory {
    Promotional,
    ProductDisplay,
    Lifestyle,
    Other,
}

impl ImageCategory {
    pub const ALL: [ImageCategory; 4] = [
        ImageCategory::Promotional,
        ImageCategory::ProductDisplay,
        ImageCategory::Lifestyle,
        ImageCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageCategory::Promotional => "promotional",
            ImageCategory::ProductDisplay => "product_display",
            ImageCategory::Lifestyle => "lifestyle",
            ImageCategory::Other => "other",
        }
    }
}

impl fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageCategory {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| RecordError::UnknownCategory(s.to_string()))
    }
}

/// Output contract of the external object detector for one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(default)]
    pub classes: Vec<u32>,
    #[serde(default)]
    pub confidences: Vec<f64>,
}

/// Current classification of one message image. Identity is `message_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub message_id: i64,
    pub channel_name: String,
    pub image_path: String,
    pub detected_class_set: Vec<u32>,
    pub best_confidence: f64,
    pub image_category: ImageCategory,
}

impl DetectionRecord {
    pub fn from_raw(
        message_id: i64,
        channel_name: impl Into<String>,
        image_path: impl Into<String>,
        raw: RawDetection,
        taxonomy: &ClassTaxonomy,
    ) -> Self {
        let image_category = taxonomy.classify(&raw.classes);
        Self {
            message_id,
            channel_name: channel_name.into(),
            image_path: image_path.into(),
            best_confidence: best_confidence(&raw.confidences),
            detected_class_set: raw.classes,
            image_category,
        }
    }
}
