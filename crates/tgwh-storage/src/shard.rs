//! Incremental merge store: one JSON shard per (channel, post date).
//!
//! A merge reads the shard, overlays the new records by `message_id` and
//! writes the whole shard back sorted by id. Applying the same batch again,
//! or overlapping batches in any number of runs, converges to the same file.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use tgwh_core::MessageRecord;
use tokio::fs;
use tracing::{debug, warn};

use crate::write_file_atomically;

const SHARD_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub total: usize,
}

impl MergeOutcome {
    fn absorb(&mut self, other: MergeOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.total += other.total;
    }
}

#[derive(Debug, Clone)]
pub struct ShardStore {
    root: PathBuf,
}

impl ShardStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_path(&self, channel_name: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(channel_name)
            .join(format!("{}.json", date.format(SHARD_DATE_FORMAT)))
    }

    /// Stored records of one shard. A missing shard is empty; so is an
    /// unreadable or corrupt one, which is logged rather than returned as an
    /// error so a damaged file never blocks ingestion.
    pub async fn load(&self, channel_name: &str, date: NaiveDate) -> Vec<MessageRecord> {
        let path = self.shard_path(channel_name, date);
        read_shard_lenient(&path).await.unwrap_or_default()
    }

    pub async fn merge(
        &self,
        channel_name: &str,
        date: NaiveDate,
        new_records: Vec<MessageRecord>,
    ) -> Result<MergeOutcome> {
        for record in &new_records {
            record
                .validate()
                .with_context(|| format!("rejecting record for shard {channel_name}/{date}"))?;
            if record.channel_name != channel_name || record.shard_date() != date {
                bail!(
                    "record {}/{} posted {} does not belong to shard {channel_name}/{date}",
                    record.channel_name,
                    record.message_id,
                    record.shard_date()
                );
            }
        }

        let existing = self.load(channel_name, date).await;
        let mut by_id: BTreeMap<i64, MessageRecord> = existing
            .into_iter()
            .map(|record| (record.message_id, record))
            .collect();

        let mut outcome = MergeOutcome::default();
        let mut seen_in_batch = HashSet::new();
        for mut record in new_records {
            let first_in_batch = seen_in_batch.insert(record.message_id);
            match by_id.get(&record.message_id) {
                Some(previous) => {
                    record.posted_at = previous.posted_at;
                    if first_in_batch {
                        outcome.updated += 1;
                    }
                }
                None => outcome.inserted += 1,
            }
            by_id.insert(record.message_id, record);
        }
        outcome.total = by_id.len();

        let merged: Vec<MessageRecord> = by_id.into_values().collect();
        let path = self.shard_path(channel_name, date);
        let bytes = serde_json::to_vec_pretty(&merged)
            .with_context(|| format!("serializing shard {}", path.display()))?;
        write_file_atomically(&path, &bytes).await?;

        debug!(
            channel = channel_name,
            %date,
            inserted = outcome.inserted,
            updated = outcome.updated,
            total = outcome.total,
            "merged shard"
        );
        Ok(outcome)
    }

    /// Merge records from any mix of channels and dates; each lands in the
    /// shard of its own post date.
    pub async fn merge_records(&self, records: Vec<MessageRecord>) -> Result<MergeOutcome> {
        let mut groups: BTreeMap<(String, NaiveDate), Vec<MessageRecord>> = BTreeMap::new();
        for record in records {
            groups
                .entry((record.channel_name.clone(), record.shard_date()))
                .or_default()
                .push(record);
        }

        let mut outcome = MergeOutcome::default();
        for ((channel_name, date), batch) in groups {
            outcome.absorb(self.merge(&channel_name, date, batch).await?);
        }
        Ok(outcome)
    }

    /// Shard keys present on disk, sorted by channel then date.
    pub async fn list_shards(&self) -> Result<Vec<(String, NaiveDate)>> {
        let mut shards = Vec::new();
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking {}", self.root.display()))?
        {
            return Ok(shards);
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
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                match NaiveDate::parse_from_str(stem, SHARD_DATE_FORMAT) {
                    Ok(date) => shards.push((channel_name.clone(), date)),
                    Err(_) => warn!(path = %path.display(), "skipping file outside shard layout"),
                }
            }
        }
        shards.sort();
        Ok(shards)
    }

    /// Every stored record across all shards, flattened for loading.
    pub async fn load_all(&self) -> Result<Vec<MessageRecord>> {
        let mut all = Vec::new();
        for (channel_name, date) in self.list_shards().await? {
            all.extend(self.load(&channel_name, date).await);
        }
        Ok(all)
    }
}

async fn read_shard_lenient(path: &Path) -> Option<Vec<MessageRecord>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable shard treated as empty");
            return None;
        }
    };

    match serde_json::from_slice::<Vec<MessageRecord>>(&bytes) {
        Ok(records) => Some(records),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "corrupt shard treated as empty");
            None
        }
    }
}
