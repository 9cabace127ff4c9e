//! Warehouse Loader: idempotent upserts of messages and detections into
//! Postgres.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tgwh_core::{DetectionRecord, MessageRecord};
use tracing::info;

pub const DEFAULT_SCHEMA: &str = "raw";

// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;
const MESSAGE_COLUMNS: usize = 9;
const DETECTION_COLUMNS: usize = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    pub rows: usize,
    pub statements: usize,
}

#[derive(Clone)]
pub struct Warehouse {
    pool: PgPool,
    schema: String,
}

impl Warehouse {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .context("connecting to warehouse database")?;
        Self::with_schema(pool, DEFAULT_SCHEMA)
    }

    pub fn with_schema(pool: PgPool, schema: &str) -> Result<Self> {
        if schema.is_empty()
            || !schema
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            bail!("invalid warehouse schema name {schema:?}");
        }
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let schema = &self.schema;
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
            format!(
                "CREATE TABLE IF NOT EXISTS {schema}.messages (
                    message_id BIGINT NOT NULL,
                    channel_name TEXT NOT NULL,
                    posted_at TIMESTAMPTZ NOT NULL,
                    text TEXT,
                    has_media BOOLEAN NOT NULL DEFAULT FALSE,
                    image_path TEXT,
                    view_count BIGINT NOT NULL DEFAULT 0,
                    forward_count BIGINT NOT NULL DEFAULT 0,
                    ingested_at TIMESTAMPTZ NOT NULL,
                    UNIQUE (message_id, channel_name)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {schema}.detections (
                    message_id BIGINT PRIMARY KEY,
                    channel_name TEXT NOT NULL,
                    image_path TEXT NOT NULL,
                    detected_class_set TEXT NOT NULL,
                    best_confidence DOUBLE PRECISION NOT NULL,
                    image_category TEXT NOT NULL
                )"
            ),
        ];
        for sql in &statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("ensuring warehouse tables in schema {schema}"))?;
        }
        Ok(())
    }

    /// Upsert the batch in a single transaction. On conflict only the mutable
    /// fields are overwritten; `posted_at` keeps its first loaded value.
    pub async fn load_messages(&self, batch: Vec<MessageRecord>) -> Result<LoadOutcome> {
        if batch.is_empty() {
            info!(table = "messages", "empty batch; nothing to load");
            return Ok(LoadOutcome::default());
        }
        let batch = dedupe_messages(batch);

        let mut tx = self.pool.begin().await.context("opening load transaction")?;
        let mut outcome = LoadOutcome::default();
        for chunk in batch.chunks(MAX_BIND_PARAMS / MESSAGE_COLUMNS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {}.messages (message_id, channel_name, posted_at, text, has_media, \
                 image_path, view_count, forward_count, ingested_at) ",
                self.schema
            ));
            qb.push_values(chunk, |mut row, r| {
                row.push_bind(r.message_id)
                    .push_bind(r.channel_name.as_str())
                    .push_bind(r.posted_at)
                    .push_bind(r.text.as_deref())
                    .push_bind(r.has_media)
                    .push_bind(r.image_path.as_deref())
                    .push_bind(r.view_count)
                    .push_bind(r.forward_count)
                    .push_bind(r.ingested_at);
            });
            qb.push(
                " ON CONFLICT (message_id, channel_name) DO UPDATE SET \
                 text = EXCLUDED.text, \
                 view_count = EXCLUDED.view_count, \
                 forward_count = EXCLUDED.forward_count, \
                 ingested_at = EXCLUDED.ingested_at",
            );
            qb.build()
                .execute(&mut *tx)
                .await
                .context("upserting messages")?;
            outcome.rows += chunk.len();
            outcome.statements += 1;
        }
        tx.commit().await.context("committing message batch")?;

        info!(table = "messages", rows = outcome.rows, statements = outcome.statements, "messages loaded");
        Ok(outcome)
    }

    pub async fn load_detections(&self, batch: Vec<DetectionRecord>) -> Result<LoadOutcome> {
        if batch.is_empty() {
            info!(table = "detections", "empty batch; nothing to load");
            return Ok(LoadOutcome::default());
        }
        let rows = dedupe_detections(batch)
            .into_iter()
            .map(|r| {
                let class_set = serde_json::to_string(&r.detected_class_set)?;
                Ok((r, class_set))
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()
            .context("encoding detected class sets")?;

        let mut tx = self.pool.begin().await.context("opening load transaction")?;
        let mut outcome = LoadOutcome::default();
        for chunk in rows.chunks(MAX_BIND_PARAMS / DETECTION_COLUMNS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {}.detections (message_id, channel_name, image_path, \
                 detected_class_set, best_confidence, image_category) ",
                self.schema
            ));
            qb.push_values(chunk, |mut row, (r, class_set)| {
                row.push_bind(r.message_id)
                    .push_bind(r.channel_name.as_str())
                    .push_bind(r.image_path.as_str())
                    .push_bind(class_set.as_str())
                    .push_bind(r.best_confidence)
                    .push_bind(r.image_category.as_str());
            });
            qb.push(
                " ON CONFLICT (message_id) DO UPDATE SET \
                 detected_class_set = EXCLUDED.detected_class_set, \
                 best_confidence = EXCLUDED.best_confidence, \
                 image_category = EXCLUDED.image_category",
            );
            qb.build()
                .execute(&mut *tx)
                .await
                .context("upserting detections")?;
            outcome.rows += chunk.len();
            outcome.statements += 1;
        }
        tx.commit().await.context("committing detection batch")?;

        info!(table = "detections", rows = outcome.rows, statements = outcome.statements, "detections loaded");
        Ok(outcome)
    }
}

/// One row per (message_id, channel_name); the latest `ingested_at` wins and
/// ties go to the later element.
pub fn dedupe_messages(batch: Vec<MessageRecord>) -> Vec<MessageRecord> {
    let mut latest: HashMap<(i64, String), MessageRecord> = HashMap::with_capacity(batch.len());
    for record in batch {
        let key = (record.message_id, record.channel_name.clone());
        match latest.get(&key) {
            Some(existing) if existing.ingested_at > record.ingested_at => {}
            _ => {
                latest.insert(key, record);
            }
        }
    }
    let mut rows: Vec<_> = latest.into_values().collect();
    rows.sort_by(|a, b| (a.channel_name.as_str(), a.message_id).cmp(&(b.channel_name.as_str(), b.message_id)));
    rows
}

/// One row per message_id; the later element wins.
pub fn dedupe_detections(batch: Vec<DetectionRecord>) -> Vec<DetectionRecord> {
    let mut latest: HashMap<i64, DetectionRecord> = HashMap::with_capacity(batch.len());
    for record in batch {
        latest.insert(record.message_id, record);
    }
    let mut rows: Vec<_> = latest.into_values().collect();
    rows.sort_by_key(|r| r.message_id);
    rows
}
