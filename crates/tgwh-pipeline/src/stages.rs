//! The concrete stages of a run and the single-stage entry points the CLI
//! exposes as `tgwh ingest|detect|load`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tgwh_core::ClassTaxonomy;
use tgwh_source::{
    ChannelIngestor, ChannelSource, FixtureSource, GatewayConfig, GatewaySource, IngestSummary,
};
use tgwh_storage::{HttpClientConfig, HttpFetcher, ImageStore, ShardStore};
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ChannelRegistry, PipelineConfig, SourceMode};
use crate::dag::{CompletionToken, Stage};
use crate::detect::{detect_images, CommandDetector, Detector};
use crate::snapshot::{read_detection_snapshot, write_detection_snapshot};
use crate::warehouse::Warehouse;

pub fn build_source(config: &PipelineConfig, run_id: Uuid) -> Result<Arc<dyn ChannelSource>> {
    match config.source_mode {
        SourceMode::Fixtures => Ok(Arc::new(FixtureSource::new(config.fixtures_dir.clone()))),
        SourceMode::Gateway => {
            let base_url = config
                .gateway_url
                .clone()
                .context("TGWH_GATEWAY_URL must be set when TGWH_SOURCE=gateway")?;
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                bearer_token: config.gateway_token.clone(),
                ..Default::default()
            })?;
            let source = GatewaySource::new(GatewayConfig { base_url }, Arc::new(http), run_id)?;
            Ok(Arc::new(source))
        }
    }
}

pub async fn run_ingest(config: &PipelineConfig, run_id: Uuid) -> Result<IngestSummary> {
    let registry = ChannelRegistry::load(&config.channels_file).await?;
    let targets = registry.targets(config.message_limit);
    let ingestor = ChannelIngestor::new(
        build_source(config, run_id)?,
        ImageStore::new(config.images_dir()),
        ShardStore::new(config.shards_dir()),
    );
    let summary = ingestor.run(&targets).await?;
    for failed in summary.failed_channels() {
        warn!(%run_id, channel = %failed.channel_name, error = ?failed.error, "channel skipped this run");
    }
    Ok(summary)
}

pub async fn run_detect(
    config: &PipelineConfig,
    detector: &dyn Detector,
    taxonomy: &ClassTaxonomy,
) -> Result<String> {
    let run = detect_images(&ImageStore::new(config.images_dir()), detector, taxonomy).await?;
    let info = write_detection_snapshot(&config.snapshot_path(), &run.records)?;
    info!(
        path = %info.path.display(),
        rows = info.rows,
        sha256 = %info.sha256,
        "detection snapshot written"
    );
    Ok(format!(
        "{} images, {} classified, {} skipped",
        run.images_seen,
        run.records.len(),
        run.failed.len()
    ))
}

pub async fn run_load(config: &PipelineConfig) -> Result<String> {
    let warehouse = Warehouse::connect(&config.database_url)
        .await
        .with_context(|| format!("warehouse at {}", config.redacted_database_url()))?;
    warehouse.ensure_schema().await?;

    let messages = ShardStore::new(config.shards_dir()).load_all().await?;
    let loaded_messages = warehouse.load_messages(messages).await?;

    let snapshot_path = config.snapshot_path();
    let loaded_detections = match read_detection_snapshot(&snapshot_path)? {
        Some(detections) => warehouse.load_detections(detections).await?.rows,
        None => {
            info!(path = %snapshot_path.display(), "no detection snapshot; skipping detections");
            0
        }
    };
    Ok(format!(
        "{} messages, {} detections upserted",
        loaded_messages.rows, loaded_detections
    ))
}

pub async fn run_migrate(config: &PipelineConfig) -> Result<()> {
    Warehouse::connect(&config.database_url)
        .await?
        .ensure_schema()
        .await
}

pub struct IngestStage {
    config: Arc<PipelineConfig>,
}

impl IngestStage {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for IngestStage {
    async fn run(&self, token: CompletionToken) -> Result<String> {
        let summary = run_ingest(&self.config, token.run_id).await?;
        Ok(format!(
            "{} channels, {} messages, {} failed",
            summary.channels.len(),
            summary.total_messages(),
            summary.failed_channels().count()
        ))
    }
}

pub struct DetectStage {
    config: Arc<PipelineConfig>,
    detector: Arc<dyn Detector>,
    taxonomy: ClassTaxonomy,
}

impl DetectStage {
    pub fn new(config: Arc<PipelineConfig>, detector: Arc<dyn Detector>) -> Self {
        Self {
            config,
            detector,
            taxonomy: ClassTaxonomy::default(),
        }
    }

    pub fn from_config(config: Arc<PipelineConfig>) -> Self {
        let detector = CommandDetector::new(
            config.detector_program.clone(),
            config.detector_args.clone(),
        );
        Self::new(config, Arc::new(detector))
    }
}

#[async_trait]
impl Stage for DetectStage {
    async fn run(&self, _token: CompletionToken) -> Result<String> {
        run_detect(&self.config, self.detector.as_ref(), &self.taxonomy).await
    }
}

pub struct LoadStage {
    config: Arc<PipelineConfig>,
}

impl LoadStage {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for LoadStage {
    async fn run(&self, _token: CompletionToken) -> Result<String> {
        run_load(&self.config).await
    }
}

/// Runs an external program to completion. The environment is inherited;
/// a nonzero exit fails the stage with the program's stderr as diagnostic.
#[derive(Debug, Clone)]
pub struct CommandStage {
    program: PathBuf,
    args: Vec<String>,
    pass_run_id: bool,
}

impl CommandStage {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            pass_run_id: false,
        }
    }

    /// Append `--run-id <id>` so a child `tgwh` stage joins the parent run.
    pub fn with_run_id(mut self) -> Self {
        self.pass_run_id = true;
        self
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Stage for CommandStage {
    async fn run(&self, token: CompletionToken) -> Result<String> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.pass_run_id {
            command.arg("--run-id").arg(token.run_id.to_string());
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("spawning `{}`", self.command_line()))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            bail!(
                "`{}` exited with {}: {}",
                self.command_line(),
                output.status,
                stderr.trim()
            );
        }
        if !stderr.trim().is_empty() {
            warn!(command = %self.command_line(), stderr = %stderr.trim(), "command wrote to stderr");
        }
        Ok(format!("`{}` exited with {}", self.command_line(), output.status))
    }
}
