//! Pipeline orchestration: ingest → detect → load → transform.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use uuid::Uuid;

pub mod config;
pub mod dag;
pub mod detect;
pub mod lock;
pub mod scheduler;
pub mod snapshot;
pub mod stages;
pub mod warehouse;

pub use config::{ChannelRegistry, PipelineConfig, SourceMode};
pub use dag::{
    CompletionToken, PipelineDefinition, PipelineRunner, RunOutcome, RunReport, Stage,
    StageDescriptor, StageOutcome, StageReport,
};
pub use detect::{CommandDetector, Detector};
pub use lock::{LockError, RunLock};
pub use stages::{CommandStage, DetectStage, IngestStage, LoadStage};
pub use warehouse::Warehouse;

pub const CRATE_NAME: &str = "tgwh-pipeline";

pub const STAGE_NAMES: [&str; 4] = ["ingest", "detect", "load", "transform"];

#[derive(Debug, Clone)]
pub enum RunMode {
    InProcess,
    /// Ingest, detect and load run as `{exe} <stage>` child processes.
    Isolated(PathBuf),
}

fn transform_stage(config: &PipelineConfig) -> CommandStage {
    CommandStage::new(config.transform_program.clone(), config.transform_args.clone())
}

pub fn standard_pipeline(config: Arc<PipelineConfig>) -> PipelineDefinition {
    PipelineDefinition::new("standard")
        .stage("ingest", IngestStage::new(config.clone()))
        .stage("detect", DetectStage::from_config(config.clone()))
        .stage("load", LoadStage::new(config.clone()))
        .stage("transform", transform_stage(&config))
}

pub fn isolated_pipeline(config: Arc<PipelineConfig>, exe: PathBuf) -> PipelineDefinition {
    let child = |stage: &str| CommandStage::new(exe.clone(), vec![stage.to_string()]).with_run_id();
    PipelineDefinition::new("isolated")
        .stage("ingest", child("ingest"))
        .stage("detect", child("detect"))
        .stage("load", child("load"))
        .stage("transform", transform_stage(&config))
}

/// One complete run under the run lock. Errors only when the run could not
/// start; stage failures are reported in the returned [`RunReport`].
pub async fn run_pipeline_once(config: Arc<PipelineConfig>, mode: RunMode) -> Result<RunReport> {
    let run_id = Uuid::new_v4();
    let _lock = RunLock::acquire(&config.lock_path(), run_id, config.lock_stale_after())?;

    let definition = match mode {
        RunMode::InProcess => standard_pipeline(config.clone()),
        RunMode::Isolated(exe) => isolated_pipeline(config.clone(), exe),
    };
    let report = PipelineRunner::new(config.stage_timeout())
        .run_with_id(run_id, &definition)
        .await;
    info!(run_id = %report.run_id, outcome = %report.outcome, "pipeline run recorded");
    Ok(report)
}
