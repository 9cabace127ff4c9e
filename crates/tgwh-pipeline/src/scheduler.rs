use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::lock::LockError;
use crate::{run_pipeline_once, RunMode};

/// One job on `config.schedule_cron` (UTC); every tick starts one full run.
pub async fn build_scheduler(config: Arc<PipelineConfig>, isolated_exe: Option<PathBuf>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.schedule_cron.clone();

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = config.clone();
        let mode = match &isolated_exe {
            Some(exe) => RunMode::Isolated(exe.clone()),
            None => RunMode::InProcess,
        };
        Box::pin(async move {
            match run_pipeline_once(config, mode).await {
                Ok(report) if report.is_success() => {
                    info!(run_id = %report.run_id, "scheduled run completed");
                }
                Ok(report) => {
                    error!(run_id = %report.run_id, outcome = %report.outcome, "scheduled run failed");
                }
                Err(err) => match err.downcast_ref::<LockError>() {
                    Some(LockError::Held { .. }) => {
                        warn!(error = %err, "skipping scheduled tick; previous run still active");
                    }
                    _ => error!(error = %format!("{err:#}"), "scheduled run could not start"),
                },
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
