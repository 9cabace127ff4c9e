//! A small data-driven DAG: an ordered list of stages, run fail-fast.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// The only thing passed along an edge: proof that the upstream stage finished.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionToken {
    pub run_id: Uuid,
    pub upstream: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CompletionToken {
    pub fn start(run_id: Uuid) -> Self {
        Self {
            run_id,
            upstream: None,
            completed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    /// Returns a one-line summary on success.
    async fn run(&self, token: CompletionToken) -> Result<String>;
}

pub struct StageDescriptor {
    pub name: String,
    pub stage: Arc<dyn Stage>,
}

pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<StageDescriptor>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, name: impl Into<String>, stage: impl Stage + 'static) -> Self {
        self.stages.push(StageDescriptor {
            name: name.into(),
            stage: Arc::new(stage),
        });
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded { summary: String },
    Failed { diagnostic: String },
    NotRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub outcome: StageOutcome,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    FailedAt { stage: String, diagnostic: String },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => f.write_str("completed"),
            RunOutcome::FailedAt { stage, .. } => write!(f, "failed-at-{stage}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    pub fn executed(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.outcome != StageOutcome::NotRun)
            .map(|s| s.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Aborted { stage: String, diagnostic: String },
    Completed,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineRunner {
    stage_timeout: Option<Duration>,
}

impl PipelineRunner {
    pub fn new(stage_timeout: Option<Duration>) -> Self {
        Self { stage_timeout }
    }

    pub async fn run(&self, definition: &PipelineDefinition) -> RunReport {
        self.run_with_id(Uuid::new_v4(), definition).await
    }

    pub async fn run_with_id(&self, run_id: Uuid, definition: &PipelineDefinition) -> RunReport {
        let started_at = Utc::now();
        let mut state = RunState::Idle;
        let mut token = CompletionToken::start(run_id);
        let mut stages = Vec::with_capacity(definition.stages.len());

        info!(%run_id, pipeline = %definition.name, stages = ?definition.stage_names(), "run started");

        for (index, descriptor) in definition.stages.iter().enumerate() {
            if !matches!(state, RunState::Idle | RunState::Running) {
                stages.push(StageReport {
                    name: descriptor.name.clone(),
                    outcome: StageOutcome::NotRun,
                    elapsed_ms: 0,
                });
                continue;
            }
            state = RunState::Running;

            let span = info_span!("stage", %run_id, stage = %descriptor.name, position = index);
            let started = Instant::now();
            let outcome = self
                .run_stage(descriptor, token.clone())
                .instrument(span)
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &outcome {
                StageOutcome::Succeeded { summary } => {
                    info!(%run_id, stage = %descriptor.name, elapsed_ms, %summary, "stage succeeded");
                    token = CompletionToken {
                        run_id,
                        upstream: Some(descriptor.name.clone()),
                        completed_at: Utc::now(),
                    };
                }
                StageOutcome::Failed { diagnostic } => {
                    error!(%run_id, stage = %descriptor.name, elapsed_ms, %diagnostic, "stage failed; aborting run");
                    state = RunState::Aborted {
                        stage: descriptor.name.clone(),
                        diagnostic: diagnostic.clone(),
                    };
                }
                StageOutcome::NotRun => {}
            }
            stages.push(StageReport {
                name: descriptor.name.clone(),
                outcome,
                elapsed_ms,
            });
        }

        if matches!(state, RunState::Idle | RunState::Running) {
            state = RunState::Completed;
        }
        let outcome = match state {
            RunState::Aborted { stage, diagnostic } => RunOutcome::FailedAt { stage, diagnostic },
            _ => RunOutcome::Completed,
        };
        info!(%run_id, outcome = %outcome, "run finished");

        RunReport {
            run_id,
            pipeline: definition.name.clone(),
            started_at,
            finished_at: Utc::now(),
            stages,
            outcome,
        }
    }

    async fn run_stage(&self, descriptor: &StageDescriptor, token: CompletionToken) -> StageOutcome {
        let stage = descriptor.stage.clone();
        let handle = tokio::spawn(async move { stage.run(token).await }.in_current_span());
        let abort = handle.abort_handle();

        let joined = match self.stage_timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    return StageOutcome::Failed {
                        diagnostic: format!(
                            "stage {} exceeded its time budget of {}s",
                            descriptor.name,
                            limit.as_secs()
                        ),
                    };
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(summary)) => StageOutcome::Succeeded { summary },
            Ok(Err(err)) => StageOutcome::Failed {
                diagnostic: format!("{err:#}"),
            },
            Err(join_err) if join_err.is_panic() => StageOutcome::Failed {
                diagnostic: format!(
                    "stage {} panicked: {}",
                    descriptor.name,
                    panic_message(join_err.into_panic())
                ),
            },
            Err(join_err) => StageOutcome::Failed {
                diagnostic: format!("stage {} was cancelled: {join_err}", descriptor.name),
            },
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    enum Behaviour {
        Succeed,
        Fail(&'static str),
        Panic,
        Hang,
    }

    struct Scripted {
        name: &'static str,
        behaviour: Behaviour,
        journal: Journal,
    }

    #[async_trait]
    impl Stage for Scripted {
        async fn run(&self, token: CompletionToken) -> Result<String> {
            self.journal.0.lock().unwrap().push(format!(
                "{}<-{}",
                self.name,
                token.upstream.as_deref().unwrap_or("start")
            ));
            match self.behaviour {
                Behaviour::Succeed => Ok(format!("{} ok", self.name)),
                Behaviour::Fail(msg) => bail!("{msg}"),
                Behaviour::Panic => panic!("{} blew up", self.name),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("unreachable".into())
                }
            }
        }
    }

    fn pipeline(journal: &Journal, detect: Behaviour) -> PipelineDefinition {
        let step = |name: &'static str, behaviour| Scripted {
            name,
            behaviour,
            journal: journal.clone(),
        };
        PipelineDefinition::new("test")
            .stage("ingest", step("ingest", Behaviour::Succeed))
            .stage("detect", step("detect", detect))
            .stage("load", step("load", Behaviour::Succeed))
            .stage("transform", step("transform", Behaviour::Succeed))
    }

    #[tokio::test]
    async fn stages_run_in_order_and_pass_tokens() {
        let journal = Journal::default();
        let report = PipelineRunner::default()
            .run(&pipeline(&journal, Behaviour::Succeed))
            .await;

        assert!(report.is_success());
        assert_eq!(report.outcome.to_string(), "completed");
        assert_eq!(
            journal.entries(),
            vec!["ingest<-start", "detect<-ingest", "load<-detect", "transform<-load"]
        );
    }

    #[tokio::test]
    async fn detect_failure_stops_the_run() {
        let journal = Journal::default();
        let report = PipelineRunner::default()
            .run(&pipeline(&journal, Behaviour::Fail("model weights missing")))
            .await;

        assert_eq!(
            report.outcome,
            RunOutcome::FailedAt {
                stage: "detect".into(),
                diagnostic: "model weights missing".into()
            }
        );
        assert_eq!(report.outcome.to_string(), "failed-at-detect");
        assert_eq!(report.executed(), vec!["ingest", "detect"]);
        assert_eq!(report.stages[2].outcome, StageOutcome::NotRun);
        assert_eq!(report.stages[3].outcome, StageOutcome::NotRun);
        assert_eq!(journal.entries().len(), 2);
    }

    #[tokio::test]
    async fn a_panicking_stage_is_a_failure() {
        let journal = Journal::default();
        let report = PipelineRunner::default()
            .run(&pipeline(&journal, Behaviour::Panic))
            .await;

        match &report.outcome {
            RunOutcome::FailedAt { stage, diagnostic } => {
                assert_eq!(stage, "detect");
                assert!(diagnostic.contains("detect blew up"), "{diagnostic}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!journal.entries().iter().any(|e| e.starts_with("load")));
    }

    #[tokio::test]
    async fn a_stage_over_budget_is_a_failure() {
        let journal = Journal::default();
        let report = PipelineRunner::new(Some(Duration::from_millis(50)))
            .run(&pipeline(&journal, Behaviour::Hang))
            .await;

        match &report.outcome {
            RunOutcome::FailedAt { stage, diagnostic } => {
                assert_eq!(stage, "detect");
                assert!(diagnostic.contains("time budget"), "{diagnostic}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(report.executed(), vec!["ingest", "detect"]);
    }
}
