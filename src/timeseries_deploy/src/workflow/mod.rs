//! Run orchestration: register → retrieve → transform (fan-out) → deploy → postprocess
//! (fan-out) → archive.
//!
//! ## States
//! `Registered → Retrieved → ChunkTransformed → Deployed → Postprocessed → Archived → Done`,
//! with `Failed(step)` reachable from every step. A file claimed by a run that is still
//! going, or that completed it, short-circuits to `Done` without touching anything. Once
//! a claimed run ends its claim is settled as completed or failed, and a failed claim can
//! be taken by the next invocation.
//!
//! ## Concurrency
//! Chunk transforms and postprocessing branches run as tasks in a [`JoinSet`] owned by the
//! controller; the controller waits for every task before it advances, so nothing outlives
//! the run. One task per chunk and one per branch bounds concurrency by construction.
//!
//! ## Failure handling
//! Each step runs under its own [`RetryPolicy`]. Only [`ActivityError::Transient`] is
//! retried. A chunk that fails with [`ActivityError::DataShape`] is skipped. Any other
//! exhausted step fails the run and stops everything downstream of it, except that
//! postprocessing branches are independent of each other and of archival.

pub mod hooks;
pub mod local;
pub mod retry;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use metric_transform::{
    models::{area::AreaType, observation::MetricObservation},
    pipeline::DatasetBounds,
};
use serde::Serialize;
use tokio::task::JoinSet;

pub use self::retry::{Attempted, RetryPolicies, RetryPolicy, call_with_retry};
use crate::{
    deploy::DeploySummary,
    registry::{FileStatus, Registration},
    run::RunRequest,
};

/// Classified activity failure.
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    /// Store or network failure; worth retrying.
    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),

    /// The input cannot be processed; the chunk is skipped.
    #[error("nothing to process: {0}")]
    DataShape(String),

    /// Unrecoverable; fails the step without retrying.
    #[error("unrecoverable failure: {0:#}")]
    Fatal(anyhow::Error),
}

impl ActivityError {
    /// Wrap a retryable error.
    pub fn transient(e: impl Into<anyhow::Error>) -> Self {
        ActivityError::Transient(e.into())
    }

    /// Wrap an unrecoverable error.
    pub fn fatal(e: impl Into<anyhow::Error>) -> Self {
        ActivityError::Fatal(e.into())
    }

    /// Whether the retry loop should try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, ActivityError::Transient(_))
    }
}

/// Workflow steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Claim the input file.
    Register,
    /// Read and split the raw snapshot.
    Retrieve,
    /// Transform one chunk.
    Transform,
    /// Upsert transformed rows.
    Deploy,
    /// Downstream statistics and refreshes.
    Postprocess,
    /// Long-term storage and token rotation.
    Archive,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Register => "register",
            Step::Retrieve => "retrieve",
            Step::Transform => "transform",
            Step::Deploy => "deploy",
            Step::Postprocess => "postprocess",
            Step::Archive => "archive",
        })
    }
}

/// Where a run is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Input file claimed.
    Registered,
    /// Snapshot split into chunks.
    Retrieved,
    /// Every chunk transformed (or skipped).
    ChunkTransformed,
    /// Rows upserted.
    Deployed,
    /// Postprocessing branches finished.
    Postprocessed,
    /// Dataset archived.
    Archived,
    /// Terminal success.
    Done,
    /// Terminal failure at a step.
    Failed(Step),
}

/// Terminal status of one step or branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum StepStatus {
    /// Step completed.
    Succeeded,
    /// Step had nothing to do.
    Skipped(String),
    /// Step gave up.
    Failed(String),
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Succeeded => f.write_str("succeeded"),
            StepStatus::Skipped(why) => write!(f, "skipped: {why}"),
            StepStatus::Failed(why) => write!(f, "failed: {why}"),
        }
    }
}

/// Status of one step (or one branch of a fan-out step).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    /// Step.
    pub step: Step,
    /// Chunk or branch name for fan-out steps.
    pub target: Option<String>,
    /// Terminal status.
    pub status: StepStatus,
    /// Attempts made.
    pub attempts: u32,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: String,
    /// Final state.
    pub state: WorkflowState,
    /// The input was already claimed by another run.
    pub already_handled: bool,
    /// Per-step statuses in execution order.
    pub steps: Vec<StepRecord>,
    /// Chunks that produced an artifact.
    pub chunks_processed: usize,
    /// Chunks skipped as having nothing to process.
    pub chunks_skipped: usize,
    /// Deployment counters.
    pub deploy: Option<DeploySummary>,
}

impl RunReport {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            state: WorkflowState::Registered,
            already_handled: false,
            steps: Vec::new(),
            chunks_processed: 0,
            chunks_skipped: 0,
            deploy: None,
        }
    }

    fn record(&mut self, step: Step, target: Option<String>, status: StepStatus, attempts: u32) {
        self.steps.push(StepRecord {
            step,
            target,
            status,
            attempts,
        });
    }

    fn fail(mut self, step: Step, target: Option<String>, err: &ActivityError, attempts: u32) -> Self {
        self.record(step, target, StepStatus::Failed(err.to_string()), attempts);
        self.state = WorkflowState::Failed(step);
        self
    }

    /// Records for `step`.
    pub fn records(&self, step: Step) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(move |r| r.step == step)
    }
}

/// One area's share of a raw snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRef {
    /// Area type of every observation.
    pub area_type: AreaType,
    /// Area code of every observation.
    pub area_code: String,
    /// Observations of this area.
    pub observations: Vec<MetricObservation>,
    /// Bounds of the snapshot the chunk was split from; shared by every chunk of a run.
    pub bounds: Arc<DatasetBounds>,
}

impl ChunkRef {
    /// `<areaType>/<areaCode>`.
    pub fn label(&self) -> String {
        format!("{}/{}", self.area_type, self.area_code)
    }
}

/// Result of transforming one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Rows were written to an artifact.
    Processed {
        /// Artifact blob path.
        artifact: String,
        /// Rows in the artifact.
        rows: usize,
    },
    /// The chunk yielded nothing deployable.
    NothingToProcess {
        /// Why.
        reason: String,
    },
}

/// The activities a run is made of. Implementations must be safe to call concurrently.
#[async_trait]
pub trait Activities: Send + Sync + 'static {
    /// Claim the input file for this run.
    async fn register(&self, req: &RunRequest) -> Result<Registration, ActivityError>;

    /// Read the raw snapshot and split it into per-area chunks.
    async fn retrieve(&self, req: &RunRequest) -> Result<Vec<ChunkRef>, ActivityError>;

    /// Transform one chunk and persist its artifact.
    async fn transform_chunk(
        &self,
        req: &RunRequest,
        chunk: &ChunkRef,
    ) -> Result<ChunkOutcome, ActivityError>;

    /// Deploy the rows of the given artifacts.
    async fn deploy(
        &self,
        req: &RunRequest,
        artifacts: &[String],
    ) -> Result<DeploySummary, ActivityError>;

    /// Names of the postprocessing branches to run after deployment.
    fn postprocess_branches(&self) -> Vec<String>;

    /// Run one postprocessing branch.
    async fn postprocess(&self, req: &RunRequest, branch: &str) -> Result<(), ActivityError>;

    /// Archive the run's dataset and rotate the dispatch token.
    async fn archive(&self, req: &RunRequest, artifacts: &[String]) -> Result<(), ActivityError>;

    /// Record how the run holding the input claim ended.
    async fn settle(&self, req: &RunRequest, status: FileStatus) -> Result<(), ActivityError>;
}

/// Drives one run through every step.
pub struct WorkflowController<A: Activities> {
    activities: Arc<A>,
    policies: RetryPolicies,
}

impl<A: Activities> WorkflowController<A> {
    /// Controller over `activities` with `policies`.
    pub fn new(activities: Arc<A>, policies: RetryPolicies) -> Self {
        Self {
            activities,
            policies,
        }
    }

    /// Execute the run. Never panics on activity failure; the outcome is in the report.
    #[tracing::instrument(skip(self, req), fields(run_id = %req.run_id(), data_path = %req.data_path))]
    pub async fn run(&self, req: RunRequest) -> RunReport {
        let mut report = RunReport::new(req.run_id());
        let acts = &self.activities;

        // Registered
        let out = call_with_retry("register", &self.policies.register, |_| acts.register(&req)).await;
        match out.result {
            Ok(Registration::New) => {
                report.record(Step::Register, None, StepStatus::Succeeded, out.attempts);
            }
            Ok(Registration::AlreadyHandled) => {
                tracing::info!("input already handled; nothing to do");
                report.record(
                    Step::Register,
                    None,
                    StepStatus::Skipped("already handled".into()),
                    out.attempts,
                );
                report.already_handled = true;
                report.state = WorkflowState::Done;
                return report;
            }
            Err(e) => return report.fail(Step::Register, None, &e, out.attempts),
        }
        report.state = WorkflowState::Registered;

        let report = self.run_claimed(&req, report).await;
        let status = match report.state {
            WorkflowState::Failed(_) => FileStatus::Failed,
            _ => FileStatus::Completed,
        };
        let out = call_with_retry("settle", &self.policies.register, |_| acts.settle(&req, status)).await;
        if let Err(e) = out.result {
            tracing::error!(%status, error = %e, "input claim not settled");
        }
        report
    }

    async fn run_claimed(&self, req: &RunRequest, mut report: RunReport) -> RunReport {
        let acts = &self.activities;

        // Retrieved
        let out = call_with_retry("retrieve", &self.policies.retrieve, |_| acts.retrieve(req)).await;
        let chunks = match out.result {
            Ok(chunks) => chunks,
            Err(e) => return report.fail(Step::Retrieve, None, &e, out.attempts),
        };
        report.record(Step::Retrieve, None, StepStatus::Succeeded, out.attempts);
        report.state = WorkflowState::Retrieved;
        tracing::info!(chunks = chunks.len(), "snapshot retrieved");

        // ChunkTransformed (fan-out / fan-in)
        let mut tasks = JoinSet::new();
        for chunk in chunks {
            let acts = Arc::clone(&self.activities);
            let req = req.clone();
            let policy = self.policies.transform.clone();
            tasks.spawn(async move {
                let label = chunk.label();
                let out = call_with_retry("transform", &policy, |_| acts.transform_chunk(&req, &chunk)).await;
                (label, out)
            });
        }

        let mut artifacts = Vec::new();
        let mut transform_failure: Option<(String, ActivityError, u32)> = None;
        while let Some(joined) = tasks.join_next().await {
            let (label, out) = match joined {
                Ok(v) => v,
                Err(e) => (
                    "<panicked>".to_string(),
                    Attempted {
                        result: Err(ActivityError::fatal(e)),
                        attempts: 1,
                    },
                ),
            };
            match out.result {
                Ok(ChunkOutcome::Processed { artifact, rows }) => {
                    tracing::debug!(chunk = %label, rows, "chunk processed");
                    report.record(Step::Transform, Some(label), StepStatus::Succeeded, out.attempts);
                    report.chunks_processed += 1;
                    artifacts.push(artifact);
                }
                Ok(ChunkOutcome::NothingToProcess { reason }) => {
                    report.record(Step::Transform, Some(label), StepStatus::Skipped(reason), out.attempts);
                    report.chunks_skipped += 1;
                }
                Err(ActivityError::DataShape(reason)) => {
                    tracing::warn!(chunk = %label, %reason, "chunk skipped");
                    report.record(Step::Transform, Some(label), StepStatus::Skipped(reason), out.attempts);
                    report.chunks_skipped += 1;
                }
                Err(e) => {
                    if transform_failure.is_none() {
                        transform_failure = Some((label, e, out.attempts));
                    } else {
                        report.record(
                            Step::Transform,
                            Some(label),
                            StepStatus::Failed(e.to_string()),
                            out.attempts,
                        );
                    }
                }
            }
        }
        if let Some((label, e, attempts)) = transform_failure {
            return report.fail(Step::Transform, Some(label), &e, attempts);
        }
        artifacts.sort();
        report.state = WorkflowState::ChunkTransformed;

        // Deployed
        let out = call_with_retry("deploy", &self.policies.deploy, |_| acts.deploy(req, &artifacts)).await;
        match out.result {
            Ok(summary) => {
                report.record(Step::Deploy, None, StepStatus::Succeeded, out.attempts);
                report.deploy = Some(summary);
            }
            Err(e) => return report.fail(Step::Deploy, None, &e, out.attempts),
        }
        report.state = WorkflowState::Deployed;

        // Postprocessed (independent branches)
        let mut branches = JoinSet::new();
        for branch in self.activities.postprocess_branches() {
            let acts = Arc::clone(&self.activities);
            let req = req.clone();
            let policy = self.policies.postprocess.clone();
            branches.spawn(async move {
                let out = call_with_retry("postprocess", &policy, |_| acts.postprocess(&req, &branch)).await;
                (branch, out)
            });
        }
        while let Some(joined) = branches.join_next().await {
            let (branch, status, attempts) = match joined {
                Ok((branch, out)) => match out.result {
                    Ok(()) => (branch, StepStatus::Succeeded, out.attempts),
                    Err(e) => {
                        tracing::error!(%branch, error = %e, "postprocessing branch failed");
                        (branch, StepStatus::Failed(e.to_string()), out.attempts)
                    }
                },
                Err(e) => ("<panicked>".to_string(), StepStatus::Failed(e.to_string()), 1),
            };
            report.record(Step::Postprocess, Some(branch), status, attempts);
        }
        report.state = WorkflowState::Postprocessed;

        // Archived
        let out = call_with_retry("archive", &self.policies.archive, |_| acts.archive(req, &artifacts)).await;
        match out.result {
            Ok(()) => report.record(Step::Archive, None, StepStatus::Succeeded, out.attempts),
            Err(e) => return report.fail(Step::Archive, None, &e, out.attempts),
        }
        report.state = WorkflowState::Archived;

        report.state = WorkflowState::Done;
        tracing::info!(
            chunks_processed = report.chunks_processed,
            chunks_skipped = report.chunks_skipped,
            "run finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_records_serialize_with_tagged_status() {
        insta::assert_json_snapshot!(
            StepRecord {
                step: Step::Postprocess,
                target: Some("graphs".into()),
                status: StepStatus::Failed("cache unreachable".into()),
                attempts: 2,
            },
            @r#"
        {
          "step": "postprocess",
          "target": "graphs",
          "status": {
            "status": "failed",
            "detail": "cache unreachable"
          },
          "attempts": 2
        }
        "#
        );
    }

    #[test]
    fn only_transient_errors_retry() {
        assert!(ActivityError::transient(anyhow::anyhow!("locked")).is_transient());
        assert!(!ActivityError::fatal(anyhow::anyhow!("no key")).is_transient());
        assert!(!ActivityError::DataShape("empty".into()).is_transient());
        assert_eq!(
            ActivityError::DataShape("empty area group".into()).to_string(),
            "nothing to process: empty area group"
        );
    }

    #[test]
    fn chunk_labels_name_the_area() {
        let chunk = ChunkRef {
            area_type: AreaType::NhsTrust,
            area_code: "RX1".into(),
            observations: vec![],
            bounds: Arc::default(),
        };
        assert_eq!(chunk.label(), "nhsTrust/RX1");
        assert_eq!(Step::Archive.to_string(), "archive");
    }
}
