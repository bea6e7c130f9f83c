//! Core types passed between steps, the driver and callers

use crate::cluster::{Direction, Profile};
use crate::error::{Error, ErrorKind};
use crate::step::StepKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Caller options for one pipeline run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Originating request id; becomes part of the lock holder id
    pub request_id: String,
    /// Merged into the cluster's option bag before resolution
    pub overrides: BTreeMap<String, String>,
    /// Reset the completion ledger before executing (new operation)
    pub fresh: bool,
    /// Run undo sub-steps even without a forward completion record
    pub force_undo: bool,
}

impl RunOptions {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    pub fn fresh(mut self) -> Self {
        self.fresh = true;
        self
    }
}

/// What happened to one sub-step during a step invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubStepStatus {
    /// Side effects executed and recorded
    Ran,
    /// Already recorded as done, not executed again
    Skipped,
    /// Undo of a forward sub-step that never completed
    NoOp,
    /// Best-effort undo failed; the chain continued
    FailedBestEffort { error: String },
}

impl fmt::Display for SubStepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ran => f.write_str("ran"),
            Self::Skipped => f.write_str("skipped"),
            Self::NoOp => f.write_str("no-op"),
            Self::FailedBestEffort { error } => write!(f, "failed (ignored): {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubStepReport {
    pub name: String,
    #[serde(flatten)]
    pub status: SubStepStatus,
}

/// Result of a successful step invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Zero on success; non-zero is recorded but does not stop the pipeline
    pub return_code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<SubStepReport>,
}

impl StepOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            return_code: 0,
            message: message.into(),
            sub_steps: Vec::new(),
        }
    }

    /// Non-fatal, non-zero outcome (e.g. an external tool reporting nothing to do)
    pub fn with_code(return_code: i32, message: impl Into<String>) -> Self {
        Self {
            return_code,
            message: message.into(),
            sub_steps: Vec::new(),
        }
    }

    /// Count sub-steps that actually executed side effects
    pub fn ran_count(&self) -> usize {
        self.sub_steps
            .iter()
            .filter(|s| s.status == SubStepStatus::Ran)
            .count()
    }

    /// Best-effort failures swallowed during undo
    pub fn best_effort_failures(&self) -> impl Iterator<Item = &SubStepReport> {
        self.sub_steps
            .iter()
            .filter(|s| matches!(s.status, SubStepStatus::FailedBestEffort { .. }))
    }

    /// One-line summary like "3 ran, 1 skipped"
    pub fn sub_step_summary(&self) -> String {
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for report in &self.sub_steps {
            let key = match report.status {
                SubStepStatus::Ran => "ran",
                SubStepStatus::Skipped => "skipped",
                SubStepStatus::NoOp => "no-op",
                SubStepStatus::FailedBestEffort { .. } => "failed",
            };
            *counts.entry(key).or_default() += 1;
        }
        counts
            .iter()
            .map(|(k, n)| format!("{n} {k}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Driver state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "index", rename_all = "snake_case")]
pub enum DriverState {
    Idle,
    Resolving,
    Executing(usize),
    Failed,
    Done,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Resolving => f.write_str("resolving"),
            Self::Executing(i) => write!(f, "executing({i})"),
            Self::Failed => f.write_str("failed"),
            Self::Done => f.write_str("done"),
        }
    }
}

/// Serializable error payload of a failed pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub code: u32,
    pub message: String,
}

impl From<&Error> for PipelineError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// A step that completed, with its outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step: StepKind,
    pub outcome: StepOutcome,
}

/// What `run_pipeline` hands back to its caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub cluster_id: String,
    pub profile: Profile,
    pub direction: Direction,
    pub state: DriverState,
    /// Steps that completed, in execution order
    pub completed_steps: Vec<StepKind>,
    /// Name of the first failing step, as supplied by the caller
    pub failed_step: Option<String>,
    pub error: Option<PipelineError>,
    pub outcomes: Vec<CompletedStep>,
}

impl PipelineResult {
    pub fn new(cluster_id: impl Into<String>, profile: Profile, direction: Direction) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            profile,
            direction,
            state: DriverState::Idle,
            completed_steps: Vec::new(),
            failed_step: None,
            error: None,
            outcomes: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == DriverState::Done && self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Whether re-submitting the same step list may succeed
    pub fn is_retryable(&self) -> bool {
        self.error_kind().is_some_and(|k| k.is_retryable())
    }

    pub(crate) fn record(&mut self, step: StepKind, outcome: StepOutcome) {
        self.completed_steps.push(step);
        self.outcomes.push(CompletedStep { step, outcome });
    }

    pub(crate) fn fail(&mut self, step: Option<String>, error: &Error) {
        self.state = DriverState::Failed;
        self.failed_step = step;
        self.error = Some(PipelineError::from(error));
    }
}
