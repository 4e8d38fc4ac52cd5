//! Run state and result types.

use crate::definition::{DimensionAssignment, format_assignment};
use crate::ids::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one job instance: the job name plus its matrix binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceKey {
    pub job: String,
    pub assignment: DimensionAssignment,
}

impl InstanceKey {
    pub fn new(job: impl Into<String>, assignment: DimensionAssignment) -> Self {
        Self {
            job: job.into(),
            assignment,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.assignment.is_empty() {
            write!(f, "{}", self.job)
        } else {
            write!(f, "{} ({})", self.job, format_assignment(&self.assignment))
        }
    }
}

/// Instance lifecycle: `pending → running → {succeeded, failed, skipped}`.
/// `skipped` is reachable directly from `pending`; terminal states are
/// final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Succeeded | InstanceStatus::Failed | InstanceStatus::Skipped
        )
    }
}

/// Why an instance was skipped without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The job-level condition evaluated to false for this run.
    ConditionFalse,
    /// A needed job finished with a failed instance.
    UpstreamFailed,
    /// A sibling instance failed under `fail_fast`.
    FailFast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Result of one step within an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Key the cache restore matched, when the step declared a cache.
    pub cache_restored_key: Option<String>,
}

impl StepOutcome {
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            duration_ms: 0,
            cache_restored_key: None,
        }
    }
}

/// Terminal result of one job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceResult {
    pub key: InstanceKey,
    pub status: InstanceStatus,
    pub skip_reason: Option<SkipReason>,
    pub steps: Vec<StepOutcome>,
    pub timed_out: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl InstanceResult {
    pub fn skipped(key: InstanceKey, reason: SkipReason) -> Self {
        Self {
            key,
            status: InstanceStatus::Skipped,
            skip_reason: Some(reason),
            steps: Vec::new(),
            timed_out: false,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn timed_out(key: InstanceKey) -> Self {
        Self {
            key,
            status: InstanceStatus::Failed,
            skip_reason: None,
            steps: Vec::new(),
            timed_out: true,
            started_at: None,
            completed_at: Some(Utc::now()),
        }
    }
}

/// Per-job results in instance order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job: String,
    pub instances: Vec<InstanceResult>,
}

impl JobReport {
    pub fn failed(&self) -> bool {
        self.instances
            .iter()
            .any(|i| i.status == InstanceStatus::Failed)
    }
}

/// Complete report of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub jobs: Vec<JobReport>,
    pub duration_ms: u64,
}

impl RunReport {
    /// The run succeeds when no non-skipped instance failed; the CLI maps
    /// this straight onto its exit code.
    pub fn success(&self) -> bool {
        !self.jobs.iter().any(|j| j.failed())
    }

    pub fn instances(&self) -> impl Iterator<Item = &InstanceResult> {
        self.jobs.iter().flat_map(|j| j.instances.iter())
    }
}
