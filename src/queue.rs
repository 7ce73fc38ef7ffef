//! Job model and the scheduler-owned queue.
//!
//! [`JobQueue`] is the single piece of mutable shared state in the system and
//! is owned exclusively by the orchestrator. Decisions for a cycle are applied
//! as one atomic batch: either every status transition commits, or none do.
//! Readers only ever receive cloned snapshots of committed state.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GridFlexError;
use crate::policy::{Decision, DecisionAction};

/// Classes of compute workload the datacenter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    LlmTraining,
    ImageTraining,
    InferenceBatch,
    InferenceRealtime,
    DataProcessing,
    ModelFinetuning,
}

/// Lifecycle status of a job. Only the orchestrator mutates this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Deferred,
    Running,
    Completed,
}

/// A deferrable compute job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub workload_type: WorkloadType,
    /// Energy the job will draw, in kWh. Positive, capped at site capacity.
    pub energy_kwh: f64,
    /// Critical jobs execute immediately, always.
    pub critical: bool,
    pub submitted_at: DateTime<Utc>,
    /// Maximum delay before the job must run regardless of grid conditions.
    /// Zero for critical jobs.
    pub max_deferral_hours: i64,
    pub status: JobStatus,
    pub deferred_until: Option<DateTime<Utc>>,
}

/// Site capacity cap, in kWh per job.
const MAX_JOB_ENERGY_KWH: f64 = 1000.0;

impl Job {
    pub fn new(
        workload_type: WorkloadType,
        energy_kwh: f64,
        critical: bool,
        max_deferral_hours: i64,
    ) -> Result<Self, GridFlexError> {
        if energy_kwh <= 0.0 {
            return Err(GridFlexError::InvalidJob(
                "energy requirement must be positive".into(),
            ));
        }
        if energy_kwh > MAX_JOB_ENERGY_KWH {
            return Err(GridFlexError::InvalidJob(format!(
                "energy requirement {energy_kwh} kWh exceeds site capacity ({MAX_JOB_ENERGY_KWH} kWh)"
            )));
        }
        if !(0..=48).contains(&max_deferral_hours) {
            return Err(GridFlexError::InvalidJob(format!(
                "deferral window {max_deferral_hours}h outside 0..=48h"
            )));
        }

        Ok(Self {
            id: format!("job_{}", Uuid::new_v4().simple()),
            workload_type,
            energy_kwh,
            critical,
            submitted_at: Utc::now(),
            // A critical job carries no window, whatever the caller passed.
            max_deferral_hours: if critical { 0 } else { max_deferral_hours },
            status: JobStatus::Queued,
            deferred_until: None,
        })
    }

    /// Latest moment the job may still be waiting.
    pub fn deferral_deadline(&self) -> DateTime<Utc> {
        self.submitted_at + Duration::hours(self.max_deferral_hours)
    }

    /// Deferral window still open at `now`. Non-positive means the job must
    /// execute immediately.
    pub fn remaining_deferral(&self, now: DateTime<Utc>) -> Duration {
        self.deferral_deadline() - now
    }

    /// Generate a plausible workload for demos. Real deployments feed jobs
    /// from the cluster scheduler instead.
    pub fn simulated() -> Self {
        let mut rng = rand::thread_rng();

        const TYPES: [WorkloadType; 6] = [
            WorkloadType::LlmTraining,
            WorkloadType::ImageTraining,
            WorkloadType::InferenceBatch,
            WorkloadType::InferenceRealtime,
            WorkloadType::DataProcessing,
            WorkloadType::ModelFinetuning,
        ];
        let workload_type = TYPES[rng.gen_range(0..TYPES.len())];

        let (energy_range, deferral_range) = match workload_type {
            WorkloadType::LlmTraining => ((100.0, 500.0), (4, 12)),
            WorkloadType::ImageTraining => ((50.0, 200.0), (4, 12)),
            WorkloadType::InferenceBatch => ((10.0, 50.0), (12, 24)),
            WorkloadType::InferenceRealtime => ((1.0, 10.0), (0, 0)),
            WorkloadType::DataProcessing => ((20.0, 100.0), (12, 24)),
            WorkloadType::ModelFinetuning => ((50.0, 150.0), (1, 8)),
        };

        let critical = workload_type == WorkloadType::InferenceRealtime;
        let energy: f64 = rng.gen_range(energy_range.0..=energy_range.1);
        let deferral = if critical {
            0
        } else {
            rng.gen_range(deferral_range.0..=deferral_range.1)
        };

        Job::new(workload_type, (energy * 100.0).round() / 100.0, critical, deferral)
            .expect("simulated job within bounds")
    }
}

/// The pending/deferred/running job set, owned by the orchestrator.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Vec<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn submit(&mut self, job: Job) -> String {
        let id = job.id.clone();
        self.jobs.push(job);
        id
    }

    /// Jobs to evaluate this cycle: everything Queued, plus Deferred jobs
    /// whose hold has elapsed or whose window has expired (those are forced
    /// through the deadline override).
    pub fn eligible(&self, now: DateTime<Utc>) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|job| match job.status {
                JobStatus::Queued => true,
                JobStatus::Deferred => {
                    job.deferred_until.is_none_or(|until| until <= now)
                        || job.remaining_deferral(now) <= Duration::zero()
                }
                JobStatus::Running | JobStatus::Completed => false,
            })
            .cloned()
            .collect()
    }

    /// Currently deferred jobs — the capacity pool offered to the market.
    pub fn deferred(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|job| job.status == JobStatus::Deferred)
            .cloned()
            .collect()
    }

    /// Apply a cycle's decisions as one atomic batch.
    ///
    /// The whole batch is validated before any job is touched, so a violation
    /// leaves the queue exactly as it was. Deferring a critical job is a logic
    /// bug, not an environment issue, and fails the batch loudly.
    pub fn apply(&mut self, decisions: &[Decision]) -> Result<(), GridFlexError> {
        for decision in decisions {
            let job = self
                .jobs
                .iter()
                .find(|j| j.id == decision.job_id)
                .ok_or_else(|| GridFlexError::JobNotFound(decision.job_id.clone()))?;
            if job.critical && decision.action == DecisionAction::Defer {
                return Err(GridFlexError::Invariant(format!(
                    "critical job {} would be deferred",
                    job.id
                )));
            }
        }

        for decision in decisions {
            let job = self
                .jobs
                .iter_mut()
                .find(|j| j.id == decision.job_id)
                .expect("validated above");
            match decision.action {
                DecisionAction::ExecuteNow => {
                    job.status = JobStatus::Running;
                    job.deferred_until = None;
                }
                DecisionAction::Defer => {
                    job.status = JobStatus::Deferred;
                    job.deferred_until = decision.defer_until;
                }
            }
        }
        Ok(())
    }

    /// Mark a running job finished. Called by the execution collaborator.
    pub fn complete(&mut self, job_id: &str) -> Result<(), GridFlexError> {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| GridFlexError::JobNotFound(job_id.to_string()))?;
        job.status = JobStatus::Completed;
        Ok(())
    }

    /// Committed state for external readers.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.clone()
    }
}
