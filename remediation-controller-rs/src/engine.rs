//! Boundary to the external pipeline execution engine.
//!
//! The engine accepts a job descriptor (bundle reference, parameters, idempotency key) and
//! reports a condition list plus per-step status. [`InMemoryExecutionEngine`] is a scripted
//! stand-in used by the daemon's simulation mode and by tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::model::JobHandle;

/// Condition kind carrying the overall verdict.
pub const SUCCEEDED_CONDITION: &str = "Succeeded";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("execution engine unavailable: {0}")]
    Unavailable(String),

    #[error("workflow bundle unreachable: {0}")]
    BundleUnreachable(String),

    #[error("invalid job parameters: {0}")]
    InvalidParameters(String),
}

impl EngineError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    /// Same key, same job: the engine must not start a second one.
    pub idempotency_key: String,
    pub bundle: String,
    pub workflow: String,
    pub parameters: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCondition {
    pub kind: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    Waiting,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub index: usize,
    pub name: String,
    pub sub_step: Option<String>,
    pub state: StepState,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub exit_code: Option<i32>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub conditions: Vec<JobCondition>,
    pub steps: Vec<StepStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn succeeded_condition(&self) -> Option<&JobCondition> {
        self.conditions.iter().find(|c| c.kind == SUCCEEDED_CONDITION)
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn submit(&self, descriptor: JobDescriptor) -> Result<JobHandle, EngineError>;

    /// `Ok(None)` when the engine no longer knows the job.
    async fn job_status(&self, handle: &JobHandle) -> Result<Option<JobStatus>, EngineError>;
}

#[derive(Debug, Clone)]
struct SimulatedJob {
    descriptor: JobDescriptor,
    handle: JobHandle,
    status: JobStatus,
    submitted_at: DateTime<Utc>,
}

/// Scripted in-process engine keyed by idempotency key.
#[derive(Debug)]
pub struct InMemoryExecutionEngine {
    clock: Arc<dyn Clock>,
    pipeline: Vec<String>,
    auto_complete_after: Option<Duration>,
    jobs: RwLock<HashMap<String, SimulatedJob>>,
    unreachable_bundles: RwLock<HashSet<String>>,
    submissions: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryExecutionEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            pipeline: vec![
                "validate-target".to_string(),
                "apply-remediation".to_string(),
                "verify-health".to_string(),
            ],
            auto_complete_after: None,
            jobs: RwLock::new(HashMap::new()),
            unreachable_bundles: RwLock::new(HashSet::new()),
            submissions: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Step names every simulated job runs through.
    pub fn with_pipeline(mut self, steps: &[&str]) -> Self {
        self.pipeline = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Report success once a job has been running this long.
    pub fn with_auto_complete(mut self, after: Duration) -> Self {
        self.auto_complete_after = Some(after);
        self
    }

    /// Number of `submit` calls, including idempotent repeats.
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Number of distinct jobs created.
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn descriptor(&self, idempotency_key: &str) -> Option<JobDescriptor> {
        self.jobs
            .read()
            .await
            .get(idempotency_key)
            .map(|j| j.descriptor.clone())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn reject_bundle(&self, bundle: &str) {
        self.unreachable_bundles.write().await.insert(bundle.to_string());
    }

    /// Mark every step succeeded and the job complete. Returns false for unknown jobs.
    pub async fn succeed(&self, idempotency_key: &str) -> bool {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(idempotency_key) {
            Some(job) => {
                finish_successfully(&mut job.status, now);
                true
            }
            None => false,
        }
    }

    /// Fail the job at step `index`; earlier steps succeed, later ones never start.
    pub async fn fail_step(
        &self,
        idempotency_key: &str,
        index: usize,
        reason: &str,
        message: &str,
        exit_code: Option<i32>,
    ) -> bool {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(idempotency_key) else {
            return false;
        };

        for step in job.status.steps.iter_mut() {
            if step.index < index {
                step.state = StepState::Succeeded;
                step.finished_at.get_or_insert(now);
            } else if step.index == index {
                step.state = StepState::Failed;
                step.reason = Some(reason.to_string());
                step.message = Some(message.to_string());
                step.exit_code = exit_code;
                step.finished_at = Some(now);
            } else {
                step.state = StepState::Waiting;
            }
        }
        job.status.completed_at = Some(now);
        job.status.conditions = vec![JobCondition {
            kind: SUCCEEDED_CONDITION.to_string(),
            status: ConditionStatus::False,
            reason: "Failed".to_string(),
            message: format!("step {} failed", index),
        }];
        true
    }

    /// Drop the job as if someone deleted it out-of-band.
    pub async fn remove_job(&self, idempotency_key: &str) -> bool {
        self.jobs.write().await.remove(idempotency_key).is_some()
    }

    fn initial_status(&self, now: DateTime<Utc>) -> JobStatus {
        JobStatus {
            conditions: vec![JobCondition {
                kind: SUCCEEDED_CONDITION.to_string(),
                status: ConditionStatus::Unknown,
                reason: "Running".to_string(),
                message: "pipeline is running".to_string(),
            }],
            steps: self
                .pipeline
                .iter()
                .enumerate()
                .map(|(index, name)| StepStatus {
                    index,
                    name: name.clone(),
                    sub_step: None,
                    state: if index == 0 { StepState::Running } else { StepState::Waiting },
                    reason: None,
                    message: None,
                    exit_code: None,
                    finished_at: None,
                })
                .collect(),
            started_at: Some(now),
            completed_at: None,
        }
    }
}

fn finish_successfully(status: &mut JobStatus, now: DateTime<Utc>) {
    for step in status.steps.iter_mut() {
        step.state = StepState::Succeeded;
        step.exit_code = Some(0);
        step.finished_at.get_or_insert(now);
    }
    status.completed_at = Some(now);
    status.conditions = vec![JobCondition {
        kind: SUCCEEDED_CONDITION.to_string(),
        status: ConditionStatus::True,
        reason: "Succeeded".to_string(),
        message: "all steps completed".to_string(),
    }];
}

fn is_running(status: &JobStatus) -> bool {
    status
        .succeeded_condition()
        .map_or(true, |c| c.status == ConditionStatus::Unknown)
}

#[async_trait]
impl ExecutionEngine for InMemoryExecutionEngine {
    async fn submit(&self, descriptor: JobDescriptor) -> Result<JobHandle, EngineError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("injected outage".to_string()));
        }
        if self.unreachable_bundles.read().await.contains(&descriptor.bundle) {
            return Err(EngineError::BundleUnreachable(descriptor.bundle));
        }
        if let Some(key) = descriptor.parameters.keys().find(|k| k.trim().is_empty()) {
            return Err(EngineError::InvalidParameters(format!("empty parameter name '{}'", key)));
        }

        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(&descriptor.idempotency_key) {
            tracing::debug!(job = %existing.handle.name, "idempotent resubmission; returning existing job");
            return Ok(existing.handle.clone());
        }

        let now = self.clock.now();
        let handle = JobHandle {
            name: descriptor.name.clone(),
            idempotency_key: descriptor.idempotency_key.clone(),
        };
        jobs.insert(
            descriptor.idempotency_key.clone(),
            SimulatedJob {
                handle: handle.clone(),
                status: self.initial_status(now),
                descriptor,
                submitted_at: now,
            },
        );
        Ok(handle)
    }

    async fn job_status(&self, handle: &JobHandle) -> Result<Option<JobStatus>, EngineError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("injected outage".to_string()));
        }

        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&handle.idempotency_key) else {
            return Ok(None);
        };

        if let Some(after) = self.auto_complete_after {
            let elapsed = (now - job.submitted_at).to_std().unwrap_or(Duration::ZERO);
            if is_running(&job.status) && elapsed >= after {
                finish_successfully(&mut job.status, now);
            }
        }

        Ok(Some(job.status.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn descriptor(key: &str) -> JobDescriptor {
        JobDescriptor {
            name: format!("{key}-run"),
            idempotency_key: key.to_string(),
            bundle: "registry.local/b@sha256:00".to_string(),
            workflow: "increase-memory@v1".to_string(),
            parameters: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_submit_is_idempotent() {
        let engine = InMemoryExecutionEngine::new(Arc::new(ManualClock::new(Utc::now())));
        let first = engine.submit(descriptor("uid-1")).await.unwrap();
        let second = engine.submit(descriptor("uid-1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.submission_count(), 2);
        assert_eq!(engine.job_count().await, 1);
    }

    #[tokio::test]
    async fn test_auto_complete_after_duration() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = InMemoryExecutionEngine::new(clock.clone()).with_auto_complete(Duration::from_secs(5));
        let handle = engine.submit(descriptor("uid-1")).await.unwrap();

        let status = engine.job_status(&handle).await.unwrap().unwrap();
        assert_eq!(status.succeeded_condition().unwrap().status, ConditionStatus::Unknown);

        clock.advance(chrono::Duration::seconds(6));
        let status = engine.job_status(&handle).await.unwrap().unwrap();
        assert_eq!(status.succeeded_condition().unwrap().status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn test_removed_job_reports_none() {
        let engine = InMemoryExecutionEngine::new(Arc::new(ManualClock::new(Utc::now())));
        let handle = engine.submit(descriptor("uid-1")).await.unwrap();
        assert!(engine.remove_job("uid-1").await);
        assert!(engine.job_status(&handle).await.unwrap().is_none());
    }
}
