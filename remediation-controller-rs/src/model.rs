//! Execution request data model and its status state machine.
//!
//! Only [`RequestStatus`] is owned by the controller; everything under `metadata` and `spec`
//! is written by the parent orchestrator and treated as immutable input.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};

/// Cleanup marker that keeps a request around until its final audit write has been attempted.
pub const CLEANUP_MARKER: &str = "remediation.io/audit-cleanup";

/// `namespace/name` key of a request in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub uid: String,
    /// Bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub owner: Option<OwnerReference>,
    #[serde(default)]
    pub cleanup_markers: Vec<String>,
    #[serde(default)]
    pub deletion_requested_at: Option<DateTime<Utc>>,
}

/// Content-addressed reference to an immutable workflow bundle: `<repository>@sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleRef {
    pub repository: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BundleRefError {
    #[error("bundle reference '{0}' is not content-addressed (expected <repository>@sha256:<digest>)")]
    NotDigest(String),

    #[error("bundle reference '{0}' has an invalid sha256 digest")]
    InvalidDigest(String),
}

impl BundleRef {
    pub fn parse(reference: &str) -> std::result::Result<Self, BundleRefError> {
        let (repository, digest) = reference
            .split_once('@')
            .ok_or_else(|| BundleRefError::NotDigest(reference.to_string()))?;
        let hex = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| BundleRefError::NotDigest(reference.to_string()))?;

        if repository.is_empty() {
            return Err(BundleRefError::NotDigest(reference.to_string()));
        }
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BundleRefError::InvalidDigest(reference.to_string()));
        }

        Ok(Self {
            repository: repository.to_string(),
            digest: digest.to_string(),
        })
    }
}

impl fmt::Display for BundleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.digest)
    }
}

/// Logical identity of a remediation workflow plus the bundle that implements it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRef {
    pub name: String,
    pub version: String,
    pub bundle: String,
}

impl WorkflowRef {
    /// `name@version`, the value compared by the cooldown check.
    pub fn identity(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    pub fn same_workflow(&self, other: &WorkflowRef) -> bool {
        self.name == other.name && self.version == other.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    pub target: String,
    pub workflow: WorkflowRef,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Fail the request if it stays Running longer than this.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Skipped)
    }

    /// Holding the target: Pending or Running.
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Pending | Phase::Running)
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Pending, Phase::Running)
                | (Phase::Pending, Phase::Skipped)
                | (Phase::Pending, Phase::Failed)
                | (Phase::Running, Phase::Completed)
                | (Phase::Running, Phase::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
            Phase::Skipped => "Skipped",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle of the delegated job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub name: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("Success"),
            Outcome::Failure => f.write_str("Failure"),
            Outcome::Skipped => f.write_str("Skipped"),
        }
    }
}

/// Closed set of failure reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    OOMKilled,
    DeadlineExceeded,
    Forbidden,
    ResourceExhausted,
    ConfigurationError,
    ImagePullBackOff,
    Unknown,
    /// Request was structurally invalid.
    ValidationFailed,
    /// Engine refused the job descriptor.
    DispatchFailed,
    /// Delegated job disappeared out-of-band.
    JobDeleted,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::OOMKilled => "OOMKilled",
            FailureReason::DeadlineExceeded => "DeadlineExceeded",
            FailureReason::Forbidden => "Forbidden",
            FailureReason::ResourceExhausted => "ResourceExhausted",
            FailureReason::ConfigurationError => "ConfigurationError",
            FailureReason::ImagePullBackOff => "ImagePullBackOff",
            FailureReason::Unknown => "Unknown",
            FailureReason::ValidationFailed => "ValidationFailed",
            FailureReason::DispatchFailed => "DispatchFailed",
            FailureReason::JobDeleted => "JobDeleted",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
    pub failed_task_index: usize,
    pub failed_task_name: String,
    pub failed_step_name: Option<String>,
    pub reason: FailureReason,
    pub message: String,
    pub exit_code: Option<i32>,
    pub failure_time: DateTime<Utc>,
    #[serde(rename = "executionTimeBeforeFailureMs", with = "duration_ms")]
    pub execution_time_before_failure: Duration,
    pub natural_language_summary: String,
    /// `true` when the pipeline itself failed; `false` for validation, dispatch and lost jobs.
    pub was_execution_failure: bool,
}

/// Durations on the wire are whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl FailureDetail {
    /// Failures inside the pipeline need a human to look at the target before anything else runs.
    pub fn requires_manual_review(&self) -> bool {
        self.was_execution_failure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    ResourceBusy,
    RecentlyRemediated,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ResourceBusy => f.write_str("ResourceBusy"),
            SkipReason::RecentlyRemediated => f.write_str("RecentlyRemediated"),
        }
    }
}

/// The sibling request that caused a skip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictingRequest {
    pub name: String,
    pub workflow: String,
    /// Start (busy) or completion (cooldown) time of the sibling.
    pub timestamp: DateTime<Utc>,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipDetail {
    pub reason: SkipReason,
    pub message: String,
    pub skipped_at: DateTime<Utc>,
    pub conflicting: ConflictingRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    pub phase: Phase,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub job: Option<JobHandle>,
    pub outcome: Option<Outcome>,
    pub failure: Option<FailureDetail>,
    pub skip: Option<SkipDetail>,
    pub message: Option<String>,
    pub last_transition_at: DateTime<Utc>,
}

impl RequestStatus {
    /// Status written on the first observation of a valid request.
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            phase: Phase::Pending,
            started_at: None,
            completed_at: None,
            job: None,
            outcome: None,
            failure: None,
            skip: None,
            message: Some("waiting for lock evaluation".to_string()),
            last_transition_at: now,
        }
    }

    /// Status written when the first observation finds the request invalid.
    pub fn rejected(detail: FailureDetail, now: DateTime<Utc>) -> Self {
        Self {
            phase: Phase::Failed,
            started_at: None,
            completed_at: Some(now),
            job: None,
            outcome: Some(Outcome::Failure),
            message: Some(detail.message.clone()),
            failure: Some(detail),
            skip: None,
            last_transition_at: now,
        }
    }

    pub fn start(&self, job: JobHandle, now: DateTime<Utc>) -> Result<Self> {
        self.guard(Phase::Running)?;
        Ok(Self {
            phase: Phase::Running,
            started_at: Some(now),
            message: Some(format!("delegated job {} running", job.name)),
            job: Some(job),
            last_transition_at: now,
            ..self.clone()
        })
    }

    pub fn skip(&self, detail: SkipDetail, now: DateTime<Utc>) -> Result<Self> {
        self.guard(Phase::Skipped)?;
        Ok(Self {
            phase: Phase::Skipped,
            completed_at: Some(now),
            outcome: Some(Outcome::Skipped),
            message: Some(detail.message.clone()),
            skip: Some(detail),
            last_transition_at: now,
            ..self.clone()
        })
    }

    pub fn complete(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<Self> {
        self.guard(Phase::Completed)?;
        Ok(Self {
            phase: Phase::Completed,
            completed_at: Some(at),
            outcome: Some(Outcome::Success),
            message: Some("remediation workflow completed successfully".to_string()),
            last_transition_at: now,
            ..self.clone()
        })
    }

    pub fn fail(&self, detail: FailureDetail, now: DateTime<Utc>) -> Result<Self> {
        self.guard(Phase::Failed)?;
        Ok(Self {
            phase: Phase::Failed,
            completed_at: Some(detail.failure_time),
            outcome: Some(Outcome::Failure),
            message: Some(detail.message.clone()),
            failure: Some(detail),
            last_transition_at: now,
            ..self.clone()
        })
    }

    fn guard(&self, next: Phase) -> Result<()> {
        if self.phase.can_transition_to(next) {
            Ok(())
        } else {
            Err(ControllerError::InvalidTransition {
                from: self.phase.to_string(),
                to: next,
            })
        }
    }

    /// Check the detail/handle invariants. Pre-execution failures carry no job handle.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.failure.is_some() != (self.phase == Phase::Failed) {
            return Err(format!("failure detail present in phase {}", self.phase));
        }
        if self.skip.is_some() != (self.phase == Phase::Skipped) {
            return Err(format!("skip detail present in phase {}", self.phase));
        }
        match self.phase {
            Phase::Running | Phase::Completed if self.job.is_none() => {
                Err(format!("phase {} without a job handle", self.phase))
            }
            Phase::Pending | Phase::Skipped if self.job.is_some() => {
                Err(format!("phase {} with a job handle", self.phase))
            }
            _ => Ok(()),
        }
    }
}

/// The unit of delegated remediation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub metadata: ObjectMeta,
    pub spec: RequestSpec,
    #[serde(default)]
    pub status: Option<RequestStatus>,
}

impl ExecutionRequest {
    pub fn new(name: &str, namespace: Option<&str>, spec: RequestSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
                uid: uuid::Uuid::new_v4().to_string(),
                resource_version: 0,
                created_at,
                owner: None,
                cleanup_markers: Vec::new(),
                deletion_requested_at: None,
            },
            spec,
            status: None,
        }
    }

    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.metadata.owner = Some(owner);
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.metadata.namespace.as_deref(), &self.metadata.name)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    /// `None` until the first observation.
    pub fn phase(&self) -> Option<Phase> {
        self.status.as_ref().map(|s| s.phase)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_requested_at.is_some()
    }

    pub fn has_cleanup_marker(&self) -> bool {
        self.metadata.cleanup_markers.iter().any(|m| m == CLEANUP_MARKER)
    }

    /// Ordering used to break ties between Pending siblings: older first, then by name.
    pub fn precedes(&self, other: &ExecutionRequest) -> bool {
        (self.metadata.created_at, &self.metadata.name) < (other.metadata.created_at, &other.metadata.name)
    }
}
