//! Translation of the delegated job's conditions into the request lifecycle.
//!
//! The translator is pure: it looks at the request and the job status and says what should
//! happen. Only requests currently Running can be translated, so re-applying it to a
//! terminal request always yields [`Translation::NoChange`].

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::engine::{ConditionStatus, JobStatus, StepState, StepStatus};
use crate::model::{ExecutionRequest, FailureDetail, FailureReason, Phase, RequestStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    /// Still in progress; poll again later.
    NoChange,
    Completed { completed_at: DateTime<Utc> },
    Failed(FailureDetail),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusTranslator;

impl StatusTranslator {
    /// `job` is `None` when the engine no longer knows the job.
    pub fn translate(
        &self,
        request: &ExecutionRequest,
        job: Option<&JobStatus>,
        now: DateTime<Utc>,
    ) -> Translation {
        let Some(status) = request.status.as_ref().filter(|s| s.phase == Phase::Running) else {
            return Translation::NoChange;
        };

        let Some(job) = job else {
            return Translation::Failed(job_deleted(request, status, now));
        };

        match job.succeeded_condition().map(|c| c.status) {
            Some(ConditionStatus::True) => Translation::Completed {
                completed_at: job.completed_at.unwrap_or(now),
            },
            Some(ConditionStatus::False) => Translation::Failed(extract_failure(request, status, job, now)),
            _ => match timed_out(request, status, job, now) {
                Some(detail) => Translation::Failed(detail),
                None => Translation::NoChange,
            },
        }
    }
}

/// Best-effort mapping of an engine failure cause onto the closed reason set.
pub fn classify_failure(reason: &str, message: &str) -> FailureReason {
    let text = format!("{} {}", reason, message).to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));
    let denied = text
        .find("cannot")
        .map_or(false, |at| text[at..].contains("permission"));
    // "insufficient permissions" is an access problem, not a capacity one
    let starved = text.contains("insufficient") && !text.contains("permission");

    if has(&["oomkilled", "oom-killed", "out of memory", "memory limit exceeded"]) {
        FailureReason::OOMKilled
    } else if has(&["imagepullbackoff", "errimagepull", "image pull", "pull image"]) {
        FailureReason::ImagePullBackOff
    } else if has(&[
        "exceeded quota",
        "resourceexhausted",
        "resource exhausted",
        "no space left",
    ]) || starved
    {
        // quota errors also say "forbidden", so this check comes first
        FailureReason::ResourceExhausted
    } else if has(&["deadlineexceeded", "deadline exceeded", "timed out", "timeout"]) {
        FailureReason::DeadlineExceeded
    } else if denied || has(&["forbidden", "unauthorized", "rbac", "access denied", "permission denied", "insufficient permission"]) {
        FailureReason::Forbidden
    } else if has(&[
        "createcontainerconfigerror",
        "invalidparameter",
        "invalid parameter",
        "configuration",
        "missing required",
    ]) {
        FailureReason::ConfigurationError
    } else {
        FailureReason::Unknown
    }
}

/// Failure detail for problems found before anything ran on the target.
pub fn pre_execution_failure(
    request: &ExecutionRequest,
    stage: &str,
    reason: FailureReason,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> FailureDetail {
    let mut detail = FailureDetail {
        failed_task_index: 0,
        failed_task_name: stage.to_string(),
        failed_step_name: None,
        reason,
        message: message.into(),
        exit_code: None,
        failure_time: now,
        execution_time_before_failure: Duration::ZERO,
        natural_language_summary: String::new(),
        was_execution_failure: false,
    };
    detail.natural_language_summary = summarize(request, &detail);
    detail
}

/// Human-readable duration: `45s`, `2m 5s`, `1h 3m`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m, s) {
        (0, 0, s) => format!("{s}s"),
        (0, m, 0) => format!("{m}m"),
        (0, m, s) => format!("{m}m {s}s"),
        (h, 0, _) => format!("{h}h"),
        (h, m, _) => format!("{h}h {m}m"),
    }
}

fn elapsed_between(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Duration {
    start
        .and_then(|s| (end - s).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

fn non_empty(s: &String) -> bool {
    !s.trim().is_empty()
}

/// The step to blame: the one marked failed, else the first that did not succeed.
fn failed_step(job: &JobStatus) -> Option<&StepStatus> {
    job.steps
        .iter()
        .find(|s| s.state == StepState::Failed)
        .or_else(|| job.steps.iter().find(|s| s.state != StepState::Succeeded))
}

fn extract_failure(
    request: &ExecutionRequest,
    status: &RequestStatus,
    job: &JobStatus,
    now: DateTime<Utc>,
) -> FailureDetail {
    let condition = job.succeeded_condition();
    let step = failed_step(job);

    let reason_text = step
        .and_then(|s| s.reason.clone())
        .or_else(|| condition.map(|c| c.reason.clone()))
        .unwrap_or_default();
    let message = step
        .and_then(|s| s.message.clone())
        .filter(non_empty)
        .or_else(|| condition.map(|c| c.message.clone()).filter(non_empty))
        .unwrap_or_else(|| "pipeline reported failure without a message".to_string());

    let failure_time = step
        .and_then(|s| s.finished_at)
        .or(job.completed_at)
        .unwrap_or(now);

    let mut detail = FailureDetail {
        failed_task_index: step.map_or(0, |s| s.index),
        failed_task_name: step.map_or_else(|| "unknown".to_string(), |s| s.name.clone()),
        failed_step_name: step.and_then(|s| s.sub_step.clone()),
        reason: classify_failure(&reason_text, &message),
        message,
        exit_code: step.and_then(|s| s.exit_code),
        failure_time,
        execution_time_before_failure: elapsed_between(status.started_at.or(job.started_at), failure_time),
        natural_language_summary: String::new(),
        was_execution_failure: true,
    };
    detail.natural_language_summary = summarize(request, &detail);
    detail
}

fn job_deleted(request: &ExecutionRequest, status: &RequestStatus, now: DateTime<Utc>) -> FailureDetail {
    let job_name = status.job.as_ref().map_or("<unknown>", |j| j.name.as_str());
    let mut detail = FailureDetail {
        failed_task_index: 0,
        failed_task_name: "job".to_string(),
        failed_step_name: None,
        reason: FailureReason::JobDeleted,
        message: format!("delegated job {} no longer exists", job_name),
        exit_code: None,
        failure_time: now,
        execution_time_before_failure: elapsed_between(status.started_at, now),
        natural_language_summary: String::new(),
        was_execution_failure: false,
    };
    detail.natural_language_summary = summarize(request, &detail);
    detail
}

fn timed_out(
    request: &ExecutionRequest,
    status: &RequestStatus,
    job: &JobStatus,
    now: DateTime<Utc>,
) -> Option<FailureDetail> {
    let limit = Duration::from_secs(request.spec.timeout_seconds?);
    let elapsed = elapsed_between(status.started_at, now);
    if elapsed <= limit {
        return None;
    }

    let step = failed_step(job);
    let mut detail = FailureDetail {
        failed_task_index: step.map_or(0, |s| s.index),
        failed_task_name: step.map_or_else(|| "unknown".to_string(), |s| s.name.clone()),
        failed_step_name: step.and_then(|s| s.sub_step.clone()),
        reason: FailureReason::DeadlineExceeded,
        message: format!("execution exceeded its timeout of {}", format_elapsed(limit)),
        exit_code: None,
        failure_time: now,
        execution_time_before_failure: elapsed,
        natural_language_summary: String::new(),
        was_execution_failure: true,
    };
    detail.natural_language_summary = summarize(request, &detail);
    Some(detail)
}

/// One paragraph a downstream consumer can show without interpreting the other fields.
fn summarize(request: &ExecutionRequest, detail: &FailureDetail) -> String {
    let workflow = request.spec.workflow.identity();
    let target = &request.spec.target;
    let elapsed = format_elapsed(detail.execution_time_before_failure);
    let step = match &detail.failed_step_name {
        Some(sub) => format!("'{}' (sub-step '{}')", detail.failed_task_name, sub),
        None => format!("'{}'", detail.failed_task_name),
    };

    if detail.was_execution_failure {
        let exit = detail
            .exit_code
            .map(|c| format!(" The step exited with code {}.", c))
            .unwrap_or_default();
        format!(
            "Remediation workflow {} failed against {} at step {} (index {}) after {} of execution. \
             The failure was classified as {}: {}.{} Manual review of the target is required before \
             any further remediation is attempted.",
            workflow,
            target,
            step,
            detail.failed_task_index,
            elapsed,
            detail.reason,
            detail.message.trim_end_matches('.'),
            exit
        )
    } else if detail.reason == FailureReason::JobDeleted {
        format!(
            "Remediation workflow {} against {} lost its delegated job after {}: {}. \
             The outcome on the target is unknown and should be checked.",
            workflow, target, elapsed, detail.message
        )
    } else {
        format!(
            "Remediation workflow {} for {} failed before execution started, during {}. \
             The failure was classified as {}: {}. No changes were made to the target.",
            workflow,
            target,
            detail.failed_task_name,
            detail.reason,
            detail.message.trim_end_matches('.')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{JobCondition, SUCCEEDED_CONDITION};
    use crate::model::{JobHandle, RequestSpec, WorkflowRef};
    use chrono::Duration as ChronoDuration;

    fn running_request(started: DateTime<Utc>, timeout_seconds: Option<u64>) -> ExecutionRequest {
        let mut r = ExecutionRequest::new(
            "req-a",
            Some("payment"),
            RequestSpec {
                target: "payment/deployment/payment-api".to_string(),
                workflow: WorkflowRef {
                    name: "increase-memory".to_string(),
                    version: "v1".to_string(),
                    bundle: format!("registry.local/increase-memory@sha256:{}", "0".repeat(64)),
                },
                parameters: Default::default(),
                timeout_seconds,
            },
            started,
        );
        let job = JobHandle {
            name: "req-a-run".to_string(),
            idempotency_key: r.uid().to_string(),
        };
        r.status = Some(RequestStatus::pending(started).start(job, started).unwrap());
        r
    }

    fn step(index: usize, name: &str, state: StepState) -> StepStatus {
        StepStatus {
            index,
            name: name.to_string(),
            sub_step: None,
            state,
            reason: None,
            message: None,
            exit_code: None,
            finished_at: None,
        }
    }

    fn job(condition: ConditionStatus, steps: Vec<StepStatus>) -> JobStatus {
        JobStatus {
            conditions: vec![JobCondition {
                kind: SUCCEEDED_CONDITION.to_string(),
                status: condition,
                reason: "Failed".to_string(),
                message: "pipeline failed".to_string(),
            }],
            steps,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_rbac_denial_at_second_step() {
        let t0 = Utc::now();
        let request = running_request(t0, None);
        let mut failing = step(1, "patch-deployment", StepState::Failed);
        failing.reason = Some("Error".to_string());
        failing.message = Some(
            "deployments.apps \"payment-api\" is forbidden: User \"system:serviceaccount:remediation:runner\" cannot patch resource \"deployments\"".to_string(),
        );
        failing.exit_code = Some(1);
        failing.finished_at = Some(t0 + ChronoDuration::seconds(95));
        let status = job(
            ConditionStatus::False,
            vec![
                step(0, "validate-target", StepState::Succeeded),
                failing,
                step(2, "verify-health", StepState::Waiting),
            ],
        );

        let Translation::Failed(detail) = StatusTranslator.translate(&request, Some(&status), t0 + ChronoDuration::seconds(100)) else {
            panic!("expected failure");
        };
        assert_eq!(detail.reason, FailureReason::Forbidden);
        assert_eq!(detail.failed_task_index, 1);
        assert_eq!(detail.failed_task_name, "patch-deployment");
        assert_eq!(detail.exit_code, Some(1));
        assert_eq!(detail.execution_time_before_failure, Duration::from_secs(95));
        assert!(detail.was_execution_failure);
        assert!(detail.natural_language_summary.contains("patch-deployment"));
        assert!(detail.natural_language_summary.contains("payment/deployment/payment-api"));
        assert!(detail.natural_language_summary.contains("1m 35s"));
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify_failure("OOMKilled", ""), FailureReason::OOMKilled);
        assert_eq!(classify_failure("", "container ran out of memory"), FailureReason::OOMKilled);
        assert_eq!(
            classify_failure("", "pods \"x\" is forbidden: exceeded quota: compute-resources"),
            FailureReason::ResourceExhausted
        );
        assert_eq!(classify_failure("ErrImagePull", "back-off"), FailureReason::ImagePullBackOff);
        assert_eq!(classify_failure("TaskRunTimeout", "timed out after 10m"), FailureReason::DeadlineExceeded);
        assert_eq!(
            classify_failure("CreateContainerConfigError", "secret not found"),
            FailureReason::ConfigurationError
        );
        assert_eq!(classify_failure("Error", "exit status 2"), FailureReason::Unknown);
    }

    #[test]
    fn test_classification_broad_needles() {
        assert_eq!(
            classify_failure("Unschedulable", "0/3 nodes are available: 3 Insufficient ephemeral-storage"),
            FailureReason::ResourceExhausted
        );
        assert_eq!(
            classify_failure("Error", "invalid configuration: volume mount path missing"),
            FailureReason::ConfigurationError
        );
        assert_eq!(
            classify_failure("Error", "user cannot delete pods: no permission"),
            FailureReason::Forbidden
        );
        assert_eq!(
            classify_failure("Error", "insufficient permissions to patch deployment"),
            FailureReason::Forbidden
        );
        assert_eq!(
            classify_failure("Error", "permission checks passed but the pod cannot start"),
            FailureReason::Unknown
        );
    }

    #[test]
    fn test_success_and_in_progress() {
        let t0 = Utc::now();
        let request = running_request(t0, None);

        let mut done = job(ConditionStatus::True, vec![step(0, "a", StepState::Succeeded)]);
        done.completed_at = Some(t0 + ChronoDuration::seconds(30));
        assert_eq!(
            StatusTranslator.translate(&request, Some(&done), t0 + ChronoDuration::seconds(40)),
            Translation::Completed { completed_at: t0 + ChronoDuration::seconds(30) }
        );

        let busy = job(ConditionStatus::Unknown, vec![step(0, "a", StepState::Running)]);
        assert_eq!(StatusTranslator.translate(&request, Some(&busy), t0), Translation::NoChange);
    }

    #[test]
    fn test_missing_job_is_not_an_execution_failure() {
        let t0 = Utc::now();
        let request = running_request(t0, None);
        let Translation::Failed(detail) = StatusTranslator.translate(&request, None, t0) else {
            panic!("expected failure");
        };
        assert_eq!(detail.reason, FailureReason::JobDeleted);
        assert!(!detail.was_execution_failure);
    }

    #[test]
    fn test_terminal_requests_do_not_translate() {
        let t0 = Utc::now();
        let mut request = running_request(t0, None);
        request.status = Some(request.status.as_ref().unwrap().complete(t0, t0).unwrap());
        let failed = job(ConditionStatus::False, vec![step(0, "a", StepState::Failed)]);

        assert_eq!(StatusTranslator.translate(&request, Some(&failed), t0), Translation::NoChange);
        assert_eq!(StatusTranslator.translate(&request, None, t0), Translation::NoChange);
    }

    #[test]
    fn test_timeout_fails_running_job() {
        let t0 = Utc::now();
        let request = running_request(t0, Some(60));
        let busy = job(
            ConditionStatus::Unknown,
            vec![step(0, "a", StepState::Succeeded), step(1, "b", StepState::Running)],
        );

        assert_eq!(
            StatusTranslator.translate(&request, Some(&busy), t0 + ChronoDuration::seconds(30)),
            Translation::NoChange
        );
        let Translation::Failed(detail) =
            StatusTranslator.translate(&request, Some(&busy), t0 + ChronoDuration::seconds(61))
        else {
            panic!("expected timeout");
        };
        assert_eq!(detail.reason, FailureReason::DeadlineExceeded);
        assert_eq!(detail.failed_task_name, "b");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(45)), "45s");
        assert_eq!(format_elapsed(Duration::from_secs(300)), "5m");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_elapsed(Duration::from_secs(3780)), "1h 3m");
    }
}
