//! Hand-off of an allowed request to the execution engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::engine::{EngineError, ExecutionEngine, JobDescriptor};
use crate::error::Result;
use crate::model::{ExecutionRequest, FailureDetail, FailureReason, JobHandle};
use crate::status::pre_execution_failure;

pub const LABEL_REQUEST_UID: &str = "remediation.io/request-uid";
pub const LABEL_REQUEST_NAME: &str = "remediation.io/request-name";
pub const LABEL_WORKFLOW: &str = "remediation.io/workflow";

const MAX_JOB_NAME_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Dispatched(JobHandle),
    /// The engine refused the job for a reason retrying will not fix.
    Rejected(FailureDetail),
}

#[derive(Clone)]
pub struct ExecutionDispatcher {
    engine: Arc<dyn ExecutionEngine>,
}

impl ExecutionDispatcher {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self { engine }
    }

    /// Submit the request's job. The idempotency key is the request uid, so a retry after a
    /// lost status write returns the job that already exists.
    pub async fn dispatch(&self, request: &ExecutionRequest, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let descriptor = job_descriptor(request);
        let job_name = descriptor.name.clone();

        match self.engine.submit(descriptor).await {
            Ok(handle) => {
                info!(request = %request.name(), job = %handle.name, "dispatched remediation job");
                Ok(DispatchOutcome::Dispatched(handle))
            }
            Err(EngineError::BundleUnreachable(bundle)) => {
                warn!(request = %request.name(), %bundle, "workflow bundle unreachable");
                Ok(DispatchOutcome::Rejected(pre_execution_failure(
                    request,
                    "dispatch",
                    FailureReason::DispatchFailed,
                    format!("workflow bundle {} could not be resolved for job {}", bundle, job_name),
                    now,
                )))
            }
            Err(EngineError::InvalidParameters(reason)) => {
                warn!(request = %request.name(), %reason, "engine rejected job parameters");
                Ok(DispatchOutcome::Rejected(pre_execution_failure(
                    request,
                    "dispatch",
                    FailureReason::ConfigurationError,
                    format!("invalid parameters: {}", reason),
                    now,
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Job description derived from the request. Deterministic for a given request.
pub fn job_descriptor(request: &ExecutionRequest) -> JobDescriptor {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_REQUEST_UID.to_string(), request.uid().to_string());
    labels.insert(LABEL_REQUEST_NAME.to_string(), request.name().to_string());
    labels.insert(LABEL_WORKFLOW.to_string(), request.spec.workflow.identity());

    JobDescriptor {
        name: job_name(request),
        idempotency_key: request.uid().to_string(),
        bundle: request.spec.workflow.bundle.clone(),
        workflow: request.spec.workflow.identity(),
        parameters: request.spec.parameters.clone(),
        labels,
    }
}

fn job_name(request: &ExecutionRequest) -> String {
    let suffix: String = request.uid().chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();
    let name = request.name();
    // the cap is in bytes; cut on a char boundary
    let mut end = name.len().min(MAX_JOB_NAME_LEN - suffix.len() - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}-{}", name[..end].trim_end_matches('-'), suffix)
}
