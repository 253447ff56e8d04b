//! Per-request reconciliation: validation, lock evaluation, dispatch, status polling and
//! deletion cleanup.
//!
//! Every pass re-reads the request, decides from what it sees, and writes at most one status
//! update conditioned on the `resource_version` it read. Audit records and notifications are
//! only emitted after that write succeeds, so a pass that loses the race produces no side
//! effects and the next pass starts over from the stored state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use audit_ledger::AuditEvent;
use config_rs::ControllerSettings;
use tracing::{debug, info, instrument, warn};

use crate::audit::{audit_record, AuditSink};
use crate::clock::Clock;
use crate::dispatcher::{DispatchOutcome, ExecutionDispatcher};
use crate::engine::ExecutionEngine;
use crate::error::{ControllerError, Result};
use crate::lock::{LockDecision, LockEvaluator};
use crate::model::{
    BundleRef, ExecutionRequest, FailureReason, ObjectKey, Phase, RequestStatus, SkipReason, CLEANUP_MARKER,
};
use crate::notification::{Notification, Notifier, RequestSummary};
use crate::status::{pre_execution_failure, StatusTranslator, Translation};
use crate::store::RequestStore;
use crate::target::TargetLocator;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub cooldown: Duration,
    pub poll_interval_initial: Duration,
    pub poll_interval_max: Duration,
    /// Sibling scope for lock decisions; matches the controller's watch namespace.
    pub watch_namespace: Option<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from(&ControllerSettings::default())
    }
}

impl From<&ControllerSettings> for LifecycleConfig {
    fn from(settings: &ControllerSettings) -> Self {
        Self {
            cooldown: settings.cooldown_period,
            poll_interval_initial: settings.poll_interval_initial,
            poll_interval_max: settings.poll_interval_max,
            watch_namespace: settings.watch_namespace.clone(),
        }
    }
}

/// What the caller should do with the request after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Requeue(Duration),
    /// Nothing left to do until the request changes.
    Done,
}

/// Everything the lifecycle manager talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RequestStore>,
    pub engine: Arc<dyn ExecutionEngine>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

pub struct LifecycleManager {
    store: Arc<dyn RequestStore>,
    engine: Arc<dyn ExecutionEngine>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    dispatcher: ExecutionDispatcher,
    lock: LockEvaluator,
    translator: StatusTranslator,
    config: LifecycleConfig,
    /// Unchanged observations per running request uid. Losing it only resets the backoff.
    polls: Mutex<HashMap<String, u32>>,
}

impl LifecycleManager {
    pub fn new(collaborators: Collaborators, config: LifecycleConfig) -> Self {
        let Collaborators {
            store,
            engine,
            audit,
            notifier,
            clock,
        } = collaborators;

        Self {
            dispatcher: ExecutionDispatcher::new(Arc::clone(&engine)),
            lock: LockEvaluator::new(config.cooldown).with_scope(config.watch_namespace.clone()),
            translator: StatusTranslator,
            store,
            engine,
            audit,
            notifier,
            clock,
            config,
            polls: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run one reconcile pass for the request stored under `key`.
    #[instrument(skip(self, key), fields(request = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        let Some(request) = self.store.get(key).await? else {
            debug!("request no longer exists");
            return Ok(ReconcileAction::Done);
        };

        if request.is_being_deleted() {
            return self.finalize(request).await;
        }

        match request.phase() {
            None => self.observe_new(request).await,
            Some(Phase::Pending) => self.evaluate_pending(request).await,
            Some(Phase::Running) => self.poll_running(request).await,
            Some(phase) => {
                debug!(%phase, "request is terminal");
                self.forget(request.uid());
                Ok(ReconcileAction::Done)
            }
        }
    }

    /// First observation: claim the cleanup marker, then validate.
    async fn observe_new(&self, request: ExecutionRequest) -> Result<ReconcileAction> {
        let key = request.key();
        let request = if request.has_cleanup_marker() {
            request
        } else {
            self.store.add_cleanup_marker(&key, CLEANUP_MARKER).await?
        };
        let now = self.clock.now();

        if let Err(problem) = validate(&request) {
            let detail = pre_execution_failure(&request, "validation", FailureReason::ValidationFailed, problem, now);
            let updated = self
                .store
                .update_status(&key, request.metadata.resource_version, RequestStatus::rejected(detail.clone(), now))
                .await?;
            info!(locator = %updated.spec.target, phase = %Phase::Failed, reason = %detail.reason, "request rejected");
            let notification = Notification::Failed {
                request: RequestSummary::from(&updated),
                detail,
            };
            self.emit_terminal(&updated, Some(notification)).await;
            return Ok(ReconcileAction::Done);
        }

        let updated = self
            .store
            .update_status(&key, request.metadata.resource_version, RequestStatus::pending(now))
            .await?;
        info!(locator = %updated.spec.target, phase = %Phase::Pending, "request accepted");
        self.evaluate_pending(updated).await
    }

    async fn evaluate_pending(&self, request: ExecutionRequest) -> Result<ReconcileAction> {
        let key = request.key();
        let request = if request.has_cleanup_marker() {
            request
        } else {
            self.store.add_cleanup_marker(&key, CLEANUP_MARKER).await?
        };
        let current = current_status(&request)?;
        let now = self.clock.now();

        match self.lock.decide(&request, self.store.as_ref(), now).await? {
            LockDecision::Skip(detail) => {
                let status = current.skip(detail.clone(), now)?;
                let updated = self
                    .store
                    .update_status(&key, request.metadata.resource_version, status)
                    .await?;
                info!(
                    locator = %updated.spec.target,
                    phase = %Phase::Skipped,
                    reason = %detail.reason,
                    conflicting = %detail.conflicting.name,
                    "request skipped"
                );
                let notification = (detail.reason == SkipReason::ResourceBusy).then(|| Notification::Skipped {
                    request: RequestSummary::from(&updated),
                    detail,
                });
                self.emit_terminal(&updated, notification).await;
                Ok(ReconcileAction::Done)
            }
            LockDecision::InvalidTarget(e) => {
                let detail = pre_execution_failure(
                    &request,
                    "validation",
                    FailureReason::ValidationFailed,
                    format!("invalid target: {}", e),
                    now,
                );
                let status = current.fail(detail.clone(), now)?;
                let updated = self
                    .store
                    .update_status(&key, request.metadata.resource_version, status)
                    .await?;
                info!(locator = %updated.spec.target, phase = %Phase::Failed, reason = %detail.reason, "request rejected");
                let notification = Notification::Failed {
                    request: RequestSummary::from(&updated),
                    detail,
                };
                self.emit_terminal(&updated, Some(notification)).await;
                Ok(ReconcileAction::Done)
            }
            LockDecision::Allow => match self.dispatcher.dispatch(&request, now).await? {
                DispatchOutcome::Dispatched(handle) => {
                    let job = handle.name.clone();
                    let status = current.start(handle, now)?;
                    let updated = self
                        .store
                        .update_status(&key, request.metadata.resource_version, status)
                        .await?;
                    info!(locator = %updated.spec.target, phase = %Phase::Running, %job, "request running");
                    self.forget(updated.uid());
                    Ok(ReconcileAction::Requeue(self.config.poll_interval_initial))
                }
                DispatchOutcome::Rejected(detail) => {
                    let status = current.fail(detail.clone(), now)?;
                    let updated = self
                        .store
                        .update_status(&key, request.metadata.resource_version, status)
                        .await?;
                    info!(locator = %updated.spec.target, phase = %Phase::Failed, reason = %detail.reason, "dispatch rejected");
                    let notification = Notification::Failed {
                        request: RequestSummary::from(&updated),
                        detail,
                    };
                    self.emit_terminal(&updated, Some(notification)).await;
                    Ok(ReconcileAction::Done)
                }
            },
        }
    }

    async fn poll_running(&self, request: ExecutionRequest) -> Result<ReconcileAction> {
        let key = request.key();
        let current = current_status(&request)?;
        let job = match &current.job {
            Some(handle) => self.engine.job_status(handle).await?,
            None => None,
        };
        let now = self.clock.now();

        match self.translator.translate(&request, job.as_ref(), now) {
            Translation::NoChange => {
                let delay = self.next_poll_delay(request.uid());
                debug!(delay_ms = delay.as_millis() as u64, "job still running");
                Ok(ReconcileAction::Requeue(delay))
            }
            Translation::Completed { completed_at } => {
                let status = current.complete(completed_at, now)?;
                let updated = self
                    .store
                    .update_status(&key, request.metadata.resource_version, status)
                    .await?;
                info!(locator = %updated.spec.target, phase = %Phase::Completed, "remediation completed");
                self.forget(updated.uid());
                self.emit_terminal(&updated, None).await;
                Ok(ReconcileAction::Done)
            }
            Translation::Failed(detail) => {
                let status = current.fail(detail.clone(), now)?;
                let updated = self
                    .store
                    .update_status(&key, request.metadata.resource_version, status)
                    .await?;
                warn!(
                    locator = %updated.spec.target,
                    phase = %Phase::Failed,
                    reason = %detail.reason,
                    step = %detail.failed_task_name,
                    "remediation failed"
                );
                self.forget(updated.uid());
                let notification = Notification::Failed {
                    request: RequestSummary::from(&updated),
                    detail,
                };
                self.emit_terminal(&updated, Some(notification)).await;
                Ok(ReconcileAction::Done)
            }
        }
    }

    /// Deletion requested: final audit and notification, then release the marker.
    async fn finalize(&self, request: ExecutionRequest) -> Result<ReconcileAction> {
        self.forget(request.uid());
        if !request.has_cleanup_marker() {
            return Ok(ReconcileAction::Done);
        }

        if let Err(e) = self.audit.record(audit_record(&request, AuditEvent::Deleted)).await {
            warn!(error = %e, "final audit write failed; releasing request anyway");
        }
        self.notify(Notification::Deleted {
            request: RequestSummary::from(&request),
        })
        .await;

        self.store.remove_cleanup_marker(&request.key(), CLEANUP_MARKER).await?;
        info!(locator = %request.spec.target, "cleanup marker released");
        Ok(ReconcileAction::Done)
    }

    async fn emit_terminal(&self, request: &ExecutionRequest, notification: Option<Notification>) {
        if let Err(e) = self.audit.record(audit_record(request, AuditEvent::Terminal)).await {
            warn!(error = %e, "audit write failed");
        }
        if let Some(notification) = notification {
            self.notify(notification).await;
        }
    }

    async fn notify(&self, notification: Notification) {
        let kind = notification.kind();
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(error = %e, kind, "notification failed");
        }
    }

    fn next_poll_delay(&self, uid: &str) -> Duration {
        let mut polls = self.polls.lock().unwrap_or_else(|e| e.into_inner());
        let count = polls.entry(uid.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let factor = 1u32 << (*count).min(16);
        self.config
            .poll_interval_initial
            .saturating_mul(factor)
            .min(self.config.poll_interval_max)
    }

    fn forget(&self, uid: &str) {
        self.polls.lock().unwrap_or_else(|e| e.into_inner()).remove(uid);
    }
}

fn current_status(request: &ExecutionRequest) -> Result<RequestStatus> {
    request
        .status
        .clone()
        .ok_or_else(|| ControllerError::Validation(format!("request {} has no status", request.key())))
}

/// Structural checks made once, before anything is dispatched.
pub fn validate(request: &ExecutionRequest) -> std::result::Result<(), String> {
    let mut problems = Vec::new();

    if let Err(e) = TargetLocator::parse(&request.spec.target) {
        problems.push(format!("invalid target: {}", e));
    }
    let workflow = &request.spec.workflow;
    if workflow.name.trim().is_empty() {
        problems.push("workflow name is empty".to_string());
    }
    if workflow.version.trim().is_empty() {
        problems.push("workflow version is empty".to_string());
    }
    if let Err(e) = BundleRef::parse(&workflow.bundle) {
        problems.push(format!("invalid workflow bundle: {}", e));
    }
    if request.metadata.owner.is_none() {
        problems.push("request has no owner reference".to_string());
    }
    if request.spec.parameters.keys().any(|k| k.trim().is_empty()) {
        problems.push("parameter with empty name".to_string());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}
