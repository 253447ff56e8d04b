//! Resource lock and cooldown decisions.
//!
//! There is no lock service. Whether a request may dispatch is decided by reading the sibling
//! requests in its scope and applying two rules in order, first match wins:
//!
//! 1. Busy: another request for the same target is Pending or Running.
//! 2. Cooldown: another request ran the same workflow against the same target and completed
//!    less than `cooldown` ago.
//!
//! Siblings are every request in the controller's watch scope, not just the candidate's
//! namespace: the lock key is the target locator.
//!
//! Blocked requests are skipped, never queued. The decision is optimistic: two requests
//! evaluated at the same instant can both see a free target. Dispatch idempotency and a short
//! reconcile interval bound that window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::Result;
use crate::model::{ConflictingRequest, ExecutionRequest, Phase, SkipDetail, SkipReason};
use crate::status::format_elapsed;
use crate::store::RequestStore;
use crate::target::{TargetError, TargetLocator};

#[derive(Debug, Clone, PartialEq)]
pub enum LockDecision {
    Allow,
    Skip(SkipDetail),
    /// The candidate's own target does not parse; it can never take the lock.
    InvalidTarget(TargetError),
}

#[derive(Debug, Clone)]
pub struct LockEvaluator {
    cooldown: Duration,
    /// Namespace the controller watches; `None` reads siblings from every namespace.
    scope: Option<String>,
}

impl LockEvaluator {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown, scope: None }
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Re-read the siblings in scope from the store and decide.
    ///
    /// A failed listing is returned as an error so the caller retries; it never turns into
    /// an Allow.
    pub async fn decide(
        &self,
        candidate: &ExecutionRequest,
        store: &dyn RequestStore,
        now: DateTime<Utc>,
    ) -> Result<LockDecision> {
        let siblings = store.list(self.scope.as_deref()).await?;
        Ok(self
            .evaluate(candidate, &siblings, now)
            .unwrap_or_else(LockDecision::InvalidTarget))
    }

    /// Decide over an already-read snapshot of siblings. The candidate may be part of it.
    pub fn evaluate(
        &self,
        candidate: &ExecutionRequest,
        siblings: &[ExecutionRequest],
        now: DateTime<Utc>,
    ) -> std::result::Result<LockDecision, TargetError> {
        let target = TargetLocator::parse(&candidate.spec.target)?;

        let same_target: Vec<&ExecutionRequest> = siblings
            .iter()
            .filter(|s| s.uid() != candidate.uid())
            .filter(|s| {
                TargetLocator::parse(&s.spec.target)
                    .map(|t| t == target)
                    .unwrap_or(false)
            })
            .collect();

        if let Some(holder) = self.busy_holder(candidate, &same_target) {
            let phase = holder.phase().unwrap_or(Phase::Pending);
            let since = holder
                .status
                .as_ref()
                .and_then(|s| s.started_at)
                .unwrap_or(holder.metadata.created_at);
            debug!(request = %candidate.name(), holder = %holder.name(), locator = %target, "target busy");
            return Ok(LockDecision::Skip(SkipDetail {
                reason: SkipReason::ResourceBusy,
                message: format!(
                    "target {} is busy: execution request '{}' (workflow {}) is {}",
                    target,
                    holder.name(),
                    holder.spec.workflow.identity(),
                    phase
                ),
                skipped_at: now,
                conflicting: ConflictingRequest {
                    name: holder.name().to_string(),
                    workflow: holder.spec.workflow.identity(),
                    timestamp: since,
                    target: holder.spec.target.clone(),
                },
            }));
        }

        if let Some((recent, completed_at)) = self.cooldown_holder(candidate, &same_target, now) {
            let ago = (now - completed_at).to_std().unwrap_or(Duration::ZERO);
            debug!(request = %candidate.name(), recent = %recent.name(), locator = %target, "target cooling down");
            return Ok(LockDecision::Skip(SkipDetail {
                reason: SkipReason::RecentlyRemediated,
                message: format!(
                    "workflow {} completed against {} {} ago via '{}'; cooldown of {} has not elapsed",
                    candidate.spec.workflow.identity(),
                    target,
                    format_elapsed(ago),
                    recent.name(),
                    format_elapsed(self.cooldown)
                ),
                skipped_at: now,
                conflicting: ConflictingRequest {
                    name: recent.name().to_string(),
                    workflow: recent.spec.workflow.identity(),
                    timestamp: completed_at,
                    target: recent.spec.target.clone(),
                },
            }));
        }

        Ok(LockDecision::Allow)
    }

    /// The sibling currently holding the target. Running siblings always hold it; Pending
    /// siblings hold it only when they were created before the candidate, so two Pending
    /// requests never skip each other. The oldest holder is reported.
    fn busy_holder<'a>(
        &self,
        candidate: &ExecutionRequest,
        same_target: &[&'a ExecutionRequest],
    ) -> Option<&'a ExecutionRequest> {
        same_target
            .iter()
            .copied()
            .filter(|s| match s.phase() {
                Some(Phase::Running) => true,
                Some(Phase::Pending) => s.precedes(candidate),
                _ => false,
            })
            .min_by(|a, b| {
                (a.metadata.created_at, a.name()).cmp(&(b.metadata.created_at, b.name()))
            })
    }

    /// The most recent completion of the same workflow still inside the cooldown window.
    fn cooldown_holder<'a>(
        &self,
        candidate: &ExecutionRequest,
        same_target: &[&'a ExecutionRequest],
        now: DateTime<Utc>,
    ) -> Option<(&'a ExecutionRequest, DateTime<Utc>)> {
        let cooldown = chrono::Duration::from_std(self.cooldown)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));

        same_target
            .iter()
            .copied()
            .filter(|s| s.spec.workflow.same_workflow(&candidate.spec.workflow))
            .filter_map(|s| {
                let status = s.status.as_ref().filter(|st| st.phase == Phase::Completed)?;
                let completed_at = status.completed_at.unwrap_or(status.last_transition_at);
                (now - completed_at < cooldown).then_some((s, completed_at))
            })
            .max_by_key(|(_, completed_at)| *completed_at)
    }
}
