//! Audit sinks for terminal transitions and deletion cleanup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use audit_ledger::{AuditEvent, AuditLedger, AuditRecord, LedgerError};
use tokio::sync::Mutex;

use crate::model::ExecutionRequest;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("ledger write failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("audit task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for audit records. Failures are reported, never retried by the caller.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Build the audit record for the request as it currently stands.
pub fn audit_record(request: &ExecutionRequest, event: AuditEvent) -> AuditRecord {
    let status = request.status.as_ref();
    let reason = status.and_then(|s| {
        s.failure
            .as_ref()
            .map(|f| f.reason.to_string())
            .or_else(|| s.skip.as_ref().map(|d| d.reason.to_string()))
    });

    AuditRecord {
        request_uid: request.uid().to_string(),
        request_name: request.name().to_string(),
        namespace: request.metadata.namespace.clone(),
        target: request.spec.target.clone(),
        workflow: request.spec.workflow.identity(),
        phase: status.map_or_else(|| "New".to_string(), |s| s.phase.to_string()),
        event,
        created_at: request.metadata.created_at,
        started_at: status.and_then(|s| s.started_at),
        completed_at: status.and_then(|s| s.completed_at),
        outcome: status.and_then(|s| s.outcome).map(|o| o.to_string()),
        reason,
        message: status.and_then(|s| s.message.clone()),
    }
}

/// Appends to the hash-chained file ledger. File I/O runs on the blocking pool.
pub struct LedgerAuditSink {
    ledger: Arc<AuditLedger>,
}

impl LedgerAuditSink {
    pub fn new(ledger: Arc<AuditLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl AuditSink for LedgerAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        let ledger = Arc::clone(&self.ledger);
        let id = tokio::task::spawn_blocking(move || ledger.append(record)).await??;
        tracing::debug!(entry = %id, "audit record appended");
        Ok(())
    }
}

/// Keeps records in memory. Can be switched to fail for outage scenarios.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("injected outage".to_string()));
        }
        self.records.lock().await.push(record);
        Ok(())
    }
}
