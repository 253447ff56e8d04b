#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use remediation_controller::model::{OwnerReference, RequestSpec, WorkflowRef};
use remediation_controller::notification::NotifyError;
use remediation_controller::{
    Clock, Collaborators, Controller, ControllerConfig, ExecutionRequest, InMemoryExecutionEngine,
    InMemoryRequestStore, LifecycleConfig, LifecycleManager, ManualClock, MemoryAuditSink, Notification, Notifier,
    Phase, ReconcileAction, RequestStore,
};
use tokio::sync::Mutex;

pub const PARENT_UID: &str = "parent-uid-0001";
pub const PAYMENT_API: &str = "payment/deployment/payment-api";

/// Keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }

    pub async fn count(&self, kind: &str) -> usize {
        self.sent.lock().await.iter().filter(|n| n.kind() == kind).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.sent.lock().await.push(notification);
        Ok(())
    }
}

pub struct TestEnv {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryRequestStore>,
    pub engine: Arc<InMemoryExecutionEngine>,
    pub audit: Arc<MemoryAuditSink>,
    pub notifier: Arc<RecordingNotifier>,
    pub manager: Arc<LifecycleManager>,
    pub controller: Controller,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

impl TestEnv {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = Arc::new(InMemoryRequestStore::new());
        let engine = Arc::new(InMemoryExecutionEngine::new(clock.clone()));
        let audit = Arc::new(MemoryAuditSink::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let manager = Arc::new(LifecycleManager::new(
            Collaborators {
                store: store.clone(),
                engine: engine.clone(),
                audit: audit.clone(),
                notifier: notifier.clone(),
                clock: clock.clone(),
            },
            LifecycleConfig {
                cooldown: Duration::from_secs(5 * 60),
                poll_interval_initial: Duration::from_secs(1),
                poll_interval_max: Duration::from_secs(10),
                watch_namespace: None,
            },
        ));
        let controller = Controller::new(
            manager.clone(),
            ControllerConfig {
                resync_interval: Duration::from_millis(10),
                error_backoff_base: Duration::from_millis(500),
                error_backoff_max: Duration::from_secs(30),
                jitter_factor: 0.0,
                watch_namespace: None,
            },
        );

        Self {
            clock,
            store,
            engine,
            audit,
            notifier,
            manager,
            controller,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    /// Create a request stamped with the current clock time.
    pub async fn submit(&self, name: &str, target: &str, workflow: &str) -> ExecutionRequest {
        self.store
            .create(request(name, target, workflow, self.now()))
            .await
            .unwrap()
    }

    pub async fn reload(&self, request: &ExecutionRequest) -> ExecutionRequest {
        self.store.get(&request.key()).await.unwrap().unwrap()
    }

    pub async fn phase_of(&self, request: &ExecutionRequest) -> Option<Phase> {
        self.reload(request).await.phase()
    }

    pub async fn reconcile(&self, request: &ExecutionRequest) -> ReconcileAction {
        self.manager.reconcile(&request.key()).await.unwrap()
    }

    /// Run controller passes until one of them has nothing left to do.
    pub async fn quiesce(&self) {
        for _ in 0..10 {
            let summary = self.controller.run_once().await.unwrap();
            if summary.reconciled == 0 {
                return;
            }
        }
        panic!("controller did not quiesce");
    }

    /// Move past every pending requeue and run to quiescence.
    pub async fn tick(&self, secs: i64) {
        self.advance_secs(secs);
        self.quiesce().await;
    }
}

pub fn request(name: &str, target: &str, workflow: &str, created_at: DateTime<Utc>) -> ExecutionRequest {
    let namespace = target.split('/').next().filter(|_| target.split('/').count() == 3);
    ExecutionRequest::new(
        name,
        Some(namespace.unwrap_or("remediation")),
        RequestSpec {
            target: target.to_string(),
            workflow: WorkflowRef {
                name: workflow.to_string(),
                version: "v1".to_string(),
                bundle: format!("registry.local/workflows/{}@sha256:{}", workflow, "e".repeat(64)),
            },
            parameters: Default::default(),
            timeout_seconds: None,
        },
        created_at,
    )
    .with_owner(OwnerReference {
        kind: "RemediationRequest".to_string(),
        name: "rr-parent".to_string(),
        uid: PARENT_UID.to_string(),
    })
}
