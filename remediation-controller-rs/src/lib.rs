//! Remediation execution controller.
//!
//! Turns execution requests into delegated pipeline jobs, one target at a time, and reports
//! how each execution ended.

pub mod audit;
pub mod clock;
pub mod controller;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod logging;
pub mod model;
pub mod notification;
pub mod status;
pub mod store;
pub mod target;

pub use audit::{AuditSink, LedgerAuditSink, MemoryAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{Controller, ControllerConfig, PassSummary};
pub use engine::{ExecutionEngine, InMemoryExecutionEngine};
pub use error::{ControllerError, Result};
pub use lifecycle::{Collaborators, LifecycleConfig, LifecycleManager, ReconcileAction};
pub use lock::{LockDecision, LockEvaluator};
pub use model::{ExecutionRequest, FailureReason, ObjectKey, Phase, SkipReason};
pub use notification::{LogNotifier, Notification, Notifier, NoopNotifier, WebhookNotifier};
pub use status::{StatusTranslator, Translation};
pub use store::{InMemoryRequestStore, RequestStore};
pub use target::TargetLocator;
