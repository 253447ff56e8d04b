mod common;

use std::sync::Arc;
use std::time::Duration;

use audit_ledger::{AuditEvent, AuditLedger};
use common::{RecordingNotifier, TestEnv, PAYMENT_API};
use remediation_controller::{
    Clock, Collaborators, Controller, ControllerConfig, InMemoryExecutionEngine, InMemoryRequestStore, LedgerAuditSink,
    LifecycleConfig, LifecycleManager, ManualClock, Notification, Phase, RequestStore, SkipReason,
};
use tempfile::tempdir;

#[tokio::test]
async fn test_payment_api_busy_then_cooldown_then_allowed() {
    let env = TestEnv::new();

    let a = env.submit("rr-a", PAYMENT_API, "increase-memory").await;
    env.quiesce().await;
    assert_eq!(env.phase_of(&a).await, Some(Phase::Running));

    env.tick(10).await;
    let b = env.submit("rr-b", PAYMENT_API, "node-disk-cleanup").await;
    env.quiesce().await;
    let b_status = env.reload(&b).await.status.unwrap();
    assert_eq!(b_status.phase, Phase::Skipped);
    let skip = b_status.skip.unwrap();
    assert_eq!(skip.reason, SkipReason::ResourceBusy);
    assert_eq!(skip.conflicting.name, "rr-a");
    assert_eq!(skip.conflicting.workflow, "increase-memory@v1");
    assert_eq!(skip.conflicting.target, PAYMENT_API);

    env.advance_secs(20);
    env.engine.succeed(a.uid()).await;
    let a_completed = env.now();
    env.tick(10).await;
    let a_status = env.reload(&a).await.status.unwrap();
    assert_eq!(a_status.phase, Phase::Completed);
    assert_eq!(a_status.completed_at, Some(a_completed));

    env.clock.set(a_completed + chrono::Duration::minutes(2));
    let c = env.submit("rr-c", PAYMENT_API, "increase-memory").await;
    env.quiesce().await;
    let c_skip = env.reload(&c).await.status.unwrap().skip.unwrap();
    assert_eq!(c_skip.reason, SkipReason::RecentlyRemediated);
    assert_eq!(c_skip.conflicting.name, "rr-a");

    env.clock.set(a_completed + chrono::Duration::minutes(6));
    let d = env.submit("rr-d", PAYMENT_API, "increase-memory").await;
    env.quiesce().await;
    assert_eq!(env.phase_of(&d).await, Some(Phase::Running));

    // busy skip is notified, cooldown skip is not
    let notifications = env.notifier.sent().await;
    assert_eq!(notifications.len(), 1);
    assert!(matches!(&notifications[0], Notification::Skipped { request, .. } if request.name == "rr-b"));

    // A completed, B skipped, C skipped
    let audited: Vec<(String, String)> = env
        .audit
        .records()
        .await
        .into_iter()
        .map(|r| (r.request_name, r.phase))
        .collect();
    assert_eq!(
        audited,
        vec![
            ("rr-b".to_string(), "Skipped".to_string()),
            ("rr-a".to_string(), "Completed".to_string()),
            ("rr-c".to_string(), "Skipped".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_terminal_transitions_land_in_the_ledger() {
    let dir = tempdir().unwrap();
    let ledger = Arc::new(AuditLedger::open(dir.path().join("audit/ledger.bin")).unwrap());

    let clock = Arc::new(ManualClock::new(common::start_time()));
    let store = Arc::new(InMemoryRequestStore::new());
    let engine = Arc::new(InMemoryExecutionEngine::new(clock.clone()).with_auto_complete(Duration::from_secs(5)));
    let manager = Arc::new(LifecycleManager::new(
        Collaborators {
            store: store.clone(),
            engine,
            audit: Arc::new(LedgerAuditSink::new(ledger.clone())),
            notifier: Arc::new(RecordingNotifier::default()),
            clock: clock.clone(),
        },
        LifecycleConfig::default(),
    ));
    let controller = Controller::new(
        manager,
        ControllerConfig {
            resync_interval: Duration::from_millis(10),
            error_backoff_base: Duration::from_millis(100),
            error_backoff_max: Duration::from_secs(1),
            jitter_factor: 0.0,
            watch_namespace: Some("payment".to_string()),
        },
    );

    let r = store
        .create(common::request("rr-ledger", PAYMENT_API, "increase-memory", clock.now()))
        .await
        .unwrap();
    let elsewhere = store
        .create(common::request("rr-elsewhere", "node/worker-3", "cordon-drain", clock.now()))
        .await
        .unwrap();

    controller.run_once().await.unwrap();
    clock.advance(chrono::Duration::seconds(10));
    controller.run_once().await.unwrap();

    let stored = store.get(&r.key()).await.unwrap().unwrap();
    assert_eq!(stored.phase(), Some(Phase::Completed));
    // outside the watched namespace
    assert_eq!(store.get(&elsewhere.key()).await.unwrap().unwrap().phase(), None);

    store.request_deletion(&r.key(), clock.now()).await.unwrap();
    controller.run_once().await.unwrap();
    assert!(store.get(&r.key()).await.unwrap().is_none());

    assert_eq!(ledger.verify().unwrap(), 2);
    let entries = ledger.read_all().unwrap();
    assert_eq!(entries[0].record.event, AuditEvent::Terminal);
    assert_eq!(entries[0].record.outcome.as_deref(), Some("Success"));
    assert_eq!(entries[1].record.event, AuditEvent::Deleted);
    assert_eq!(entries[1].record.request_name, "rr-ledger");
}
