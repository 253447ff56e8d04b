mod common;

use common::{request, TestEnv, PAYMENT_API};
use remediation_controller::model::RequestStatus;
use remediation_controller::{LockEvaluator, Phase, RequestStore, SkipReason};
use std::time::Duration;

#[tokio::test]
async fn test_at_most_one_active_request_per_target() {
    let env = TestEnv::new();
    let a = env.submit("rr-a", PAYMENT_API, "increase-memory").await;
    let b = env.submit("rr-b", PAYMENT_API, "restart-pods").await;
    let c = env.submit("rr-c", PAYMENT_API, "increase-memory").await;
    let other = env.submit("rr-other", "payment/deployment/ledger-api", "increase-memory").await;

    env.quiesce().await;

    let requests = env.store.list(None).await.unwrap();
    let active = requests
        .iter()
        .filter(|r| r.spec.target == PAYMENT_API)
        .filter(|r| r.phase().map_or(false, Phase::is_active))
        .count();
    assert_eq!(active, 1);

    assert_eq!(env.phase_of(&a).await, Some(Phase::Running));
    assert_eq!(env.phase_of(&other).await, Some(Phase::Running));
    for skipped in [&b, &c] {
        let status = env.reload(skipped).await.status.unwrap();
        let skip = status.skip.unwrap();
        assert_eq!(skip.reason, SkipReason::ResourceBusy);
        assert_eq!(skip.conflicting.name, "rr-a");
        assert!(status.job.is_none());
    }
    assert_eq!(env.notifier.count("skipped").await, 2);
    assert_eq!(env.engine.job_count().await, 2);
}

#[tokio::test]
async fn test_pending_siblings_resolve_to_the_oldest() {
    let env = TestEnv::new();
    let t0 = env.now();
    let mut created = Vec::new();
    for (i, name) in ["rr-first", "rr-second", "rr-third"].iter().enumerate() {
        let r = request(name, PAYMENT_API, "increase-memory", t0 + chrono::Duration::seconds(i as i64));
        let r = env.store.create(r).await.unwrap();
        // all three already accepted before any lock evaluation ran
        let r = env
            .store
            .update_status(&r.key(), r.metadata.resource_version, RequestStatus::pending(t0))
            .await
            .unwrap();
        created.push(r);
    }

    // evaluate the youngest first
    env.reconcile(&created[2]).await;
    env.reconcile(&created[1]).await;
    env.reconcile(&created[0]).await;

    assert_eq!(env.phase_of(&created[0]).await, Some(Phase::Running));
    for younger in &created[1..] {
        let skip = env.reload(younger).await.status.unwrap().skip.unwrap();
        assert_eq!(skip.reason, SkipReason::ResourceBusy);
        assert_eq!(skip.conflicting.name, "rr-first");
    }
}

#[tokio::test]
async fn test_cooldown_blocks_same_workflow_until_it_expires() {
    let env = TestEnv::new();
    let first = env.submit("rr-first", PAYMENT_API, "increase-memory").await;
    env.quiesce().await;
    env.engine.succeed(first.uid()).await;
    env.tick(1).await;
    assert_eq!(env.phase_of(&first).await, Some(Phase::Completed));
    let completed_at = env.reload(&first).await.status.unwrap().completed_at.unwrap();

    env.advance_secs(60);
    let early = env.submit("rr-early", PAYMENT_API, "increase-memory").await;
    env.quiesce().await;
    let skip = env.reload(&early).await.status.unwrap().skip.unwrap();
    assert_eq!(skip.reason, SkipReason::RecentlyRemediated);
    assert_eq!(skip.conflicting.name, "rr-first");
    assert_eq!(skip.conflicting.timestamp, completed_at);
    assert_eq!(env.notifier.count("skipped").await, 0);

    env.advance_secs(5 * 60);
    let late = env.submit("rr-late", PAYMENT_API, "increase-memory").await;
    env.quiesce().await;
    assert_eq!(env.phase_of(&late).await, Some(Phase::Running));
}

#[tokio::test]
async fn test_different_workflow_is_not_cooled_down() {
    let env = TestEnv::new();
    let first = env.submit("rr-first", PAYMENT_API, "increase-memory").await;
    env.quiesce().await;
    env.engine.succeed(first.uid()).await;
    env.tick(1).await;

    env.advance_secs(30);
    let other = env.submit("rr-restart", PAYMENT_API, "restart-pods").await;
    env.quiesce().await;
    assert_eq!(env.phase_of(&other).await, Some(Phase::Running));
}

#[tokio::test]
async fn test_workflow_version_is_part_of_identity() {
    let env = TestEnv::new();
    let first = env.submit("rr-v1", PAYMENT_API, "increase-memory").await;
    env.quiesce().await;
    env.engine.succeed(first.uid()).await;
    env.tick(1).await;

    let mut v2 = request("rr-v2", PAYMENT_API, "increase-memory", env.now());
    v2.spec.workflow.version = "v2".to_string();
    let v2 = env.store.create(v2).await.unwrap();
    env.quiesce().await;
    assert_eq!(env.phase_of(&v2).await, Some(Phase::Running));
}

#[tokio::test]
async fn test_listing_failure_fails_closed() {
    let env = TestEnv::new();
    let candidate = env.submit("rr-a", PAYMENT_API, "increase-memory").await;

    env.store.set_unavailable(true);
    let evaluator = LockEvaluator::new(Duration::from_secs(300));
    let err = evaluator
        .decide(&candidate, env.store.as_ref(), env.now())
        .await
        .unwrap_err();
    assert!(err.is_retriable());

    assert!(env.controller.run_once().await.is_err());
    assert_eq!(env.engine.submission_count(), 0);

    env.store.set_unavailable(false);
    env.quiesce().await;
    assert_eq!(env.phase_of(&candidate).await, Some(Phase::Running));
}

#[tokio::test]
async fn test_same_target_is_locked_across_namespaces() {
    let env = TestEnv::new();
    let a = env.submit("rr-a", PAYMENT_API, "increase-memory").await;
    env.reconcile(&a).await;

    let mut b = request("rr-b", PAYMENT_API, "restart-pods", env.now());
    b.metadata.namespace = Some("ops".to_string());
    let b = env.store.create(b).await.unwrap();

    let node_a = env.submit("rr-node-a", "node/worker-3", "cordon-drain").await;
    env.reconcile(&node_a).await;
    let mut node_b = request("rr-node-b", "node/worker-3", "node-disk-cleanup", env.now());
    node_b.metadata.namespace = Some("ops".to_string());
    let node_b = env.store.create(node_b).await.unwrap();

    env.quiesce().await;

    for target in [PAYMENT_API, "node/worker-3"] {
        let active = env
            .store
            .list(None)
            .await
            .unwrap()
            .iter()
            .filter(|r| r.spec.target == target)
            .filter(|r| r.phase().map_or(false, Phase::is_active))
            .count();
        assert_eq!(active, 1, "{target}");
    }

    assert_eq!(env.phase_of(&a).await, Some(Phase::Running));
    assert_eq!(env.phase_of(&node_a).await, Some(Phase::Running));
    for (skipped, holder) in [(&b, "rr-a"), (&node_b, "rr-node-a")] {
        let skip = env.reload(skipped).await.status.unwrap().skip.unwrap();
        assert_eq!(skip.reason, SkipReason::ResourceBusy);
        assert_eq!(skip.conflicting.name, holder);
    }
}
