//! Tests for sync reconciliation

use super::*;
use crate::lifecycle::LifecycleEventHandler;
use crate::models::{
    InstanceMetadata, InstanceRecord, InstanceState, InstanceType, LifecycleEvent,
    LifecycleEventType, Resource,
};
use crate::observability::StructuredLogger;
use crate::store::{InMemoryInstanceStore, InstanceStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

const ACCOUNT: &str = "acct-1";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn record(instance_id: &str, cluster_id: &str) -> InstanceRecord {
    InstanceRecord {
        record_id: 0,
        account_id: ACCOUNT.to_string(),
        instance_id: instance_id.to_string(),
        instance_name: instance_id.to_string(),
        cluster_id: cluster_id.to_string(),
        cluster_name: cluster_id.to_string(),
        setting_id: "setting-1".to_string(),
        instance_type: InstanceType::EcsTaskEc2,
        instance_state: InstanceState::Initializing,
        total_resource: Resource::new(256.0, 512.0),
        metadata: InstanceMetadata::default(),
        created_at: t0(),
        usage_start_time: None,
        usage_stop_time: None,
        harness_service_info: None,
        version: 0,
    }
}

struct Fixture {
    store: Arc<InMemoryInstanceStore>,
    lifecycle: Arc<LifecycleEventHandler>,
    reconciler: SyncReconciler,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(InMemoryInstanceStore::new());
        let logger = StructuredLogger::new("test");
        let lifecycle = Arc::new(LifecycleEventHandler::new(store.clone(), logger.clone()));
        let reconciler = SyncReconciler::new(store.clone(), lifecycle.clone(), logger);
        Self {
            store,
            lifecycle,
            reconciler,
        }
    }

    /// Create a record in `cluster_id` and start it at `t0 + 1h`
    async fn running(&self, instance_id: &str, cluster_id: &str) {
        self.store
            .create_if_absent(record(instance_id, cluster_id))
            .await
            .unwrap();
        self.lifecycle
            .handle(&LifecycleEvent {
                account_id: ACCOUNT.to_string(),
                instance_id: instance_id.to_string(),
                cluster_id: cluster_id.to_string(),
                event_type: LifecycleEventType::Start,
                timestamp: t0() + Duration::hours(1),
            })
            .await
            .unwrap();
    }

    async fn state(&self, instance_id: &str) -> InstanceState {
        self.store
            .fetch(ACCOUNT, instance_id)
            .await
            .unwrap()
            .unwrap()
            .instance_state
    }
}

fn ecs_snapshot(task_arns: &[&str], at: DateTime<Utc>) -> EcsSyncSnapshot {
    EcsSyncSnapshot {
        cluster_id: "cluster-x".to_string(),
        setting_id: "setting-1".to_string(),
        last_processed_timestamp: at,
        ec2_instance_arns: Vec::new(),
        container_instance_arns: Vec::new(),
        task_arns: task_arns
            .iter()
            .map(|id| format!("arn:aws:ecs:us-east-1:123:task/cluster-x/{}", id))
            .collect(),
    }
}

#[tokio::test]
async fn test_missing_instance_gets_exactly_one_stop() {
    let fx = Fixture::new();
    for id in ["a", "b", "c"] {
        fx.running(id, "cluster-x").await;
    }

    let snapshot_time = t0() + Duration::hours(5);
    let report = fx
        .reconciler
        .reconcile(ACCOUNT, &ecs_snapshot(&["a", "b"], snapshot_time))
        .await
        .unwrap();

    assert_eq!(report.believed_active, 3);
    assert_eq!(report.snapshot_active, 2);
    assert_eq!(report.stop_issued, vec!["c".to_string()]);
    assert_eq!(report.stopped, vec!["c".to_string()]);

    assert_eq!(fx.state("a").await, InstanceState::Running);
    assert_eq!(fx.state("b").await, InstanceState::Running);
    assert_eq!(fx.state("c").await, InstanceState::Stopped);

    let stopped = fx.store.fetch(ACCOUNT, "c").await.unwrap().unwrap();
    assert_eq!(stopped.usage_stop_time, Some(snapshot_time));
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let fx = Fixture::new();
    for id in ["a", "b", "c"] {
        fx.running(id, "cluster-x").await;
    }
    let snapshot = ecs_snapshot(&["a", "b"], t0() + Duration::hours(5));

    fx.reconciler.reconcile(ACCOUNT, &snapshot).await.unwrap();
    let before = fx.store.history(ACCOUNT, "c");

    let second = fx.reconciler.reconcile(ACCOUNT, &snapshot).await.unwrap();
    assert!(second.stopped.is_empty());
    assert!(second.stop_issued.is_empty());
    assert_eq!(fx.store.history(ACCOUNT, "c"), before);
}

#[tokio::test]
async fn test_instances_created_after_snapshot_are_kept() {
    let fx = Fixture::new();
    fx.running("a", "cluster-x").await;

    // Snapshot predates the start of "a"
    let report = fx
        .reconciler
        .reconcile(ACCOUNT, &ecs_snapshot(&[], t0() + Duration::minutes(30)))
        .await
        .unwrap();

    assert!(report.stop_issued.is_empty());
    assert_eq!(fx.state("a").await, InstanceState::Running);
}

#[tokio::test]
async fn test_other_clusters_untouched() {
    let fx = Fixture::new();
    fx.running("a", "cluster-x").await;
    fx.running("z", "cluster-y").await;

    fx.reconciler
        .reconcile(ACCOUNT, &ecs_snapshot(&[], t0() + Duration::hours(5)))
        .await
        .unwrap();

    assert_eq!(fx.state("a").await, InstanceState::Stopped);
    assert_eq!(fx.state("z").await, InstanceState::Running);
}

#[tokio::test]
async fn test_genuine_stop_between_phases_is_benign() {
    let fx = Fixture::new();
    fx.running("a", "cluster-x").await;
    fx.lifecycle
        .handle(&LifecycleEvent {
            account_id: ACCOUNT.to_string(),
            instance_id: "a".to_string(),
            cluster_id: "cluster-x".to_string(),
            event_type: LifecycleEventType::Stop,
            timestamp: t0() + Duration::hours(2),
        })
        .await
        .unwrap();

    let report = fx
        .reconciler
        .reconcile(ACCOUNT, &ecs_snapshot(&[], t0() + Duration::hours(5)))
        .await
        .unwrap();

    assert!(report.stopped.is_empty());
    let record = fx.store.fetch(ACCOUNT, "a").await.unwrap().unwrap();
    assert_eq!(record.usage_stop_time, Some(t0() + Duration::hours(2)));
}

#[tokio::test]
async fn test_k8s_snapshot_normalizes_ids() {
    let fx = Fixture::new();
    fx.running("node-1", "cluster-x").await;
    fx.running("pod-1", "cluster-x").await;
    fx.running("pod-2", "cluster-x").await;

    let snapshot = K8sSyncSnapshot {
        cluster_id: "cluster-x".to_string(),
        setting_id: "setting-1".to_string(),
        last_processed_timestamp: t0() + Duration::hours(3),
        node_uids: vec!["node-1".to_string()],
        pod_uids: vec!["pod-1".to_string()],
    };
    assert_eq!(snapshot.active_instance_ids().len(), 2);

    let report = fx.reconciler.reconcile(ACCOUNT, &snapshot).await.unwrap();
    assert_eq!(report.stopped, vec!["pod-2".to_string()]);
}

#[tokio::test]
async fn test_store_outage_aborts_reconcile() {
    let fx = Fixture::new();
    fx.store.set_unavailable(true);

    let result = fx
        .reconciler
        .reconcile(ACCOUNT, &ecs_snapshot(&[], t0()))
        .await;
    assert!(result.is_err());
}
