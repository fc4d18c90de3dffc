//! Tests for the batch pipeline

use super::*;
use crate::ingest::{BillingBatch, LifecyclePayload};
use crate::models::{
    CloudProvider, ClusterType, InstanceState, InstanceType, LifecycleEventType, Resource,
};
use crate::sink::MemorySink;
use crate::store::testing::ConflictingStore;
use crate::store::InMemoryInstanceStore;
use crate::utilization::{ContainerUsage, MetricSeries, NodeUtilizationMetric, PodUtilizationMetric};
use crate::writers::{ContainerInstanceInfo, LaunchType, NodeInfo, PodInfo, TaskInfo};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;

const ACCOUNT: &str = "acct-1";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

struct Harness {
    store: Arc<InMemoryInstanceStore>,
    sink: Arc<MemorySink>,
    pipeline: BatchPipeline,
}

fn harness(max_concurrency: usize) -> Harness {
    let store = Arc::new(InMemoryInstanceStore::new());
    let sink = Arc::new(MemorySink::new());
    let pipeline = BatchPipeline::builder()
        .store(store.clone())
        .billing_sink(sink.clone())
        .utilization_sink(sink.clone())
        .max_concurrency(max_concurrency)
        .worker_name("test-worker")
        .build()
        .unwrap();
    Harness {
        store,
        sink,
        pipeline,
    }
}

fn node_info(node_uid: &str) -> EventEnvelope {
    EventEnvelope::new(
        ACCOUNT,
        Event::NodeInfo(NodeInfo {
            cluster_id: "cluster-1".to_string(),
            cluster_name: "prod".to_string(),
            setting_id: "setting-1".to_string(),
            node_uid: node_uid.to_string(),
            node_name: format!("{}-name", node_uid),
            cluster_type: ClusterType::K8s,
            cloud_provider: CloudProvider::Aws,
            provider_id: None,
            allocatable: Resource::new(4096.0, 16384.0),
            labels: BTreeMap::new(),
            creation_time: t0() - Duration::hours(1),
        }),
    )
}

fn fargate_task(task_id: &str) -> EventEnvelope {
    EventEnvelope::new(
        ACCOUNT,
        Event::TaskInfo(TaskInfo {
            cluster_id: "ecs-cluster".to_string(),
            cluster_name: "prod-ecs".to_string(),
            setting_id: "setting-1".to_string(),
            task_arn: format!("arn:aws:ecs:us-east-1:123:task/prod-ecs/{}", task_id),
            container_instance_arn: None,
            launch_type: LaunchType::Fargate,
            service_name: None,
            resource: Resource::new(256.0, 512.0),
            region: Some("us-east-1".to_string()),
            created_at: t0() - Duration::minutes(5),
        }),
    )
}

fn lifecycle(instance_id: &str, cluster_id: &str, event_type: LifecycleEventType, at: DateTime<Utc>) -> EventEnvelope {
    EventEnvelope::new(
        ACCOUNT,
        Event::Lifecycle(LifecyclePayload {
            instance_id: instance_id.to_string(),
            cluster_id: cluster_id.to_string(),
            event_type,
            timestamp: at,
        }),
    )
}

fn k8s_sync(node_uids: &[&str], at: DateTime<Utc>) -> EventEnvelope {
    EventEnvelope::new(
        ACCOUNT,
        Event::K8sSync(K8sSyncSnapshot {
            cluster_id: "cluster-1".to_string(),
            setting_id: "setting-1".to_string(),
            last_processed_timestamp: at,
            node_uids: node_uids.iter().map(|s| s.to_string()).collect(),
            pod_uids: Vec::new(),
        }),
    )
}

async fn state_of(store: &InMemoryInstanceStore, instance_id: &str) -> Option<InstanceState> {
    store
        .fetch(ACCOUNT, instance_id)
        .await
        .unwrap()
        .map(|r| r.instance_state)
}

#[tokio::test]
async fn test_info_then_start_in_one_batch() {
    let h = harness(4);

    let report = h
        .pipeline
        .process_batch(vec![
            fargate_task("task-1"),
            lifecycle(
                "arn:aws:ecs:us-east-1:123:task/prod-ecs/task-1",
                "ecs-cluster",
                LifecycleEventType::Start,
                t0(),
            ),
            node_info("node-a"),
            node_info("node-a"),
        ])
        .await
        .unwrap();

    assert_eq!(report.events, 4);
    assert_eq!(report.created, 2);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.transitions, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(state_of(&h.store, "task-1").await, Some(InstanceState::Running));
    assert_eq!(state_of(&h.store, "node-a").await, Some(InstanceState::Initializing));
}

#[tokio::test]
async fn test_partition_preserves_input_order() {
    let h = harness(4);

    // START arrives before the record exists and is ignored
    let report = h
        .pipeline
        .process_batch(vec![
            lifecycle("task-1", "ecs-cluster", LifecycleEventType::Start, t0()),
            fargate_task("task-1"),
        ])
        .await
        .unwrap();

    assert_eq!(report.ignored, 1);
    assert_eq!(report.created, 1);
    assert_eq!(
        state_of(&h.store, "task-1").await,
        Some(InstanceState::Initializing)
    );
}

#[tokio::test]
async fn test_stale_stop_counted() {
    let h = harness(4);

    let report = h
        .pipeline
        .process_batch(vec![
            node_info("node-a"),
            lifecycle("node-a", "cluster-1", LifecycleEventType::Start, t0()),
            lifecycle(
                "node-a",
                "cluster-1",
                LifecycleEventType::Stop,
                t0() - Duration::minutes(10),
            ),
        ])
        .await
        .unwrap();

    assert_eq!(report.transitions, 1);
    assert_eq!(report.stale, 1);
    assert_eq!(state_of(&h.store, "node-a").await, Some(InstanceState::Running));
}

#[tokio::test]
async fn test_many_partitions_with_small_concurrency() {
    let h = harness(2);
    let envelopes: Vec<EventEnvelope> = (0..50).map(|i| node_info(&format!("node-{}", i))).collect();

    let report = h.pipeline.process_batch(envelopes).await.unwrap();

    assert_eq!(report.created, 50);
    assert_eq!(h.store.len(), 50);
}

#[tokio::test]
async fn test_sync_stops_missing_instances_after_partitions() {
    let h = harness(4);

    let mut batch = Vec::new();
    for id in ["node-a", "node-b", "node-c"] {
        batch.push(node_info(id));
        batch.push(lifecycle(id, "cluster-1", LifecycleEventType::Start, t0()));
    }
    // Snapshot sits ahead of the events in input order but runs after them
    batch.insert(0, k8s_sync(&["node-a", "node-b"], t0() + Duration::hours(1)));

    let report = h.pipeline.process_batch(batch).await.unwrap();

    assert_eq!(report.synthetic_stops, 1);
    assert_eq!(report.transitions, 4);
    assert_eq!(state_of(&h.store, "node-c").await, Some(InstanceState::Stopped));
    assert_eq!(state_of(&h.store, "node-a").await, Some(InstanceState::Running));

    // Replaying the snapshot changes nothing
    let replay = h
        .pipeline
        .process_batch(vec![k8s_sync(&["node-a", "node-b"], t0() + Duration::hours(1))])
        .await
        .unwrap();
    assert_eq!(replay.synthetic_stops, 0);
    assert_eq!(replay.transitions, 0);
}

fn utilization_message(series_count: usize) -> EventEnvelope {
    let timestamps = vec![t0(), t0() + Duration::hours(1)];
    let series = [
        ("CPUUtilization", "Average"),
        ("CPUUtilization", "Maximum"),
        ("MemoryUtilization", "Average"),
        ("MemoryUtilization", "Maximum"),
    ]
    .iter()
    .take(series_count)
    .map(|(metric, statistic)| MetricSeries {
        metric_name: metric.to_string(),
        statistic: statistic.to_string(),
        timestamps: timestamps.clone(),
        values: vec![50.0, 60.0],
    })
    .collect();

    EventEnvelope::new(
        ACCOUNT,
        Event::AggregatedUtilization(AggregatedUtilization {
            cluster_id: "ecs-cluster".to_string(),
            setting_id: "setting-1".to_string(),
            instance_id: "arn:aws:ecs:us-east-1:123:service/prod-ecs/checkout".to_string(),
            instance_type: InstanceType::EcsTaskEc2,
            series,
        }),
    )
}

#[tokio::test]
async fn test_utilization_rows_written_and_bad_message_skipped() {
    let h = harness(4);

    let report = h
        .pipeline
        .process_batch(vec![
            utilization_message(4),
            utilization_message(3),
            EventEnvelope::new(
                ACCOUNT,
                Event::NodeUtilization(NodeUtilizationMetric {
                    cluster_id: "cluster-1".to_string(),
                    setting_id: "setting-1".to_string(),
                    node_uid: "node-a".to_string(),
                    start_timestamp: t0(),
                    end_timestamp: t0() + Duration::minutes(1),
                    cpu_nano_cores: 1_000_000_000.0,
                    memory_bytes: 1_048_576.0,
                }),
            ),
            EventEnvelope::new(
                ACCOUNT,
                Event::PodUtilization(PodUtilizationMetric {
                    cluster_id: "cluster-1".to_string(),
                    setting_id: "setting-1".to_string(),
                    pod_uid: "pod-1".to_string(),
                    start_timestamp: t0(),
                    end_timestamp: t0() + Duration::minutes(1),
                    containers: vec![ContainerUsage {
                        name: "app".to_string(),
                        cpu_nano_cores: 500_000_000.0,
                        memory_bytes: 2_097_152.0,
                    }],
                }),
            ),
        ])
        .await
        .unwrap();

    assert_eq!(report.utilization_rows, 2);
    assert_eq!(report.granular_rows, 2);
    assert_eq!(report.failed, 1);

    let samples = h.sink.aggregated_rows().unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].instance_id, "checkout");
    assert_eq!(samples[0].cpu.avg, 0.5);

    let granular = h.sink.granular_rows().unwrap();
    assert_eq!(granular[0].cpu_units, 1024.0);
    assert_eq!(granular[1].memory_mb, 2.0);
}

fn billing_entry(instance_id: &str, instance_type: InstanceType, amount: f64) -> BillingRecord {
    let mut row = BillingRecord::empty(
        ACCOUNT,
        "cluster-1",
        instance_id,
        instance_type,
        t0(),
        t0() + Duration::hours(1),
    );
    row.billing_amount = amount;
    row
}

#[tokio::test]
async fn test_billing_batch_aggregated_in_one_write() {
    let h = harness(4);

    let mut node = billing_entry("node-a", InstanceType::K8sNode, 100.0);
    node.system_cost = 10.0;
    let mut pod = billing_entry("pod-1", InstanceType::K8sPod, 70.0);
    pod.parent_instance_id = Some("node-a".to_string());

    let report = h
        .pipeline
        .process_batch(vec![EventEnvelope::new(
            ACCOUNT,
            Event::BillingBatch(BillingBatch {
                records: vec![node, pod],
            }),
        )])
        .await
        .unwrap();

    assert_eq!(report.billing_rows, 2);
    let rows = h.sink.billing_rows().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].unallocated_cost, 20.0);
    assert_eq!(rows[1].instance_type, InstanceType::ClusterUnallocated);
    assert_eq!(rows[1].billing_amount, 30.0);
}

#[tokio::test]
async fn test_store_outage_aborts_batch() {
    let h = harness(4);
    h.store.set_unavailable(true);

    let err = h
        .pipeline
        .process_batch(vec![node_info("node-a"), node_info("node-b")])
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(err, PipelineError::Store(StoreError::Unavailable(_))));
}

struct FailingSink;

#[async_trait]
impl BillingSink for FailingSink {
    async fn write_billing(&self, _rows: &[BillingRecord]) -> Result<()> {
        Err(PipelineError::Sink("disk full".to_string()))
    }
}

#[tokio::test]
async fn test_sink_failure_aborts_batch() {
    let pipeline = BatchPipeline::builder()
        .store(Arc::new(InMemoryInstanceStore::new()))
        .billing_sink(Arc::new(FailingSink))
        .utilization_sink(Arc::new(MemorySink::new()))
        .build()
        .unwrap();

    let err = pipeline
        .process_batch(vec![EventEnvelope::new(
            ACCOUNT,
            Event::BillingBatch(BillingBatch {
                records: vec![billing_entry("node-a", InstanceType::K8sNode, 5.0)],
            }),
        )])
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Sink(_)));
}

#[test]
fn test_builder_requires_store_and_sinks() {
    let result = BatchPipeline::builder()
        .billing_sink(Arc::new(MemorySink::new()))
        .utilization_sink(Arc::new(MemorySink::new()))
        .build();
    assert!(matches!(result, Err(PipelineError::Config(_))));

    let result = BatchPipeline::builder()
        .store(Arc::new(InMemoryInstanceStore::new()))
        .build();
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[test]
fn test_builder_rejects_zero_concurrency() {
    let result = BatchPipeline::builder()
        .store(Arc::new(InMemoryInstanceStore::new()))
        .billing_sink(Arc::new(MemorySink::new()))
        .utilization_sink(Arc::new(MemorySink::new()))
        .max_concurrency(0)
        .build();
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[test]
fn test_builder_rejects_non_positive_coarse_bucket() {
    for bucket in [Duration::zero(), Duration::minutes(-5)] {
        let result = BatchPipeline::builder()
            .store(Arc::new(InMemoryInstanceStore::new()))
            .billing_sink(Arc::new(MemorySink::new()))
            .utilization_sink(Arc::new(MemorySink::new()))
            .coarse_bucket(bucket)
            .build();
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}

#[test]
fn test_default_config() {
    let config = PipelineConfig::default();
    assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
    assert_eq!(config.coarse_bucket, Duration::hours(1));
    assert_eq!(config.max_conflict_retries, DEFAULT_MAX_CONFLICT_RETRIES);
}

const CI_ARN: &str = "arn:aws:ecs:us-east-1:123:container-instance/prod-ecs/ci-1";

fn pod_info(pod_uid: &str, node_name: &str) -> EventEnvelope {
    EventEnvelope::new(
        ACCOUNT,
        Event::PodInfo(PodInfo {
            cluster_id: "cluster-1".to_string(),
            cluster_name: "prod".to_string(),
            setting_id: "setting-1".to_string(),
            pod_uid: pod_uid.to_string(),
            pod_name: format!("{}-name", pod_uid),
            namespace: "default".to_string(),
            node_name: node_name.to_string(),
            requested: Resource::new(512.0, 1024.0),
            workload_name: None,
            creation_time: t0() - Duration::minutes(5),
        }),
    )
}

fn ec2_host(instance_id: &str) -> EventEnvelope {
    EventEnvelope::new(
        ACCOUNT,
        Event::NodeInfo(NodeInfo {
            cluster_id: "ecs-cluster".to_string(),
            cluster_name: "prod-ecs".to_string(),
            setting_id: "setting-1".to_string(),
            node_uid: instance_id.to_string(),
            node_name: instance_id.to_string(),
            cluster_type: ClusterType::Ecs,
            cloud_provider: CloudProvider::Aws,
            provider_id: None,
            allocatable: Resource::new(8192.0, 32768.0),
            labels: BTreeMap::from([(
                "node.kubernetes.io/instance-type".to_string(),
                "m5.2xlarge".to_string(),
            )]),
            creation_time: t0() - Duration::hours(2),
        }),
    )
}

fn container_instance(host_id: &str) -> EventEnvelope {
    EventEnvelope::new(
        ACCOUNT,
        Event::ContainerInstanceInfo(ContainerInstanceInfo {
            cluster_id: "ecs-cluster".to_string(),
            cluster_name: "prod-ecs".to_string(),
            setting_id: "setting-1".to_string(),
            container_instance_arn: CI_ARN.to_string(),
            ec2_instance_id: host_id.to_string(),
            registered_resource: Resource::new(8000.0, 30000.0),
            region: Some("us-east-1".to_string()),
            operating_system: None,
            registered_at: t0() - Duration::hours(1),
        }),
    )
}

fn ec2_task(task_id: &str) -> EventEnvelope {
    EventEnvelope::new(
        ACCOUNT,
        Event::TaskInfo(TaskInfo {
            cluster_id: "ecs-cluster".to_string(),
            cluster_name: "prod-ecs".to_string(),
            setting_id: "setting-1".to_string(),
            task_arn: format!("arn:aws:ecs:us-east-1:123:task/prod-ecs/{}", task_id),
            container_instance_arn: Some(CI_ARN.to_string()),
            launch_type: LaunchType::Ec2,
            service_name: None,
            resource: Resource::new(1024.0, 2048.0),
            region: None,
            created_at: t0() - Duration::minutes(5),
        }),
    )
}

#[test]
fn test_partitions_grouped_into_dependency_waves() {
    let staged = StagedBatch::stage(vec![
        ec2_task("task-1"),
        pod_info("pod-1", "node-a-name"),
        container_instance("i-0abc"),
        node_info("node-a"),
        lifecycle("task-1", "ecs-cluster", LifecycleEventType::Start, t0()),
        lifecycle("other", "ecs-cluster", LifecycleEventType::Start, t0()),
    ]);

    let waves = StagedBatch::waves(staged.partitions);

    let kinds: Vec<Vec<Vec<&str>>> = waves
        .iter()
        .map(|wave| {
            wave.iter()
                .map(|partition| partition.iter().map(|e| e.event.kind()).collect())
                .collect()
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            vec![vec!["node_info"], vec!["lifecycle"]],
            vec![vec!["pod_info"], vec!["container_instance_info"]],
            vec![vec!["task_info", "lifecycle"]],
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_children_linked_to_parents_from_same_batch() {
    for _ in 0..25 {
        let h = harness(8);

        // Children ahead of their parents in input order
        let mut batch = vec![
            ec2_task("task-1"),
            pod_info("pod-1", "node-a-name"),
            container_instance("i-0abc"),
        ];
        batch.extend((0..10).map(|i| fargate_task(&format!("fargate-{}", i))));
        batch.push(node_info("node-a"));
        batch.push(ec2_host("i-0abc"));

        let report = h.pipeline.process_batch(batch).await.unwrap();
        assert_eq!(report.created, 15);
        assert_eq!(report.failed, 0);

        let pod = h.store.fetch(ACCOUNT, "pod-1").await.unwrap().unwrap();
        assert_eq!(pod.metadata.parent_resource_id.as_deref(), Some("node-a"));
        assert_eq!(pod.metadata.parent_resource_cpu, Some(4096.0));

        let ci = h.store.fetch(ACCOUNT, "ci-1").await.unwrap().unwrap();
        assert_eq!(ci.metadata.parent_resource_id.as_deref(), Some("i-0abc"));
        assert_eq!(ci.metadata.parent_resource_cpu, Some(8192.0));
        assert_eq!(ci.metadata.instance_family.as_deref(), Some("m5.2xlarge"));

        let task = h.store.fetch(ACCOUNT, "task-1").await.unwrap().unwrap();
        assert_eq!(task.metadata.parent_resource_id.as_deref(), Some("ci-1"));
        assert_eq!(task.metadata.parent_resource_memory, Some(30000.0));
        assert_eq!(task.metadata.instance_family.as_deref(), Some("m5.2xlarge"));
        assert_eq!(task.metadata.region.as_deref(), Some("us-east-1"));
    }
}

#[tokio::test]
async fn test_exhausted_conflict_retries_skip_the_event() {
    let store = Arc::new(ConflictingStore::always());
    let sink = Arc::new(MemorySink::new());
    let pipeline = BatchPipeline::builder()
        .store(store.clone())
        .billing_sink(sink.clone())
        .utilization_sink(sink)
        .max_conflict_retries(2)
        .build()
        .unwrap();

    let report = pipeline
        .process_batch(vec![
            fargate_task("task-1"),
            lifecycle("task-1", "ecs-cluster", LifecycleEventType::Start, t0()),
            node_info("node-a"),
        ])
        .await
        .unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.transitions, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(store.update_calls(), 3);
    assert_eq!(
        state_of(&store.inner, "task-1").await,
        Some(InstanceState::Initializing)
    );
}
