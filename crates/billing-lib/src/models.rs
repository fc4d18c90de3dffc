//! Core data models for the billing pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of billable compute unit tracked by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceType {
    K8sNode,
    K8sPod,
    Ec2Instance,
    EcsContainerInstance,
    EcsTaskEc2,
    EcsTaskFargate,
    ClusterUnallocated,
}

/// How an instance type participates in cost allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostRole {
    /// Provides capacity that children are carved out of (nodes, container instances)
    Parent,
    /// Consumes a slice of a parent's capacity (pods, EC2-backed tasks)
    Child,
    /// Billed on its own with no parent capacity (Fargate tasks)
    Standalone,
    /// Synthesized by aggregation, never an input
    Aggregate,
}

impl InstanceType {
    pub fn cost_role(&self) -> CostRole {
        match self {
            InstanceType::K8sNode | InstanceType::Ec2Instance | InstanceType::EcsContainerInstance => {
                CostRole::Parent
            }
            InstanceType::K8sPod | InstanceType::EcsTaskEc2 => CostRole::Child,
            InstanceType::EcsTaskFargate => CostRole::Standalone,
            InstanceType::ClusterUnallocated => CostRole::Aggregate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::K8sNode => "K8S_NODE",
            InstanceType::K8sPod => "K8S_POD",
            InstanceType::Ec2Instance => "EC2_INSTANCE",
            InstanceType::EcsContainerInstance => "ECS_CONTAINER_INSTANCE",
            InstanceType::EcsTaskEc2 => "ECS_TASK_EC2",
            InstanceType::EcsTaskFargate => "ECS_TASK_FARGATE",
            InstanceType::ClusterUnallocated => "CLUSTER_UNALLOCATED",
        }
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an instance record.
///
/// Transitions are monotonic: `Initializing -> Running -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Initializing,
    Running,
    Stopped,
}

impl InstanceState {
    /// States in which a record counts as active
    pub const ACTIVE: [InstanceState; 2] = [InstanceState::Initializing, InstanceState::Running];

    pub fn is_active(&self) -> bool {
        matches!(self, InstanceState::Initializing | InstanceState::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Initializing => "INITIALIZING",
            InstanceState::Running => "RUNNING",
            InstanceState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterType {
    K8s,
    Ecs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloudProvider {
    Aws,
    Gcp,
    Azure,
    OnPrem,
    Unknown,
}

/// Compute shape of an instance. One vCPU is 1024 cpu units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resource {
    pub cpu_units: f64,
    pub memory_mb: f64,
}

impl Resource {
    pub fn new(cpu_units: f64, memory_mb: f64) -> Self {
        Self {
            cpu_units,
            memory_mb,
        }
    }
}

/// Keys written into [`InstanceMetadata::extra`]
pub mod metadata_keys {
    pub const ZONE: &str = "zone";
}

/// Instance metadata with typed known fields and an open extension map
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstanceMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<CloudProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_type: Option<ClusterType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_provider_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_resource_cpu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_resource_memory: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_type: Option<String>,
    /// Keys not covered by a typed field
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, String>,
}

impl InstanceMetadata {
    /// Copy the host-describing fields (family, region, OS, provider) from a parent.
    /// Fields already set on `self` are kept.
    pub fn inherit_host_fields(&mut self, parent: &InstanceMetadata) {
        if self.instance_family.is_none() {
            self.instance_family = parent.instance_family.clone();
        }
        if self.region.is_none() {
            self.region = parent.region.clone();
        }
        if self.operating_system.is_none() {
            self.operating_system = parent.operating_system.clone();
        }
        if self.cloud_provider.is_none() {
            self.cloud_provider = parent.cloud_provider;
        }
        if self.cloud_provider_instance_id.is_none() {
            self.cloud_provider_instance_id = parent.cloud_provider_instance_id.clone();
        }
    }

    /// Record the parent linkage used for proportional cost allocation
    pub fn set_parent(&mut self, parent_id: impl Into<String>, parent_resource: Resource) {
        self.parent_resource_id = Some(parent_id.into());
        self.parent_resource_cpu = Some(parent_resource.cpu_units);
        self.parent_resource_memory = Some(parent_resource.memory_mb);
    }
}

/// Reference to a deployed service resolved by the linkage lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReference {
    pub service_id: String,
    pub service_name: String,
    pub app_id: Option<String>,
    pub env_id: Option<String>,
}

/// Persistent state of one incarnation of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Store-assigned identity of this incarnation
    pub record_id: u64,
    pub account_id: String,
    pub instance_id: String,
    pub instance_name: String,
    pub cluster_id: String,
    pub cluster_name: String,
    pub setting_id: String,
    pub instance_type: InstanceType,
    pub instance_state: InstanceState,
    pub total_resource: Resource,
    pub metadata: InstanceMetadata,
    /// First sighting of the instance
    pub created_at: DateTime<Utc>,
    pub usage_start_time: Option<DateTime<Utc>>,
    pub usage_stop_time: Option<DateTime<Utc>>,
    pub harness_service_info: Option<ServiceReference>,
    /// Optimistic concurrency counter, bumped on every state change
    pub version: u64,
}

impl InstanceRecord {
    /// Time from which the record counts as active for historical queries
    pub fn active_since(&self) -> DateTime<Utc> {
        self.usage_start_time.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEventType {
    Start,
    Stop,
}

impl LifecycleEventType {
    /// State a record must be in for this event to apply
    pub fn source_state(&self) -> InstanceState {
        match self {
            LifecycleEventType::Start => InstanceState::Initializing,
            LifecycleEventType::Stop => InstanceState::Running,
        }
    }

    /// State the record moves to when the event applies
    pub fn target_state(&self) -> InstanceState {
        match self {
            LifecycleEventType::Start => InstanceState::Running,
            LifecycleEventType::Stop => InstanceState::Stopped,
        }
    }
}

/// START/STOP signal for an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub account_id: String,
    pub instance_id: String,
    pub cluster_id: String,
    pub event_type: LifecycleEventType,
    pub timestamp: DateTime<Utc>,
}

/// Avg/max pair for one utilization metric, as 0..1 fractions
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageStat {
    pub avg: f64,
    pub max: f64,
}

/// Coarse, cluster/service level utilization row for one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub account_id: String,
    pub instance_id: String,
    pub instance_type: InstanceType,
    pub cluster_id: String,
    pub setting_id: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub cpu: UsageStat,
    pub memory: UsageStat,
}

/// Fine-grained utilization row for a node or pod window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GranularUtilization {
    pub account_id: String,
    pub instance_id: String,
    pub instance_type: InstanceType,
    pub cluster_id: String,
    pub setting_id: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub cpu_units: f64,
    pub memory_mb: f64,
}

/// Per-cluster accumulator used within one aggregation batch
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterCostData {
    pub account_id: String,
    pub cluster_id: String,
    pub cluster_name: String,
    pub setting_id: String,
    pub total_cost: f64,
    pub utilized_cost: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Billing row for one instance and time bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub account_id: String,
    pub instance_id: String,
    #[serde(default)]
    pub instance_name: String,
    pub cluster_id: String,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub setting_id: String,
    pub instance_type: InstanceType,
    /// Parent instance for child entries (pod -> node, task -> container instance)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<String>,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub billing_amount: f64,
    #[serde(default)]
    pub cpu_billing_amount: f64,
    #[serde(default)]
    pub memory_billing_amount: f64,
    #[serde(default)]
    pub idle_cost: f64,
    #[serde(default)]
    pub cpu_idle_cost: f64,
    #[serde(default)]
    pub memory_idle_cost: f64,
    #[serde(default)]
    pub system_cost: f64,
    #[serde(default)]
    pub cpu_system_cost: f64,
    #[serde(default)]
    pub memory_system_cost: f64,
    #[serde(default)]
    pub unallocated_cost: f64,
    #[serde(default)]
    pub cpu_unallocated_cost: f64,
    #[serde(default)]
    pub memory_unallocated_cost: f64,
    #[serde(default)]
    pub actual_idle_cost: f64,
    #[serde(default)]
    pub cpu_actual_idle_cost: f64,
    #[serde(default)]
    pub memory_actual_idle_cost: f64,
    #[serde(default)]
    pub usage_duration_seconds: f64,
    #[serde(default)]
    pub max_cpu_utilization: f64,
    #[serde(default)]
    pub max_memory_utilization: f64,
    #[serde(default)]
    pub avg_cpu_utilization: f64,
    #[serde(default)]
    pub avg_memory_utilization: f64,
}

impl BillingRecord {
    /// A zero-cost row for the given identity and bucket
    pub fn empty(
        account_id: impl Into<String>,
        cluster_id: impl Into<String>,
        instance_id: impl Into<String>,
        instance_type: InstanceType,
        start_timestamp: DateTime<Utc>,
        end_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            instance_id: instance_id.into(),
            instance_name: String::new(),
            cluster_id: cluster_id.into(),
            cluster_name: String::new(),
            setting_id: String::new(),
            instance_type,
            parent_instance_id: None,
            start_timestamp,
            end_timestamp,
            billing_amount: 0.0,
            cpu_billing_amount: 0.0,
            memory_billing_amount: 0.0,
            idle_cost: 0.0,
            cpu_idle_cost: 0.0,
            memory_idle_cost: 0.0,
            system_cost: 0.0,
            cpu_system_cost: 0.0,
            memory_system_cost: 0.0,
            unallocated_cost: 0.0,
            cpu_unallocated_cost: 0.0,
            memory_unallocated_cost: 0.0,
            actual_idle_cost: 0.0,
            cpu_actual_idle_cost: 0.0,
            memory_actual_idle_cost: 0.0,
            usage_duration_seconds: 0.0,
            max_cpu_utilization: 0.0,
            max_memory_utilization: 0.0,
            avg_cpu_utilization: 0.0,
            avg_memory_utilization: 0.0,
        }
    }
}

/// Strip an ARN-like identifier down to the segment after the last `/`.
///
/// `arn:aws:ecs:us-east-1:123:task/cluster/abc` becomes `abc`; bare ids pass through.
pub fn instance_id_from_arn(arn: &str) -> &str {
    match arn.rfind('/') {
        Some(idx) => &arn[idx + 1..],
        None => arn,
    }
}
