//! Node writer: Kubernetes nodes and EC2 hosts

use super::{WriteOutcome, WriterContext};
use crate::error::StoreError;
use crate::models::{
    instance_id_from_arn, metadata_keys, CloudProvider, ClusterType, InstanceMetadata, InstanceRecord,
    InstanceState, InstanceType, Resource,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

const INSTANCE_TYPE_LABELS: &[&str] = &[
    "node.kubernetes.io/instance-type",
    "beta.kubernetes.io/instance-type",
];
const REGION_LABELS: &[&str] = &[
    "topology.kubernetes.io/region",
    "failure-domain.beta.kubernetes.io/region",
];
const ZONE_LABELS: &[&str] = &[
    "topology.kubernetes.io/zone",
    "failure-domain.beta.kubernetes.io/zone",
];
const OS_LABELS: &[&str] = &["kubernetes.io/os", "beta.kubernetes.io/os"];

/// Observed compute node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub cluster_id: String,
    pub cluster_name: String,
    pub setting_id: String,
    /// Node uid for Kubernetes, EC2 instance id or ARN for ECS hosts
    pub node_uid: String,
    pub node_name: String,
    pub cluster_type: ClusterType,
    #[serde(default = "default_cloud_provider")]
    pub cloud_provider: CloudProvider,
    /// Cloud provider reference such as `aws:///us-east-1a/i-0abc`
    #[serde(default)]
    pub provider_id: Option<String>,
    pub allocatable: Resource,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub creation_time: DateTime<Utc>,
}

fn default_cloud_provider() -> CloudProvider {
    CloudProvider::Unknown
}

fn first_label(labels: &BTreeMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| labels.get(*k).cloned())
}

impl NodeInfo {
    pub fn instance_type(&self) -> InstanceType {
        match self.cluster_type {
            ClusterType::K8s => InstanceType::K8sNode,
            ClusterType::Ecs => InstanceType::Ec2Instance,
        }
    }

    /// Stable instance id for the node
    pub fn instance_id(&self) -> &str {
        match self.cluster_type {
            ClusterType::K8s => &self.node_uid,
            ClusterType::Ecs => instance_id_from_arn(&self.node_uid),
        }
    }

    fn metadata(&self) -> InstanceMetadata {
        let mut metadata = InstanceMetadata {
            instance_family: first_label(&self.labels, INSTANCE_TYPE_LABELS),
            region: first_label(&self.labels, REGION_LABELS),
            operating_system: first_label(&self.labels, OS_LABELS),
            cloud_provider: Some(self.cloud_provider),
            cluster_type: Some(self.cluster_type),
            cloud_provider_instance_id: self
                .provider_id
                .as_deref()
                .map(|id| instance_id_from_arn(id).to_string()),
            ..Default::default()
        };
        if let Some(zone) = first_label(&self.labels, ZONE_LABELS) {
            metadata.extra.insert(metadata_keys::ZONE.to_string(), zone);
        }
        metadata
    }
}

/// Materialize an `INITIALIZING` record for an observed node
pub async fn write_node_info(
    ctx: &WriterContext,
    account_id: &str,
    info: &NodeInfo,
) -> Result<WriteOutcome, StoreError> {
    let instance_id = info.instance_id();

    if ctx.is_active(account_id, instance_id).await? {
        debug!(
            account_id = %account_id,
            instance_id = %instance_id,
            "Node already active, skipping"
        );
        return Ok(WriteOutcome::AlreadyActive);
    }

    let record = InstanceRecord {
        record_id: 0,
        account_id: account_id.to_string(),
        instance_id: instance_id.to_string(),
        instance_name: info.node_name.clone(),
        cluster_id: info.cluster_id.clone(),
        cluster_name: info.cluster_name.clone(),
        setting_id: info.setting_id.clone(),
        instance_type: info.instance_type(),
        instance_state: InstanceState::Initializing,
        total_resource: info.allocatable,
        metadata: info.metadata(),
        created_at: info.creation_time,
        usage_start_time: None,
        usage_stop_time: None,
        harness_service_info: None,
        version: 0,
    };

    ctx.persist(record).await
}
