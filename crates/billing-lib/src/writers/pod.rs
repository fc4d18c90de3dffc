//! Pod writer: Kubernetes pods scheduled on known nodes

use super::{WriteOutcome, WriterContext};
use crate::error::StoreError;
use crate::models::{
    ClusterType, InstanceMetadata, InstanceRecord, InstanceState, InstanceType, Resource,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Observed Kubernetes pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodInfo {
    pub cluster_id: String,
    pub cluster_name: String,
    pub setting_id: String,
    pub pod_uid: String,
    pub pod_name: String,
    pub namespace: String,
    pub node_name: String,
    /// Summed container requests
    pub requested: Resource,
    #[serde(default)]
    pub workload_name: Option<String>,
    pub creation_time: DateTime<Utc>,
}

/// Materialize an `INITIALIZING` record for a pod, linked to the node it runs on
pub async fn write_pod_info(
    ctx: &WriterContext,
    account_id: &str,
    info: &PodInfo,
) -> Result<WriteOutcome, StoreError> {
    let instance_id = info.pod_uid.as_str();

    if ctx.is_active(account_id, instance_id).await? {
        debug!(
            account_id = %account_id,
            instance_id = %instance_id,
            "Pod already active, skipping"
        );
        return Ok(WriteOutcome::AlreadyActive);
    }

    let mut metadata = InstanceMetadata {
        cluster_type: Some(ClusterType::K8s),
        namespace: Some(info.namespace.clone()),
        workload_name: info.workload_name.clone(),
        ..Default::default()
    };

    match ctx
        .store
        .fetch_active_by_name(account_id, &info.cluster_id, &info.node_name)
        .await?
    {
        Some(node) => {
            metadata.inherit_host_fields(&node.metadata);
            metadata.set_parent(node.instance_id.clone(), node.total_resource);
        }
        None => {
            ctx.logger
                .log_parent_unresolved(account_id, &info.cluster_id, instance_id, &info.node_name);
        }
    }

    let harness_service_info = ctx
        .resolve_service(account_id, &info.cluster_id, info.workload_name.as_deref())
        .await;

    let record = InstanceRecord {
        record_id: 0,
        account_id: account_id.to_string(),
        instance_id: instance_id.to_string(),
        instance_name: info.pod_name.clone(),
        cluster_id: info.cluster_id.clone(),
        cluster_name: info.cluster_name.clone(),
        setting_id: info.setting_id.clone(),
        instance_type: InstanceType::K8sPod,
        instance_state: InstanceState::Initializing,
        total_resource: info.requested,
        metadata,
        created_at: info.creation_time,
        usage_start_time: None,
        usage_stop_time: None,
        harness_service_info,
        version: 0,
    };

    ctx.persist(record).await
}
