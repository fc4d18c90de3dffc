//! Container-instance writer: ECS container instances on EC2 hosts

use super::{WriteOutcome, WriterContext};
use crate::error::StoreError;
use crate::models::{
    instance_id_from_arn, CloudProvider, ClusterType, InstanceMetadata, InstanceRecord,
    InstanceState, InstanceType, Resource,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Observed ECS container instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInstanceInfo {
    pub cluster_id: String,
    pub cluster_name: String,
    pub setting_id: String,
    pub container_instance_arn: String,
    /// EC2 host the container instance runs on
    pub ec2_instance_id: String,
    pub registered_resource: Resource,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub operating_system: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Materialize an `INITIALIZING` record for a container instance, enriched with
/// its EC2 host's metadata when the host is known
pub async fn write_container_instance_info(
    ctx: &WriterContext,
    account_id: &str,
    info: &ContainerInstanceInfo,
) -> Result<WriteOutcome, StoreError> {
    let instance_id = instance_id_from_arn(&info.container_instance_arn);

    if ctx.is_active(account_id, instance_id).await? {
        debug!(
            account_id = %account_id,
            instance_id = %instance_id,
            "Container instance already active, skipping"
        );
        return Ok(WriteOutcome::AlreadyActive);
    }

    let mut metadata = InstanceMetadata {
        region: info.region.clone(),
        operating_system: info.operating_system.clone(),
        cloud_provider: Some(CloudProvider::Aws),
        cluster_type: Some(ClusterType::Ecs),
        ..Default::default()
    };

    let host_id = instance_id_from_arn(&info.ec2_instance_id);
    match ctx.store.fetch(account_id, host_id).await? {
        Some(host) => {
            metadata.inherit_host_fields(&host.metadata);
            metadata.set_parent(host_id, host.total_resource);
        }
        None => {
            ctx.logger
                .log_parent_unresolved(account_id, &info.cluster_id, instance_id, host_id);
            metadata.parent_resource_id = Some(host_id.to_string());
        }
    }

    let record = InstanceRecord {
        record_id: 0,
        account_id: account_id.to_string(),
        instance_id: instance_id.to_string(),
        instance_name: instance_id.to_string(),
        cluster_id: info.cluster_id.clone(),
        cluster_name: info.cluster_name.clone(),
        setting_id: info.setting_id.clone(),
        instance_type: InstanceType::EcsContainerInstance,
        instance_state: InstanceState::Initializing,
        total_resource: info.registered_resource,
        metadata,
        created_at: info.registered_at,
        usage_start_time: None,
        usage_stop_time: None,
        harness_service_info: None,
        version: 0,
    };

    ctx.persist(record).await
}
