//! Task writer: ECS tasks on EC2 or Fargate

use super::{WriteOutcome, WriterContext};
use crate::error::StoreError;
use crate::models::{
    instance_id_from_arn, CloudProvider, ClusterType, InstanceMetadata, InstanceRecord,
    InstanceState, InstanceType, Resource,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaunchType {
    Ec2,
    Fargate,
}

/// Observed ECS task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub cluster_id: String,
    pub cluster_name: String,
    pub setting_id: String,
    pub task_arn: String,
    /// Set for EC2 launch type
    #[serde(default)]
    pub container_instance_arn: Option<String>,
    pub launch_type: LaunchType,
    #[serde(default)]
    pub service_name: Option<String>,
    pub resource: Resource,
    #[serde(default)]
    pub region: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskInfo {
    pub fn instance_type(&self) -> InstanceType {
        match self.launch_type {
            LaunchType::Ec2 => InstanceType::EcsTaskEc2,
            LaunchType::Fargate => InstanceType::EcsTaskFargate,
        }
    }
}

/// Materialize an `INITIALIZING` record for a task.
///
/// EC2 tasks inherit their container instance's host metadata and record the
/// container instance's total resource for proportional cost allocation.
pub async fn write_task_info(
    ctx: &WriterContext,
    account_id: &str,
    info: &TaskInfo,
) -> Result<WriteOutcome, StoreError> {
    let instance_id = instance_id_from_arn(&info.task_arn);

    if ctx.is_active(account_id, instance_id).await? {
        debug!(
            account_id = %account_id,
            instance_id = %instance_id,
            "Task already active, skipping"
        );
        return Ok(WriteOutcome::AlreadyActive);
    }

    let mut metadata = InstanceMetadata {
        region: info.region.clone(),
        cloud_provider: Some(CloudProvider::Aws),
        cluster_type: Some(ClusterType::Ecs),
        launch_type: Some(format!("{:?}", info.launch_type).to_uppercase()),
        workload_name: info.service_name.clone(),
        ..Default::default()
    };

    if let (LaunchType::Ec2, Some(arn)) = (info.launch_type, info.container_instance_arn.as_deref()) {
        let parent_id = instance_id_from_arn(arn);
        match ctx.store.fetch(account_id, parent_id).await? {
            Some(parent) => {
                metadata.inherit_host_fields(&parent.metadata);
                metadata.set_parent(parent_id, parent.total_resource);
            }
            None => {
                ctx.logger
                    .log_parent_unresolved(account_id, &info.cluster_id, instance_id, parent_id);
                metadata.parent_resource_id = Some(parent_id.to_string());
            }
        }
    }

    let harness_service_info = ctx
        .resolve_service(account_id, &info.cluster_id, info.service_name.as_deref())
        .await;

    let record = InstanceRecord {
        record_id: 0,
        account_id: account_id.to_string(),
        instance_id: instance_id.to_string(),
        instance_name: instance_id.to_string(),
        cluster_id: info.cluster_id.clone(),
        cluster_name: info.cluster_name.clone(),
        setting_id: info.setting_id.clone(),
        instance_type: info.instance_type(),
        instance_state: InstanceState::Initializing,
        total_resource: info.resource,
        metadata,
        created_at: info.created_at,
        usage_start_time: None,
        usage_stop_time: None,
        harness_service_info,
        version: 0,
    };

    ctx.persist(record).await
}
