//! Sync snapshot messages for ECS and Kubernetes clusters

use crate::models::instance_id_from_arn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Common view over the snapshot flavours
pub trait SyncSnapshot {
    fn cluster_id(&self) -> &str;
    fn setting_id(&self) -> &str;
    fn last_processed_timestamp(&self) -> DateTime<Utc>;

    /// Bare instance ids of everything the collector reported active
    fn active_instance_ids(&self) -> HashSet<String>;
}

/// ECS snapshot: EC2 hosts, container instances and tasks by ARN
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcsSyncSnapshot {
    pub cluster_id: String,
    pub setting_id: String,
    pub last_processed_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub ec2_instance_arns: Vec<String>,
    #[serde(default)]
    pub container_instance_arns: Vec<String>,
    #[serde(default)]
    pub task_arns: Vec<String>,
}

impl SyncSnapshot for EcsSyncSnapshot {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn setting_id(&self) -> &str {
        &self.setting_id
    }

    fn last_processed_timestamp(&self) -> DateTime<Utc> {
        self.last_processed_timestamp
    }

    fn active_instance_ids(&self) -> HashSet<String> {
        self.ec2_instance_arns
            .iter()
            .chain(&self.container_instance_arns)
            .chain(&self.task_arns)
            .map(|arn| instance_id_from_arn(arn).to_string())
            .collect()
    }
}

/// Kubernetes snapshot: node and pod uids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct K8sSyncSnapshot {
    pub cluster_id: String,
    pub setting_id: String,
    pub last_processed_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub node_uids: Vec<String>,
    #[serde(default)]
    pub pod_uids: Vec<String>,
}

impl SyncSnapshot for K8sSyncSnapshot {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn setting_id(&self) -> &str {
        &self.setting_id
    }

    fn last_processed_timestamp(&self) -> DateTime<Utc> {
        self.last_processed_timestamp
    }

    fn active_instance_ids(&self) -> HashSet<String> {
        self.node_uids
            .iter()
            .chain(&self.pod_uids)
            .map(|uid| instance_id_from_arn(uid).to_string())
            .collect()
    }
}
