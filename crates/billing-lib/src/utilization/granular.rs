//! Granular node and pod utilization

use crate::models::{GranularUtilization, InstanceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const CPU_UNITS_PER_CORE: f64 = 1024.0;
const NANO_CORES_PER_CORE: f64 = 1_000_000_000.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Node usage sample for one collector window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUtilizationMetric {
    pub cluster_id: String,
    pub setting_id: String,
    pub node_uid: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub cpu_nano_cores: f64,
    pub memory_bytes: f64,
}

/// Usage of one container inside a pod sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub name: String,
    pub cpu_nano_cores: f64,
    pub memory_bytes: f64,
}

/// Pod usage sample for one collector window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodUtilizationMetric {
    pub cluster_id: String,
    pub setting_id: String,
    pub pod_uid: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub containers: Vec<ContainerUsage>,
}

fn cpu_units(nano_cores: f64) -> f64 {
    nano_cores / NANO_CORES_PER_CORE * CPU_UNITS_PER_CORE
}

fn memory_mb(bytes: f64) -> f64 {
    bytes / BYTES_PER_MB
}

pub fn node_utilization(account_id: &str, metric: &NodeUtilizationMetric) -> GranularUtilization {
    GranularUtilization {
        account_id: account_id.to_string(),
        instance_id: metric.node_uid.clone(),
        instance_type: InstanceType::K8sNode,
        cluster_id: metric.cluster_id.clone(),
        setting_id: metric.setting_id.clone(),
        start_timestamp: metric.start_timestamp,
        end_timestamp: metric.end_timestamp,
        cpu_units: cpu_units(metric.cpu_nano_cores),
        memory_mb: memory_mb(metric.memory_bytes),
    }
}

/// Sum container usage into a single pod row
pub fn pod_utilization(account_id: &str, metric: &PodUtilizationMetric) -> GranularUtilization {
    let (cpu, memory) = metric
        .containers
        .iter()
        .fold((0.0, 0.0), |(cpu, memory), c| {
            (cpu + c.cpu_nano_cores, memory + c.memory_bytes)
        });

    GranularUtilization {
        account_id: account_id.to_string(),
        instance_id: metric.pod_uid.clone(),
        instance_type: InstanceType::K8sPod,
        cluster_id: metric.cluster_id.clone(),
        setting_id: metric.setting_id.clone(),
        start_timestamp: metric.start_timestamp,
        end_timestamp: metric.end_timestamp,
        cpu_units: cpu_units(cpu),
        memory_mb: memory_mb(memory),
    }
}
