//! Event envelope decoding
//!
//! Input arrives as JSON lines, one envelope per line:
//!
//! ```json
//! {"account_id": "acct-1", "type": "lifecycle", "payload": {...}}
//! ```

use crate::models::{instance_id_from_arn, BillingRecord, LifecycleEvent, LifecycleEventType};
use crate::sync::{EcsSyncSnapshot, K8sSyncSnapshot};
use crate::utilization::{AggregatedUtilization, NodeUtilizationMetric, PodUtilizationMetric};
use crate::writers::{ContainerInstanceInfo, NodeInfo, PodInfo, TaskInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use tracing::warn;

/// START/STOP payload; the account comes from the envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecyclePayload {
    pub instance_id: String,
    pub cluster_id: String,
    pub event_type: LifecycleEventType,
    pub timestamp: DateTime<Utc>,
}

impl LifecyclePayload {
    pub fn to_event(&self, account_id: &str) -> LifecycleEvent {
        LifecycleEvent {
            account_id: account_id.to_string(),
            instance_id: self.instance_id.clone(),
            cluster_id: self.cluster_id.clone(),
            event_type: self.event_type,
            timestamp: self.timestamp,
        }
    }
}

/// Per-instance cost rows for one or more buckets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingBatch {
    pub records: Vec<BillingRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    NodeInfo(NodeInfo),
    ContainerInstanceInfo(ContainerInstanceInfo),
    TaskInfo(TaskInfo),
    PodInfo(PodInfo),
    Lifecycle(LifecyclePayload),
    EcsSync(EcsSyncSnapshot),
    K8sSync(K8sSyncSnapshot),
    AggregatedUtilization(AggregatedUtilization),
    NodeUtilization(NodeUtilizationMetric),
    PodUtilization(PodUtilizationMetric),
    BillingBatch(BillingBatch),
}

impl Event {
    /// Label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Event::NodeInfo(_) => "node_info",
            Event::ContainerInstanceInfo(_) => "container_instance_info",
            Event::TaskInfo(_) => "task_info",
            Event::PodInfo(_) => "pod_info",
            Event::Lifecycle(_) => "lifecycle",
            Event::EcsSync(_) => "ecs_sync",
            Event::K8sSync(_) => "k8s_sync",
            Event::AggregatedUtilization(_) => "aggregated_utilization",
            Event::NodeUtilization(_) => "node_utilization",
            Event::PodUtilization(_) => "pod_utilization",
            Event::BillingBatch(_) => "billing_batch",
        }
    }

    /// Bare instance id for events that touch a single instance record
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Event::NodeInfo(info) => Some(info.instance_id()),
            Event::ContainerInstanceInfo(info) => {
                Some(instance_id_from_arn(&info.container_instance_arn))
            }
            Event::TaskInfo(info) => Some(instance_id_from_arn(&info.task_arn)),
            Event::PodInfo(info) => Some(info.pod_uid.as_str()),
            Event::Lifecycle(payload) => Some(instance_id_from_arn(&payload.instance_id)),
            _ => None,
        }
    }
}

/// One decoded input line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub account_id: String,
    #[serde(flatten)]
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(account_id: impl Into<String>, event: Event) -> Self {
        Self {
            account_id: account_id.into(),
            event,
        }
    }

    /// Lifecycle event for this envelope, if it carries one
    pub fn lifecycle_event(&self) -> Option<LifecycleEvent> {
        match &self.event {
            Event::Lifecycle(payload) => Some(payload.to_event(&self.account_id)),
            _ => None,
        }
    }
}

pub fn decode_line(line: &str) -> Result<EventEnvelope, serde_json::Error> {
    serde_json::from_str(line)
}

/// Decode every line of `reader`.
///
/// Blank lines are ignored; undecodable lines are logged with their line
/// number and skipped.
pub fn decode_lines<R: BufRead>(reader: R) -> std::io::Result<Vec<EventEnvelope>> {
    let mut envelopes = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match decode_line(trimmed) {
            Ok(envelope) => envelopes.push(envelope),
            Err(e) => {
                warn!(
                    line = idx + 1,
                    error = %e,
                    "Skipping undecodable event line"
                );
            }
        }
    }

    Ok(envelopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceType;

    #[test]
    fn test_decode_lifecycle_envelope() {
        let line = r#"{"account_id":"acct-1","type":"lifecycle","payload":{"instance_id":"arn:aws:ecs:us-east-1:1:task/c/abc","cluster_id":"cluster-1","event_type":"STOP","timestamp":"2024-03-01T10:00:00Z"}}"#;

        let envelope = decode_line(line).unwrap();

        assert_eq!(envelope.account_id, "acct-1");
        assert_eq!(envelope.event.kind(), "lifecycle");
        assert_eq!(envelope.event.instance_id(), Some("abc"));

        let event = envelope.lifecycle_event().unwrap();
        assert_eq!(event.event_type, LifecycleEventType::Stop);
        assert_eq!(event.account_id, "acct-1");
    }

    #[test]
    fn test_decode_node_info_with_defaults() {
        let line = r#"{"account_id":"acct-1","type":"node_info","payload":{
            "cluster_id":"cluster-1","cluster_name":"prod","setting_id":"s-1",
            "node_uid":"uid-1","node_name":"ip-10-0-0-1","cluster_type":"K8S",
            "allocatable":{"cpu_units":4096.0,"memory_mb":16384.0},
            "creation_time":"2024-03-01T00:00:00Z"}}"#;

        let envelope = decode_line(line).unwrap();

        match envelope.event {
            Event::NodeInfo(info) => {
                assert_eq!(info.node_uid, "uid-1");
                assert!(info.labels.is_empty());
                assert_eq!(info.provider_id, None);
            }
            other => panic!("unexpected event {:?}", other.kind()),
        }
    }

    #[test]
    fn test_decode_billing_batch() {
        let line = r#"{"account_id":"acct-1","type":"billing_batch","payload":{"records":[
            {"account_id":"acct-1","instance_id":"node-a","cluster_id":"cluster-1",
             "instance_type":"K8S_NODE","start_timestamp":"2024-03-01T00:00:00Z",
             "end_timestamp":"2024-03-01T01:00:00Z","billing_amount":100.0}]}}"#;

        let envelope = decode_line(line).unwrap();

        match envelope.event {
            Event::BillingBatch(batch) => {
                assert_eq!(batch.records.len(), 1);
                assert_eq!(batch.records[0].instance_type, InstanceType::K8sNode);
                assert_eq!(batch.records[0].system_cost, 0.0);
            }
            other => panic!("unexpected event {:?}", other.kind()),
        }
        assert_eq!(decode_line(line).unwrap().event.instance_id(), None);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let line = r#"{"account_id":"acct-1","type":"volume_info","payload":{}}"#;
        assert!(decode_line(line).is_err());
    }

    #[test]
    fn test_decode_lines_skips_bad_lines() {
        let input = concat!(
            r#"{"account_id":"acct-1","type":"lifecycle","payload":{"instance_id":"i-1","cluster_id":"c","event_type":"START","timestamp":"2024-03-01T10:00:00Z"}}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"account_id":"acct-1","type":"k8s_sync","payload":{"cluster_id":"c","setting_id":"s","last_processed_timestamp":"2024-03-01T10:00:00Z","node_uids":["n-1"]}}"#,
            "\n",
        );

        let envelopes = decode_lines(input.as_bytes()).unwrap();

        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].event.kind(), "lifecycle");
        assert_eq!(envelopes[1].event.kind(), "k8s_sync");
    }

    #[test]
    fn test_envelope_serializes_flat() {
        let envelope = EventEnvelope::new(
            "acct-1",
            Event::BillingBatch(BillingBatch { records: Vec::new() }),
        );

        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["account_id"], "acct-1");
        assert_eq!(value["type"], "billing_batch");
        assert!(value["payload"]["records"].as_array().unwrap().is_empty());
    }
}
