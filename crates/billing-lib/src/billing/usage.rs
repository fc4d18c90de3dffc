//! Active time of an instance within a billing interval

use crate::models::{InstanceRecord, InstanceType};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Shortest usage a stopped instance of this type is billed for
pub fn min_chargeable_duration(instance_type: InstanceType) -> Option<Duration> {
    match instance_type {
        InstanceType::Ec2Instance => Some(Duration::seconds(3600)),
        InstanceType::EcsTaskFargate => Some(Duration::seconds(60)),
        _ => None,
    }
}

/// Seconds `record` was active inside `[start, end)`.
///
/// A running instance is active up to `end`. A stopped instance shorter than
/// its minimum chargeable duration counts as running for that minimum.
pub fn instance_active_seconds(record: &InstanceRecord, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let Some(usage_start) = record.usage_start_time else {
        return 0.0;
    };

    let usage_stop = match record.usage_stop_time {
        Some(stop) => match min_chargeable_duration(record.instance_type) {
            Some(min) if stop - usage_start < min => usage_start + min,
            _ => stop,
        },
        None => end,
    };

    let from = usage_start.max(start);
    let to = usage_stop.min(end);
    if to <= from {
        return 0.0;
    }
    (to - from).num_seconds() as f64
}

/// Active seconds keyed by `"<instance_id>:<cluster_id>"`
pub fn active_seconds_by_instance(
    records: &[InstanceRecord],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> HashMap<String, f64> {
    records
        .iter()
        .map(|record| {
            (
                format!("{}:{}", record.instance_id, record.cluster_id),
                instance_active_seconds(record, start, end),
            )
        })
        .collect()
}
