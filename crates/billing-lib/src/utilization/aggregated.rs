//! Aggregated utilization reassembly
//!
//! A message carries one series per (metric, statistic). All four series
//! must be present and share one timestamp list; anything else is rejected
//! for the whole message since billing depends on complete rows.

use crate::error::UtilizationError;
use crate::models::{instance_id_from_arn, InstanceType, UsageStat, UtilizationSample};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Width of an aggregated bucket
pub const DEFAULT_COARSE_BUCKET_SECS: i64 = 3600;

const CPU_METRIC: &str = "CPUUtilization";
const MEMORY_METRIC: &str = "MemoryUtilization";
const AVERAGE: &str = "Average";
const MAXIMUM: &str = "Maximum";

/// One delivered metric series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub metric_name: String,
    pub statistic: String,
    pub timestamps: Vec<DateTime<Utc>>,
    /// Percentages, 0..100
    pub values: Vec<f64>,
}

/// Aggregated utilization message for one cluster or service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedUtilization {
    pub cluster_id: String,
    pub setting_id: String,
    /// Cluster or service identifier, ARNs are normalized
    pub instance_id: String,
    pub instance_type: InstanceType,
    pub series: Vec<MetricSeries>,
}

/// The four series a complete message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesKind {
    CpuAvg,
    CpuMax,
    MemoryAvg,
    MemoryMax,
}

impl SeriesKind {
    pub const ALL: [SeriesKind; 4] = [
        SeriesKind::CpuAvg,
        SeriesKind::CpuMax,
        SeriesKind::MemoryAvg,
        SeriesKind::MemoryMax,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SeriesKind::CpuAvg => "cpu-avg",
            SeriesKind::CpuMax => "cpu-max",
            SeriesKind::MemoryAvg => "memory-avg",
            SeriesKind::MemoryMax => "memory-max",
        }
    }

    fn index(&self) -> usize {
        match self {
            SeriesKind::CpuAvg => 0,
            SeriesKind::CpuMax => 1,
            SeriesKind::MemoryAvg => 2,
            SeriesKind::MemoryMax => 3,
        }
    }

    /// Classify a series by its wire names
    pub fn classify(metric_name: &str, statistic: &str) -> Result<Self, UtilizationError> {
        match (metric_name, statistic) {
            (CPU_METRIC, AVERAGE) => Ok(SeriesKind::CpuAvg),
            (CPU_METRIC, MAXIMUM) => Ok(SeriesKind::CpuMax),
            (MEMORY_METRIC, AVERAGE) => Ok(SeriesKind::MemoryAvg),
            (MEMORY_METRIC, MAXIMUM) => Ok(SeriesKind::MemoryMax),
            _ => Err(UtilizationError::UnknownSeries {
                metric_name: metric_name.to_string(),
                statistic: statistic.to_string(),
            }),
        }
    }
}

/// Reassemble a message into one row per timestamp.
///
/// Values are scaled from percentages to 0..1 fractions and each row covers
/// `[timestamp, timestamp + bucket)`.
pub fn aggregate_utilization(
    account_id: &str,
    message: &AggregatedUtilization,
    bucket: Duration,
) -> Result<Vec<UtilizationSample>, UtilizationError> {
    let mut slots: [Option<&MetricSeries>; 4] = [None; 4];

    for series in &message.series {
        let kind = SeriesKind::classify(&series.metric_name, &series.statistic)?;
        let slot = &mut slots[kind.index()];
        if slot.is_some() {
            return Err(UtilizationError::DuplicateSeries(kind.name()));
        }
        *slot = Some(series);
    }

    let mut complete = Vec::with_capacity(4);
    for kind in SeriesKind::ALL {
        let series = slots[kind.index()].ok_or(UtilizationError::MissingSeries(kind.name()))?;
        if series.values.len() != series.timestamps.len() {
            return Err(UtilizationError::MisalignedSeries {
                series: kind.name(),
                reason: format!(
                    "{} values for {} timestamps",
                    series.values.len(),
                    series.timestamps.len()
                ),
            });
        }
        complete.push(series);
    }

    let timestamps = &complete[0].timestamps;
    for (kind, series) in SeriesKind::ALL.iter().zip(&complete).skip(1) {
        if &series.timestamps != timestamps {
            return Err(UtilizationError::MisalignedSeries {
                series: kind.name(),
                reason: format!("timestamps differ from {}", SeriesKind::CpuAvg.name()),
            });
        }
    }

    let instance_id = instance_id_from_arn(&message.instance_id);
    let rows = timestamps
        .iter()
        .enumerate()
        .map(|(i, start)| UtilizationSample {
            account_id: account_id.to_string(),
            instance_id: instance_id.to_string(),
            instance_type: message.instance_type,
            cluster_id: message.cluster_id.clone(),
            setting_id: message.setting_id.clone(),
            start_timestamp: *start,
            end_timestamp: *start + bucket,
            cpu: UsageStat {
                avg: complete[0].values[i] / 100.0,
                max: complete[1].values[i] / 100.0,
            },
            memory: UsageStat {
                avg: complete[2].values[i] / 100.0,
                max: complete[3].values[i] / 100.0,
            },
        })
        .collect();

    Ok(rows)
}
