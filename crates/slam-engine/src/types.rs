//! ---
//! slam_section: "02-mapping-engine"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Mapping engine contract and reference implementation."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slam_common::SensorKind;

/// Engine-assigned trajectory identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrajectoryId(pub u32);

impl TrajectoryId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TrajectoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryState {
    /// Accepting sensor input.
    Active,
    /// No longer accepting input; participates in optimization.
    Finished,
    /// Restored from a blob and excluded from optimization.
    Frozen,
}

impl TrajectoryState {
    pub fn is_active(self) -> bool {
        matches!(self, TrajectoryState::Active)
    }
}

/// Payload of a sensor message, reduced to what the engine bookkeeping needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorData {
    Range { num_points: u32 },
    Imu,
    Odometry,
    FixedFramePose,
    Landmark,
}

impl SensorData {
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorData::Range { .. } => SensorKind::Range,
            SensorData::Imu => SensorKind::Imu,
            SensorData::Odometry => SensorKind::Odometry,
            SensorData::FixedFramePose => SensorKind::FixedFramePose,
            SensorData::Landmark => SensorKind::Landmark,
        }
    }
}

/// One message delivered by the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub topic: String,
    /// Acquisition time. The engine keeps the newest stamp per trajectory.
    pub stamp: DateTime<Utc>,
    pub data: SensorData,
}

impl SensorSample {
    pub fn new(topic: impl Into<String>, data: SensorData) -> Self {
        Self {
            topic: topic.into(),
            stamp: Utc::now(),
            data,
        }
    }

    pub fn range(topic: impl Into<String>, num_points: u32) -> Self {
        Self::new(topic, SensorData::Range { num_points })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmapSummary {
    pub index: u32,
    pub num_range_data: u32,
    pub finished: bool,
}

/// Result of the final global optimization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizationSummary {
    pub trajectories_optimized: usize,
    pub trajectories_frozen: usize,
    pub submaps: usize,
    pub trajectory_nodes: u64,
}
