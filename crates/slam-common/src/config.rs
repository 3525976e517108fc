//! ---
//! slam_section: "01-core-functionality"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Shared primitives and utilities for the node runtime."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};

use crate::error::ConfigurationError;

/// Upper bound on laser scans, multi-echo scans and point clouds, each.
pub const MAX_RANGE_SENSORS_PER_KIND: u32 = 64;

fn default_tf_buffer_cache() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_sampling_ratio() -> f64 {
    1.0
}

fn default_background_threads() -> u32 {
    4
}

fn default_submap_num_range_data() -> u32 {
    90
}

/// Node-wide configuration. Immutable once loaded.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOptions {
    pub map_frame: String,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(rename = "lookup_transform_timeout_sec")]
    pub lookup_transform_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(rename = "submap_publish_period_sec")]
    pub submap_publish_period: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(rename = "pose_publish_period_sec")]
    pub pose_publish_period: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(rename = "trajectory_publish_period_sec")]
    pub trajectory_publish_period: Duration,
    /// How long incoming coordinate-frame transforms are retained.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(rename = "tf_buffer_cache_sec", default = "default_tf_buffer_cache")]
    pub tf_buffer_cache: Duration,
    #[serde(default = "default_true")]
    pub publish_to_tf: bool,
    #[serde(default)]
    pub publish_tracked_pose: bool,
    #[serde(default = "default_true")]
    pub use_pose_extrapolator: bool,
    #[serde(default)]
    pub map_builder: MapBuilderOptions,
}

impl NodeOptions {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.map_frame.trim().is_empty() {
            return Err(ConfigurationError::invalid(
                "node.map_frame",
                "frame id must not be empty",
            ));
        }
        let periods = [
            ("node.lookup_transform_timeout_sec", self.lookup_transform_timeout),
            ("node.submap_publish_period_sec", self.submap_publish_period),
            ("node.pose_publish_period_sec", self.pose_publish_period),
            ("node.trajectory_publish_period_sec", self.trajectory_publish_period),
            ("node.tf_buffer_cache_sec", self.tf_buffer_cache),
        ];
        for (field, value) in periods {
            if value.is_zero() {
                return Err(ConfigurationError::invalid(field, "must be positive"));
            }
        }
        self.map_builder.validate()
    }
}

/// Tuning handed to the mapping engine at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapBuilderOptions {
    #[serde(default = "default_background_threads")]
    pub num_background_threads: u32,
    /// Range insertions after which a submap is considered complete.
    #[serde(default = "default_submap_num_range_data")]
    pub submap_num_range_data: u32,
    #[serde(default)]
    pub collate_by_trajectory: bool,
}

impl Default for MapBuilderOptions {
    fn default() -> Self {
        Self {
            num_background_threads: default_background_threads(),
            submap_num_range_data: default_submap_num_range_data(),
            collate_by_trajectory: false,
        }
    }
}

impl MapBuilderOptions {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.num_background_threads == 0 {
            return Err(ConfigurationError::invalid(
                "node.map_builder.num_background_threads",
                "at least one background thread is required",
            ));
        }
        if self.submap_num_range_data == 0 {
            return Err(ConfigurationError::invalid(
                "node.map_builder.submap_num_range_data",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Per-trajectory configuration: frames, sensor layout and topic bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryOptions {
    pub tracking_frame: String,
    pub published_frame: String,
    pub odom_frame: String,
    pub provide_odom_frame: bool,
    #[serde(default)]
    pub publish_frame_projected_to_2d: bool,
    pub use_odometry: bool,
    pub use_nav_sat: bool,
    pub use_landmarks: bool,
    #[serde(default)]
    pub use_imu_data: bool,
    pub num_laser_scans: u32,
    pub num_multi_echo_laser_scans: u32,
    pub num_subdivisions_per_laser_scan: u32,
    pub num_point_clouds: u32,
    #[serde(default = "default_sampling_ratio")]
    pub rangefinder_sampling_ratio: f64,
    #[serde(default = "default_sampling_ratio")]
    pub odometry_sampling_ratio: f64,
    #[serde(default = "default_sampling_ratio")]
    pub fixed_frame_pose_sampling_ratio: f64,
    #[serde(default = "default_sampling_ratio")]
    pub imu_sampling_ratio: f64,
    #[serde(default = "default_sampling_ratio")]
    pub landmarks_sampling_ratio: f64,
    #[serde(default)]
    pub topics: SensorTopics,
}

impl TrajectoryOptions {
    /// Structural checks shared by the loader and trajectory start.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let frames = [
            ("trajectory.tracking_frame", &self.tracking_frame),
            ("trajectory.published_frame", &self.published_frame),
            ("trajectory.odom_frame", &self.odom_frame),
        ];
        for (field, frame) in frames {
            if frame.trim().is_empty() {
                return Err(ConfigurationError::invalid(
                    field,
                    "frame id must not be empty",
                ));
            }
        }
        let range_sensors = [
            ("trajectory.num_laser_scans", self.num_laser_scans),
            (
                "trajectory.num_multi_echo_laser_scans",
                self.num_multi_echo_laser_scans,
            ),
            ("trajectory.num_point_clouds", self.num_point_clouds),
        ];
        for (field, count) in range_sensors {
            if count > MAX_RANGE_SENSORS_PER_KIND {
                return Err(ConfigurationError::invalid(
                    field,
                    format!("{count} exceeds the limit of {MAX_RANGE_SENSORS_PER_KIND}"),
                ));
            }
        }
        if range_sensors.iter().all(|(_, count)| *count == 0) {
            return Err(ConfigurationError::invalid(
                "trajectory.num_laser_scans",
                "at least one laser scan, multi-echo scan or point cloud is required",
            ));
        }
        if self.num_subdivisions_per_laser_scan == 0 {
            return Err(ConfigurationError::invalid(
                "trajectory.num_subdivisions_per_laser_scan",
                "must be at least 1",
            ));
        }
        let ratios = [
            ("trajectory.rangefinder_sampling_ratio", self.rangefinder_sampling_ratio),
            ("trajectory.odometry_sampling_ratio", self.odometry_sampling_ratio),
            (
                "trajectory.fixed_frame_pose_sampling_ratio",
                self.fixed_frame_pose_sampling_ratio,
            ),
            ("trajectory.imu_sampling_ratio", self.imu_sampling_ratio),
            ("trajectory.landmarks_sampling_ratio", self.landmarks_sampling_ratio),
        ];
        for (field, ratio) in ratios {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigurationError::invalid(
                    field,
                    format!("sampling ratio {ratio} outside (0, 1]"),
                ));
            }
        }
        self.topics.validate()
    }

    /// Return a copy whose topics live under `namespace`, e.g. for a second robot.
    pub fn with_topic_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.topics.namespace = Some(namespace.into());
        self
    }

    /// Sensor inputs this trajectory subscribes to, in a stable order.
    pub fn expected_sensor_ids(&self) -> Vec<SensorId> {
        let topics = &self.topics;
        let mut ids = Vec::new();
        let mut push_range = |base: &str, count: u32| {
            for topic in numbered_topics(base, count) {
                ids.push(SensorId::new(SensorKind::Range, topics.qualify(&topic)));
            }
        };
        push_range(&topics.laser_scan, self.num_laser_scans);
        push_range(&topics.multi_echo_laser_scan, self.num_multi_echo_laser_scans);
        push_range(&topics.point_cloud2, self.num_point_clouds);
        if self.use_imu_data {
            ids.push(SensorId::new(SensorKind::Imu, topics.qualify(&topics.imu)));
        }
        if self.use_odometry {
            ids.push(SensorId::new(
                SensorKind::Odometry,
                topics.qualify(&topics.odometry),
            ));
        }
        if self.use_nav_sat {
            ids.push(SensorId::new(
                SensorKind::FixedFramePose,
                topics.qualify(&topics.nav_sat_fix),
            ));
        }
        if self.use_landmarks {
            ids.push(SensorId::new(
                SensorKind::Landmark,
                topics.qualify(&topics.landmark),
            ));
        }
        ids
    }

    /// Fraction of messages of `kind` that should reach the engine.
    pub fn sampling_ratio(&self, kind: SensorKind) -> f64 {
        match kind {
            SensorKind::Range => self.rangefinder_sampling_ratio,
            SensorKind::Imu => self.imu_sampling_ratio,
            SensorKind::Odometry => self.odometry_sampling_ratio,
            SensorKind::FixedFramePose => self.fixed_frame_pose_sampling_ratio,
            SensorKind::Landmark => self.landmarks_sampling_ratio,
        }
    }
}

fn numbered_topics(base: &str, count: u32) -> Vec<String> {
    match count {
        0 => Vec::new(),
        1 => vec![base.to_owned()],
        n => (1..=n).map(|i| format!("{base}_{i}")).collect(),
    }
}

/// Topic names a trajectory binds its sensors to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorTopics {
    pub namespace: Option<String>,
    pub laser_scan: String,
    pub multi_echo_laser_scan: String,
    pub point_cloud2: String,
    pub imu: String,
    pub odometry: String,
    pub nav_sat_fix: String,
    pub landmark: String,
}

impl Default for SensorTopics {
    fn default() -> Self {
        Self {
            namespace: None,
            laser_scan: "scan".to_owned(),
            multi_echo_laser_scan: "echoes".to_owned(),
            point_cloud2: "points2".to_owned(),
            imu: "imu".to_owned(),
            odometry: "odom".to_owned(),
            nav_sat_fix: "fix".to_owned(),
            landmark: "landmark".to_owned(),
        }
    }
}

impl SensorTopics {
    fn qualify(&self, topic: &str) -> String {
        match self.namespace.as_deref().map(|ns| ns.trim_matches('/')) {
            Some(ns) if !ns.is_empty() => format!("{ns}/{topic}"),
            _ => topic.to_owned(),
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let names = [
            ("trajectory.topics.laser_scan", &self.laser_scan),
            ("trajectory.topics.multi_echo_laser_scan", &self.multi_echo_laser_scan),
            ("trajectory.topics.point_cloud2", &self.point_cloud2),
            ("trajectory.topics.imu", &self.imu),
            ("trajectory.topics.odometry", &self.odometry),
            ("trajectory.topics.nav_sat_fix", &self.nav_sat_fix),
            ("trajectory.topics.landmark", &self.landmark),
        ];
        for (field, name) in names {
            if name.trim().is_empty() {
                return Err(ConfigurationError::invalid(field, "topic must not be empty"));
            }
        }
        Ok(())
    }
}

/// Category of sensor data flowing into a trajectory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Range,
    Imu,
    Odometry,
    FixedFramePose,
    Landmark,
}

/// A sensor input as seen by the engine: its kind and the topic it arrives on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SensorId {
    pub kind: SensorKind,
    pub topic: String,
}

impl SensorId {
    pub fn new(kind: SensorKind, topic: impl Into<String>) -> Self {
        Self {
            kind,
            topic: topic.into(),
        }
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic)
    }
}
