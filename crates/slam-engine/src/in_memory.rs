//! ---
//! slam_section: "02-mapping-engine"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Mapping engine contract and reference implementation."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
//! Bookkeeping engine used by the daemon and the test suites.
//!
//! Every range measurement becomes a trajectory node and is inserted into the
//! trajectory's open submap. A submap finishes once it holds
//! `submap_num_range_data` insertions and the next insertion opens a new one.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slam_common::{MapBuilderOptions, SensorId, SensorKind, TrajectoryOptions};
use slam_metrics::prometheus::Registry;
use slam_metrics::MapBuilderMetrics;
use slam_persistence::{read_blob, write_blob};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::map_builder::MapBuilder;
use crate::types::{
    OptimizationSummary, SensorData, SensorSample, SubmapSummary, TrajectoryId, TrajectoryState,
};

#[derive(Debug, Clone)]
struct Submap {
    num_range_data: u32,
    finished: bool,
}

#[derive(Debug, Clone)]
struct TrajectoryRecord {
    state: TrajectoryState,
    expected_sensors: BTreeSet<SensorId>,
    submaps: Vec<Submap>,
    node_count: u64,
    sensor_counts: BTreeMap<SensorKind, u64>,
    latest_stamp: Option<DateTime<Utc>>,
}

impl TrajectoryRecord {
    fn open_submap(&mut self) -> &mut Submap {
        let needs_new = self.submaps.last().map_or(true, |submap| submap.finished);
        if needs_new {
            self.submaps.push(Submap {
                num_range_data: 0,
                finished: false,
            });
        }
        let last = self.submaps.len() - 1;
        &mut self.submaps[last]
    }
}

#[derive(Debug, Default)]
struct BuilderState {
    trajectories: BTreeMap<TrajectoryId, TrajectoryRecord>,
    next_id: u32,
    optimizations: u32,
}

impl BuilderState {
    fn allocate_id(&mut self) -> TrajectoryId {
        let id = TrajectoryId(self.next_id);
        self.next_id += 1;
        id
    }

    fn total_nodes(&self) -> u64 {
        self.trajectories.values().map(|t| t.node_count).sum()
    }
}

/// Serialized form of the engine state carried inside a state blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedMapState {
    pub trajectories: Vec<SerializedTrajectory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedTrajectory {
    pub id: TrajectoryId,
    pub state: TrajectoryState,
    pub frozen: bool,
    pub node_count: u64,
    pub expected_sensors: Vec<SensorId>,
    pub submaps: Vec<SubmapSummary>,
    #[serde(default)]
    pub sensor_counts: BTreeMap<SensorKind, u64>,
    /// Newest sensor stamp seen by the trajectory.
    #[serde(default)]
    pub latest_stamp: Option<DateTime<Utc>>,
}

impl SerializedMapState {
    fn validate(&self) -> Result<(), EngineError> {
        let mut seen = BTreeSet::new();
        for trajectory in &self.trajectories {
            if !seen.insert(trajectory.id) {
                return Err(EngineError::InvalidState(format!(
                    "trajectory {} appears more than once",
                    trajectory.id
                )));
            }
            let mut previous: Option<u32> = None;
            for submap in &trajectory.submaps {
                if previous.is_some_and(|index| submap.index <= index) {
                    return Err(EngineError::InvalidState(format!(
                        "submap indices of trajectory {} are not increasing",
                        trajectory.id
                    )));
                }
                previous = Some(submap.index);
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct InMemoryMapBuilder {
    options: MapBuilderOptions,
    state: Mutex<BuilderState>,
    metrics: Option<MapBuilderMetrics>,
}

impl InMemoryMapBuilder {
    pub fn new(options: MapBuilderOptions) -> Self {
        Self {
            options,
            state: Mutex::new(BuilderState::default()),
            metrics: None,
        }
    }

    /// Number of final optimization passes run so far.
    pub fn optimizations_run(&self) -> u32 {
        self.state.lock().optimizations
    }

    pub fn node_count(&self, trajectory_id: TrajectoryId) -> Option<u64> {
        self.state
            .lock()
            .trajectories
            .get(&trajectory_id)
            .map(|t| t.node_count)
    }

    fn insert_range_data(&self, record: &mut TrajectoryRecord) {
        let quota = self.options.submap_num_range_data;
        record.node_count += 1;
        let submap = record.open_submap();
        submap.num_range_data += 1;
        let finished_now = submap.num_range_data >= quota;
        if finished_now {
            submap.finished = true;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_range_data();
            if finished_now {
                metrics.record_submap_finished();
            }
        }
    }
}

impl MapBuilder for InMemoryMapBuilder {
    fn add_trajectory_builder(
        &mut self,
        expected_sensor_ids: &[SensorId],
        options: &TrajectoryOptions,
    ) -> TrajectoryId {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        state.trajectories.insert(
            id,
            TrajectoryRecord {
                state: TrajectoryState::Active,
                expected_sensors: expected_sensor_ids.iter().cloned().collect(),
                submaps: Vec::new(),
                node_count: 0,
                sensor_counts: BTreeMap::new(),
                latest_stamp: None,
            },
        );
        info!(
            trajectory_id = %id,
            tracking_frame = %options.tracking_frame,
            sensors = expected_sensor_ids.len(),
            "trajectory builder added"
        );
        id
    }

    fn add_sensor_data(
        &self,
        trajectory_id: TrajectoryId,
        sample: SensorSample,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let record = state
            .trajectories
            .get_mut(&trajectory_id)
            .ok_or(EngineError::UnknownTrajectory(trajectory_id))?;
        if !record.state.is_active() {
            return Err(EngineError::TrajectoryNotActive(trajectory_id));
        }
        let kind = sample.data.kind();
        let sensor_id = SensorId::new(kind, sample.topic.clone());
        if !record.expected_sensors.contains(&sensor_id) {
            return Err(EngineError::UnexpectedSensor {
                trajectory_id,
                topic: sample.topic,
                kind: format!("{kind:?}"),
            });
        }
        if let SensorData::Range { num_points: 0 } = sample.data {
            return Err(EngineError::EmptyRangeData(sample.topic));
        }

        *record.sensor_counts.entry(kind).or_default() += 1;
        if record.latest_stamp.map_or(true, |latest| sample.stamp > latest) {
            record.latest_stamp = Some(sample.stamp);
        }
        if kind == SensorKind::Range {
            self.insert_range_data(record);
            let nodes = state.total_nodes();
            if let Some(metrics) = &self.metrics {
                metrics.set_trajectory_nodes(nodes as usize);
            }
        }
        Ok(())
    }

    fn finish_trajectory(&mut self, trajectory_id: TrajectoryId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let record = state
            .trajectories
            .get_mut(&trajectory_id)
            .ok_or(EngineError::UnknownTrajectory(trajectory_id))?;
        if !record.state.is_active() {
            return Err(EngineError::TrajectoryNotActive(trajectory_id));
        }
        record.state = TrajectoryState::Finished;
        let mut closed = false;
        if let Some(submap) = record.submaps.last_mut() {
            if !submap.finished {
                submap.finished = true;
                closed = true;
            }
        }
        if closed {
            if let Some(metrics) = &self.metrics {
                metrics.record_submap_finished();
            }
        }
        debug!(trajectory_id = %trajectory_id, submaps = record.submaps.len(), "trajectory finished");
        Ok(())
    }

    fn run_final_optimization(&mut self) -> OptimizationSummary {
        let mut state = self.state.lock();
        state.optimizations += 1;
        let mut summary = OptimizationSummary::default();
        for record in state.trajectories.values() {
            summary.submaps += record.submaps.len();
            summary.trajectory_nodes += record.node_count;
            match record.state {
                TrajectoryState::Frozen => summary.trajectories_frozen += 1,
                _ => summary.trajectories_optimized += 1,
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_optimization();
        }
        info!(
            optimized = summary.trajectories_optimized,
            frozen = summary.trajectories_frozen,
            submaps = summary.submaps,
            nodes = summary.trajectory_nodes,
            "final optimization complete"
        );
        summary
    }

    fn serialize_state(
        &self,
        include_unfinished_submaps: bool,
        writer: &mut dyn Write,
    ) -> Result<(), EngineError> {
        let snapshot = {
            let state = self.state.lock();
            let trajectories = state
                .trajectories
                .iter()
                .map(|(id, record)| SerializedTrajectory {
                    id: *id,
                    state: record.state,
                    frozen: record.state == TrajectoryState::Frozen,
                    node_count: record.node_count,
                    expected_sensors: record.expected_sensors.iter().cloned().collect(),
                    submaps: record
                        .submaps
                        .iter()
                        .enumerate()
                        .filter(|(_, submap)| include_unfinished_submaps || submap.finished)
                        .map(|(index, submap)| SubmapSummary {
                            index: index as u32,
                            num_range_data: submap.num_range_data,
                            finished: submap.finished,
                        })
                        .collect(),
                    sensor_counts: record.sensor_counts.clone(),
                    latest_stamp: record.latest_stamp,
                })
                .collect();
            SerializedMapState { trajectories }
        };
        let info = write_blob(writer, &snapshot)?;
        debug!(
            trajectories = snapshot.trajectories.len(),
            bytes = info.bytes,
            include_unfinished_submaps,
            "engine state serialized"
        );
        Ok(())
    }

    fn load_state(
        &mut self,
        reader: &mut dyn Read,
        load_frozen_state: bool,
    ) -> Result<BTreeMap<TrajectoryId, TrajectoryId>, EngineError> {
        let snapshot: SerializedMapState = read_blob(reader)?;
        snapshot.validate()?;

        let mut state = self.state.lock();
        let mut remapped = BTreeMap::new();
        for trajectory in snapshot.trajectories {
            let id = state.allocate_id();
            let frozen = trajectory.frozen || load_frozen_state;
            let record = TrajectoryRecord {
                state: if frozen {
                    TrajectoryState::Frozen
                } else {
                    TrajectoryState::Finished
                },
                expected_sensors: trajectory.expected_sensors.into_iter().collect(),
                submaps: trajectory
                    .submaps
                    .into_iter()
                    .map(|submap| Submap {
                        num_range_data: submap.num_range_data,
                        finished: true,
                    })
                    .collect(),
                node_count: trajectory.node_count,
                sensor_counts: trajectory.sensor_counts,
                latest_stamp: trajectory.latest_stamp,
            };
            state.trajectories.insert(id, record);
            remapped.insert(trajectory.id, id);
        }
        let nodes = state.total_nodes();
        if let Some(metrics) = &self.metrics {
            metrics.set_trajectory_nodes(nodes as usize);
        }
        info!(trajectories = remapped.len(), load_frozen_state, "engine state restored");
        Ok(remapped)
    }

    fn register_metrics(&mut self, registry: &Registry) -> Result<(), EngineError> {
        if self.metrics.is_some() {
            return Err(EngineError::MetricsAlreadyRegistered);
        }
        self.metrics = Some(MapBuilderMetrics::new(registry)?);
        Ok(())
    }

    fn trajectory_states(&self) -> BTreeMap<TrajectoryId, TrajectoryState> {
        self.state
            .lock()
            .trajectories
            .iter()
            .map(|(id, record)| (*id, record.state))
            .collect()
    }

    fn submaps(&self, trajectory_id: TrajectoryId) -> Result<Vec<SubmapSummary>, EngineError> {
        let state = self.state.lock();
        let record = state
            .trajectories
            .get(&trajectory_id)
            .ok_or(EngineError::UnknownTrajectory(trajectory_id))?;
        Ok(record
            .submaps
            .iter()
            .enumerate()
            .map(|(index, submap)| SubmapSummary {
                index: index as u32,
                num_range_data: submap.num_range_data,
                finished: submap.finished,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slam_persistence::PersistenceError;

    fn options(quota: u32) -> MapBuilderOptions {
        MapBuilderOptions {
            submap_num_range_data: quota,
            ..MapBuilderOptions::default()
        }
    }

    fn trajectory_options() -> TrajectoryOptions {
        TrajectoryOptions {
            tracking_frame: "base_link".into(),
            published_frame: "base_link".into(),
            odom_frame: "odom".into(),
            provide_odom_frame: true,
            publish_frame_projected_to_2d: false,
            use_odometry: true,
            use_nav_sat: false,
            use_landmarks: false,
            use_imu_data: false,
            num_laser_scans: 1,
            num_multi_echo_laser_scans: 0,
            num_subdivisions_per_laser_scan: 1,
            num_point_clouds: 0,
            rangefinder_sampling_ratio: 1.0,
            odometry_sampling_ratio: 1.0,
            fixed_frame_pose_sampling_ratio: 1.0,
            imu_sampling_ratio: 1.0,
            landmarks_sampling_ratio: 1.0,
            topics: Default::default(),
        }
    }

    fn start(builder: &mut InMemoryMapBuilder) -> TrajectoryId {
        let options = trajectory_options();
        let sensors = options.expected_sensor_ids();
        builder.add_trajectory_builder(&sensors, &options)
    }

    #[test]
    fn range_data_rolls_submaps_over_at_quota() {
        let mut builder = InMemoryMapBuilder::new(options(2));
        let id = start(&mut builder);
        for _ in 0..5 {
            builder
                .add_sensor_data(id, SensorSample::range("scan", 360))
                .unwrap();
        }
        let submaps = builder.submaps(id).unwrap();
        assert_eq!(submaps.len(), 3);
        assert!(submaps[0].finished && submaps[1].finished);
        assert!(!submaps[2].finished);
        assert_eq!(submaps[2].num_range_data, 1);
        assert_eq!(builder.node_count(id), Some(5));
    }

    #[test]
    fn unexpected_topic_and_kind_are_rejected() {
        let mut builder = InMemoryMapBuilder::new(options(10));
        let id = start(&mut builder);
        let err = builder
            .add_sensor_data(id, SensorSample::range("points2", 10))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnexpectedSensor { .. }));
        let err = builder
            .add_sensor_data(id, SensorSample::new("odom", SensorData::Imu))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnexpectedSensor { .. }));
        builder
            .add_sensor_data(id, SensorSample::new("odom", SensorData::Odometry))
            .unwrap();
    }

    #[test]
    fn finishing_closes_the_open_submap_and_stops_input() {
        let mut builder = InMemoryMapBuilder::new(options(10));
        let id = start(&mut builder);
        builder
            .add_sensor_data(id, SensorSample::range("scan", 10))
            .unwrap();
        builder.finish_trajectory(id).unwrap();

        assert!(builder.submaps(id).unwrap().iter().all(|s| s.finished));
        assert_eq!(builder.trajectory_states()[&id], TrajectoryState::Finished);
        assert!(matches!(
            builder.add_sensor_data(id, SensorSample::range("scan", 10)),
            Err(EngineError::TrajectoryNotActive(_))
        ));
        assert!(matches!(
            builder.finish_trajectory(id),
            Err(EngineError::TrajectoryNotActive(_))
        ));
    }

    #[test]
    fn unfinished_submaps_are_only_serialized_on_request() {
        let mut builder = InMemoryMapBuilder::new(options(3));
        let id = start(&mut builder);
        for _ in 0..4 {
            builder
                .add_sensor_data(id, SensorSample::range("scan", 10))
                .unwrap();
        }

        let mut partial = Vec::new();
        builder.serialize_state(true, &mut partial).unwrap();
        let mut clean = Vec::new();
        builder.serialize_state(false, &mut clean).unwrap();

        let partial: SerializedMapState = read_blob(partial.as_slice()).unwrap();
        let clean: SerializedMapState = read_blob(clean.as_slice()).unwrap();
        assert_eq!(partial.trajectories[0].submaps.len(), 2);
        assert!(!partial.trajectories[0].submaps[1].finished);
        assert_eq!(clean.trajectories[0].submaps.len(), 1);
        assert_eq!(partial.trajectories[0].state, TrajectoryState::Active);
    }

    #[test]
    fn newest_sample_stamp_survives_reload() {
        let mut source = InMemoryMapBuilder::new(options(4));
        let id = start(&mut source);
        let newest = Utc::now();
        let older = newest - chrono::Duration::seconds(2);
        for stamp in [older, newest, older] {
            let sample = SensorSample {
                stamp,
                ..SensorSample::range("scan", 10)
            };
            source.add_sensor_data(id, sample).unwrap();
        }
        source.finish_trajectory(id).unwrap();

        let mut blob = Vec::new();
        source.serialize_state(false, &mut blob).unwrap();
        let stored: SerializedMapState = read_blob(blob.as_slice()).unwrap();
        assert_eq!(stored.trajectories[0].latest_stamp, Some(newest));

        let mut restored = InMemoryMapBuilder::new(options(4));
        let mapping = restored.load_state(&mut blob.as_slice(), false).unwrap();
        let mut again = Vec::new();
        restored.serialize_state(false, &mut again).unwrap();
        let again: SerializedMapState = read_blob(again.as_slice()).unwrap();
        assert_eq!(again.trajectories[0].id, mapping[&id]);
        assert_eq!(again.trajectories[0].latest_stamp, Some(newest));
    }

    #[test]
    fn load_assigns_fresh_ids_and_applies_frozen_flag() {
        let mut source = InMemoryMapBuilder::new(options(2));
        let first = start(&mut source);
        let second = start(&mut source);
        source
            .add_sensor_data(first, SensorSample::range("scan", 5))
            .unwrap();
        source.finish_trajectory(first).unwrap();
        source.finish_trajectory(second).unwrap();
        let mut blob = Vec::new();
        source.serialize_state(false, &mut blob).unwrap();

        let mut target = InMemoryMapBuilder::new(options(2));
        let existing = start(&mut target);
        let mapping = target.load_state(&mut blob.as_slice(), true).unwrap();
        assert_eq!(mapping.len(), 2);
        assert!(mapping.values().all(|id| *id != existing));

        let states = target.trajectory_states();
        assert_eq!(states[&mapping[&first]], TrajectoryState::Frozen);
        assert_eq!(states[&mapping[&second]], TrajectoryState::Frozen);

        let mut unfrozen = InMemoryMapBuilder::new(options(2));
        let mapping = unfrozen.load_state(&mut blob.as_slice(), false).unwrap();
        assert!(mapping
            .values()
            .all(|id| unfrozen.trajectory_states()[id] == TrajectoryState::Finished));
    }

    #[test]
    fn frozen_trajectories_stay_frozen_across_reload() {
        let mut source = InMemoryMapBuilder::new(options(2));
        let mut blob = Vec::new();
        {
            let id = start(&mut source);
            source.finish_trajectory(id).unwrap();
            source.serialize_state(true, &mut blob).unwrap();
        }
        let mut frozen = InMemoryMapBuilder::new(options(2));
        frozen.load_state(&mut blob.as_slice(), true).unwrap();
        let mut again = Vec::new();
        frozen.serialize_state(true, &mut again).unwrap();

        let mut reloaded = InMemoryMapBuilder::new(options(2));
        let mapping = reloaded.load_state(&mut again.as_slice(), false).unwrap();
        let id = mapping.values().next().copied().unwrap();
        assert_eq!(reloaded.trajectory_states()[&id], TrajectoryState::Frozen);
    }

    #[test]
    fn corrupted_blob_leaves_engine_untouched() {
        let mut builder = InMemoryMapBuilder::new(options(2));
        let err = builder
            .load_state(&mut &b"SLAMBLOB\xff\x00garbage"[..], true)
            .unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        let err = builder
            .load_state(&mut &b"not a blob at all"[..], true)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Persistence(PersistenceError::BadMagic)
        ));
        assert!(builder.trajectory_states().is_empty());
    }

    #[test]
    fn duplicate_trajectory_ids_are_structurally_invalid() {
        let record = SerializedTrajectory {
            id: TrajectoryId(4),
            state: TrajectoryState::Finished,
            frozen: false,
            node_count: 0,
            expected_sensors: Vec::new(),
            submaps: Vec::new(),
            sensor_counts: BTreeMap::new(),
            latest_stamp: None,
        };
        let snapshot = SerializedMapState {
            trajectories: vec![record.clone(), record],
        };
        let mut blob = Vec::new();
        write_blob(&mut blob, &snapshot).unwrap();

        let mut builder = InMemoryMapBuilder::new(options(2));
        let err = builder.load_state(&mut blob.as_slice(), false).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert!(builder.trajectory_states().is_empty());
    }

    #[test]
    fn optimization_skips_frozen_trajectories() {
        let mut source = InMemoryMapBuilder::new(options(2));
        let id = start(&mut source);
        source.finish_trajectory(id).unwrap();
        let mut blob = Vec::new();
        source.serialize_state(false, &mut blob).unwrap();

        let mut builder = InMemoryMapBuilder::new(options(2));
        builder.load_state(&mut blob.as_slice(), true).unwrap();
        let live = start(&mut builder);
        builder
            .add_sensor_data(live, SensorSample::range("scan", 8))
            .unwrap();
        builder.finish_trajectory(live).unwrap();

        let summary = builder.run_final_optimization();
        assert_eq!(summary.trajectories_frozen, 1);
        assert_eq!(summary.trajectories_optimized, 1);
        assert_eq!(summary.trajectory_nodes, 1);
        assert_eq!(builder.optimizations_run(), 1);
    }

    #[test]
    fn metrics_register_once() {
        let registry = Registry::new();
        let mut builder = InMemoryMapBuilder::new(options(1));
        builder.register_metrics(&registry).unwrap();
        assert!(matches!(
            builder.register_metrics(&registry),
            Err(EngineError::MetricsAlreadyRegistered)
        ));

        let id = start(&mut builder);
        builder
            .add_sensor_data(id, SensorSample::range("scan", 3))
            .unwrap();
        let families = registry.gather();
        let submaps = families
            .iter()
            .find(|family| family.get_name() == "slam_map_builder_submaps_finished_total")
            .unwrap();
        assert_eq!(submaps.get_metric()[0].get_counter().get_value(), 1.0);
    }
}
