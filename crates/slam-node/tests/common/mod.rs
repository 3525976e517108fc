//! ---
//! slam_section: "01-core-functionality"
//! slam_subsection: "tests"
//! slam_type: "test"
//! slam_scope: "code"
//! slam_description: "Shared fixtures for node lifecycle tests."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use slam_common::{NodeOptions, SensorId, TrajectoryOptions};
use slam_engine::{
    EngineError, InMemoryMapBuilder, MapBuilder, OptimizationSummary, SensorSample,
    SerializedMapState, SubmapSummary, TrajectoryId, TrajectoryState,
};
use slam_metrics::prometheus::Registry;

pub const MAP_BUILDER: &str = r#"
[node.map_builder]
num_background_threads = 2
submap_num_range_data = 3
"#;

pub const BACKPACK: &str = r#"
include = ["map_builder.toml"]

[node]
map_frame = "map"
lookup_transform_timeout_sec = 0.2
submap_publish_period_sec = 0.3
pose_publish_period_sec = 5e-3
trajectory_publish_period_sec = 30e-3

[trajectory]
tracking_frame = "base_link"
published_frame = "base_link"
odom_frame = "odom"
provide_odom_frame = true
use_odometry = true
use_nav_sat = false
use_landmarks = false
num_laser_scans = 1
num_multi_echo_laser_scans = 0
num_subdivisions_per_laser_scan = 1
num_point_clouds = 0
"#;

/// Write the backpack configuration into `dir`.
/// Decode a state file written by the controller.
pub fn read_state(path: &Path) -> SerializedMapState {
    let file = fs::File::open(path).unwrap();
    slam_persistence::read_blob(file).unwrap()
}

pub fn write_configuration(dir: &Path) {
    fs::write(dir.join("map_builder.toml"), MAP_BUILDER).unwrap();
    fs::write(dir.join("backpack_2d.toml"), BACKPACK).unwrap();
}

/// Engine wrapper counting the calls the run sequence makes.
#[derive(Debug)]
pub struct CountingEngine {
    inner: InMemoryMapBuilder,
    pub counters: Arc<Counters>,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub constructed: AtomicUsize,
    pub trajectories_added: AtomicUsize,
    pub optimizations: AtomicUsize,
    /// Makes the final optimization panic, as a crashing engine would.
    pub crash_on_optimization: AtomicBool,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub fn counting_factory(
    counters: Arc<Counters>,
) -> impl FnOnce(&NodeOptions) -> Box<dyn MapBuilder> {
    move |options: &NodeOptions| {
        counters.constructed.fetch_add(1, Ordering::SeqCst);
        Box::new(CountingEngine {
            inner: InMemoryMapBuilder::new(options.map_builder.clone()),
            counters,
        }) as Box<dyn MapBuilder>
    }
}

impl MapBuilder for CountingEngine {
    fn add_trajectory_builder(
        &mut self,
        expected_sensor_ids: &[SensorId],
        options: &TrajectoryOptions,
    ) -> TrajectoryId {
        self.counters
            .trajectories_added
            .fetch_add(1, Ordering::SeqCst);
        self.inner.add_trajectory_builder(expected_sensor_ids, options)
    }

    fn add_sensor_data(
        &self,
        trajectory_id: TrajectoryId,
        sample: SensorSample,
    ) -> Result<(), EngineError> {
        self.inner.add_sensor_data(trajectory_id, sample)
    }

    fn finish_trajectory(&mut self, trajectory_id: TrajectoryId) -> Result<(), EngineError> {
        self.inner.finish_trajectory(trajectory_id)
    }

    fn run_final_optimization(&mut self) -> OptimizationSummary {
        self.counters.optimizations.fetch_add(1, Ordering::SeqCst);
        if self.counters.crash_on_optimization.load(Ordering::SeqCst) {
            panic!("engine crashed during final optimization");
        }
        self.inner.run_final_optimization()
    }

    fn serialize_state(
        &self,
        include_unfinished_submaps: bool,
        writer: &mut dyn Write,
    ) -> Result<(), EngineError> {
        self.inner.serialize_state(include_unfinished_submaps, writer)
    }

    fn load_state(
        &mut self,
        reader: &mut dyn Read,
        load_frozen_state: bool,
    ) -> Result<BTreeMap<TrajectoryId, TrajectoryId>, EngineError> {
        self.inner.load_state(reader, load_frozen_state)
    }

    fn register_metrics(&mut self, registry: &Registry) -> Result<(), EngineError> {
        self.inner.register_metrics(registry)
    }

    fn trajectory_states(&self) -> BTreeMap<TrajectoryId, TrajectoryState> {
        self.inner.trajectory_states()
    }

    fn submaps(&self, trajectory_id: TrajectoryId) -> Result<Vec<SubmapSummary>, EngineError> {
        self.inner.submaps(trajectory_id)
    }
}
