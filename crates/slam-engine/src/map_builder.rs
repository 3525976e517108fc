//! ---
//! slam_section: "02-mapping-engine"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Mapping engine contract and reference implementation."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

use slam_common::{MapBuilderOptions, SensorId, TrajectoryOptions};
use slam_metrics::prometheus::Registry;

use crate::error::EngineError;
use crate::in_memory::InMemoryMapBuilder;
use crate::types::{OptimizationSummary, SensorSample, SubmapSummary, TrajectoryId, TrajectoryState};

/// Operations the node controller drives on a mapping engine.
///
/// Methods taking `&mut self` change the trajectory set and are only issued
/// from the single control thread. [`MapBuilder::add_sensor_data`] takes
/// `&self` and may be called concurrently from transport threads.
pub trait MapBuilder: Send + Sync + fmt::Debug {
    /// Create a trajectory builder subscribed to `expected_sensor_ids`.
    fn add_trajectory_builder(
        &mut self,
        expected_sensor_ids: &[SensorId],
        options: &TrajectoryOptions,
    ) -> TrajectoryId;

    fn add_sensor_data(
        &self,
        trajectory_id: TrajectoryId,
        sample: SensorSample,
    ) -> Result<(), EngineError>;

    /// Stop accepting input for `trajectory_id` and close its open submap.
    fn finish_trajectory(&mut self, trajectory_id: TrajectoryId) -> Result<(), EngineError>;

    /// Blocking global optimization over every non-frozen trajectory.
    fn run_final_optimization(&mut self) -> OptimizationSummary;

    fn serialize_state(
        &self,
        include_unfinished_submaps: bool,
        writer: &mut dyn Write,
    ) -> Result<(), EngineError>;

    /// Restore trajectories from a blob, returning the mapping from the ids
    /// recorded in the blob to the freshly assigned ones.
    fn load_state(
        &mut self,
        reader: &mut dyn Read,
        load_frozen_state: bool,
    ) -> Result<BTreeMap<TrajectoryId, TrajectoryId>, EngineError>;

    fn register_metrics(&mut self, registry: &Registry) -> Result<(), EngineError>;

    fn trajectory_states(&self) -> BTreeMap<TrajectoryId, TrajectoryState>;

    fn submaps(&self, trajectory_id: TrajectoryId) -> Result<Vec<SubmapSummary>, EngineError>;
}

/// Build the engine the daemon runs with.
pub fn create_map_builder(options: &MapBuilderOptions) -> Box<dyn MapBuilder> {
    tracing::info!(
        num_background_threads = options.num_background_threads,
        collate_by_trajectory = options.collate_by_trajectory,
        submap_num_range_data = options.submap_num_range_data,
        "creating in-memory map builder"
    );
    Box::new(InMemoryMapBuilder::new(options.clone()))
}
