//! ---
//! slam_section: "02-mapping-engine"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Mapping engine contract and reference implementation."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
//! The mapping engine as seen by the node controller.
//!
//! [`MapBuilder`] is the whole contract: trajectory builders, sensor
//! insertion, final optimization and state (de)serialization. The
//! [`InMemoryMapBuilder`] honours that contract with bookkeeping only; it
//! tracks submaps and trajectory nodes but performs no scan matching.

pub mod error;
pub mod in_memory;
pub mod map_builder;
pub mod types;

pub use error::EngineError;
pub use in_memory::{InMemoryMapBuilder, SerializedMapState};
pub use map_builder::{create_map_builder, MapBuilder};
pub use types::{
    OptimizationSummary, SensorData, SensorSample, SubmapSummary, TrajectoryId, TrajectoryState,
};
