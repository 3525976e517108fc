//! ---
//! slam_section: "01-core-functionality"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Node controller, sensor ingress and run sequence."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
//! Lifecycle orchestration for the SLAM node.
//!
//! [`NodeController`] owns the mapping engine and enforces the order
//! `load state → start trajectories → finish → optimize → save`.
//! [`RunSequence`] drives it from configuration to ordered shutdown.

pub mod controller;
pub mod error;
pub mod ingress;
pub mod run;

pub use controller::{LifecyclePhase, NodeController};
pub use error::{
    LifecycleOrderError, NodeError, SensorInputError, StateLoadError, StateSaveError,
    TrajectoryStartError,
};
pub use ingress::{FixedRatioSampler, SampleDisposition, SensorIngress};
pub use run::{
    default_engine, run, ActiveNode, RunOptions, RunReport, RunSequence, SaveOutcome,
};
