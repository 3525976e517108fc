//! ---
//! slam_section: "01-core-functionality"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Node controller, sensor ingress and run sequence."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
use std::path::PathBuf;

use slam_common::ConfigurationError;
use slam_engine::{EngineError, TrajectoryId};
use thiserror::Error;

use crate::controller::LifecyclePhase;

/// Everything the controller and run sequence can report.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    StateLoad(#[from] StateLoadError),
    #[error(transparent)]
    LifecycleOrder(#[from] LifecycleOrderError),
    #[error(transparent)]
    TrajectoryStart(#[from] TrajectoryStartError),
    #[error(transparent)]
    StateSave(#[from] StateSaveError),
    #[error(transparent)]
    SensorInput(#[from] SensorInputError),
    #[error("metrics setup failed: {0}")]
    Metrics(#[from] anyhow::Error),
    #[error("shutdown task failed: {0}")]
    Shutdown(#[from] tokio::task::JoinError),
}

impl NodeError {
    /// Errors after which the node must not keep running.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NodeError::Configuration(_)
                | NodeError::StateLoad(_)
                | NodeError::Metrics(_)
                | NodeError::Shutdown(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum StateLoadError {
    #[error("cannot open state file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} could not be restored: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: EngineError,
    },
}

/// A lifecycle operation was issued out of order.
#[derive(Debug, Error)]
#[error("{operation} is not allowed while the node is {phase}: {reason}")]
pub struct LifecycleOrderError {
    pub operation: &'static str,
    pub phase: LifecyclePhase,
    pub reason: &'static str,
}

#[derive(Debug, Error)]
pub enum TrajectoryStartError {
    #[error("invalid trajectory options: {0}")]
    InvalidOptions(#[from] ConfigurationError),
    #[error("topic '{topic}' is subscribed more than once by the same trajectory")]
    DuplicateTopic { topic: String },
    #[error("topic '{topic}' is already bound to active trajectory {owner}")]
    TopicInUse { topic: String, owner: TrajectoryId },
    #[error("odom frame '{frame}' is already provided by active trajectory {owner}")]
    OdomFrameInUse { frame: String, owner: TrajectoryId },
}

#[derive(Debug, Error)]
pub enum StateSaveError {
    #[error("cannot write state file {path}: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing state to {path} failed: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: EngineError,
    },
}

#[derive(Debug, Error)]
pub enum SensorInputError {
    #[error("the node controller has been dropped")]
    NodeGone,
    #[error("trajectory {0} is not accepting sensor input")]
    TrajectoryNotActive(TrajectoryId),
    #[error("trajectory {trajectory_id} has no {kind} input on topic '{topic}'")]
    UnknownTopic {
        trajectory_id: TrajectoryId,
        topic: String,
        kind: String,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}
