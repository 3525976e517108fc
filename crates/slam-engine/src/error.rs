//! ---
//! slam_section: "02-mapping-engine"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Mapping engine contract and reference implementation."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
use slam_persistence::PersistenceError;
use thiserror::Error;

use crate::types::TrajectoryId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("trajectory {0} does not exist")]
    UnknownTrajectory(TrajectoryId),
    #[error("trajectory {0} is not accepting input")]
    TrajectoryNotActive(TrajectoryId),
    #[error("trajectory {trajectory_id} does not expect {kind} data on topic '{topic}'")]
    UnexpectedSensor {
        trajectory_id: TrajectoryId,
        topic: String,
        kind: String,
    },
    #[error("range data on '{0}' contains no points")]
    EmptyRangeData(String),
    #[error("state blob is structurally invalid: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("state stream error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine metrics are already registered")]
    MetricsAlreadyRegistered,
    #[error(transparent)]
    Metrics(#[from] anyhow::Error),
}
