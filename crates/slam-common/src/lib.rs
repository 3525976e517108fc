//! ---
//! slam_section: "01-core-functionality"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Shared primitives and utilities for the node runtime."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
//! Shared primitives for the SLAM node workspace.
//! This crate exposes the configuration loader, the immutable node and
//! trajectory option types, and the tracing setup used by the daemon.

pub mod config;
pub mod error;
pub mod loader;
pub mod logging;

pub use config::{
    MapBuilderOptions, NodeOptions, SensorId, SensorKind, SensorTopics,
    TrajectoryOptions,
};
pub use error::ConfigurationError;
pub use loader::{
    ConfigurationLoader, FileResolver, LoadedConfiguration,
    DEFAULT_INSTALL_CONFIG_DIR,
};
pub use logging::{init_tracing, LogFormat, LoggingConfig};
