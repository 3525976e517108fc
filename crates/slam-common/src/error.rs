//! ---
//! slam_section: "01-core-functionality"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Shared primitives and utilities for the node runtime."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
use std::path::PathBuf;

use thiserror::Error;

/// Failure to resolve or interpret the node configuration.
///
/// Every variant is fatal for the run sequence: no engine is constructed
/// once configuration loading has failed.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A required configuration identifier was not supplied.
    #[error("-{0} is missing.")]
    MissingIdentifier(&'static str),
    /// The requested configuration directory cannot be listed.
    #[error("configuration directory {path} is unreadable: {source}")]
    DirectoryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// No search directory contains the requested file.
    #[error("configuration file '{name}' not found; searched: {}", display_paths(.searched))]
    FileNotFound { name: String, searched: Vec<PathBuf> },
    /// A configuration file exists but could not be read.
    #[error("unable to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A configuration file is not valid TOML.
    #[error("failed to parse configuration file {path}: {source}")]
    Syntax {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// The merged configuration does not match the option schema.
    #[error("configuration rooted at {path} is malformed: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },
    /// A file includes itself, directly or through other files.
    #[error("configuration include cycle detected at '{name}'")]
    IncludeCycle { name: String },
    /// A field parsed correctly but holds an unusable value.
    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigurationError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
