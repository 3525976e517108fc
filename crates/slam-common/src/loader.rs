//! ---
//! slam_section: "01-core-functionality"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Shared primitives and utilities for the node runtime."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
//! Configuration loading.
//!
//! A configuration is addressed by a directory and a basename. Files are
//! looked up through a [`FileResolver`] which searches the requested
//! directory first and the installation directory second. A file may pull
//! in others with a top-level `include = ["..."]` list; included files are
//! layered underneath the file that includes them, so the including file
//! always wins.

use std::fs;
use std::path::{Path, PathBuf};

use config::{Config, File, FileFormat};
use serde::Deserialize;
use tracing::debug;

use crate::config::{NodeOptions, TrajectoryOptions};
use crate::error::ConfigurationError;

/// Directory searched after the requested one.
pub const DEFAULT_INSTALL_CONFIG_DIR: &str = "/usr/share/slam-node/configuration_files";

/// Ordered list of directories configuration files are resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResolver {
    search_directories: Vec<PathBuf>,
}

impl FileResolver {
    pub fn new(search_directories: Vec<PathBuf>) -> Self {
        Self { search_directories }
    }

    pub fn search_directories(&self) -> &[PathBuf] {
        &self.search_directories
    }

    /// Locate `name` in the first search directory containing it.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, ConfigurationError> {
        for directory in &self.search_directories {
            let candidate = directory.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(ConfigurationError::FileNotFound {
            name: name.to_owned(),
            searched: self.search_directories.clone(),
        })
    }

    /// Resolve and read `name`, returning the path that matched alongside its contents.
    pub fn read(&self, name: &str) -> Result<(PathBuf, String), ConfigurationError> {
        let path = self.resolve(name)?;
        let contents = fs::read_to_string(&path).map_err(|source| ConfigurationError::Read {
            path: path.clone(),
            source,
        })?;
        Ok((path, contents))
    }
}

/// Options together with the files they were assembled from.
#[derive(Debug, Clone)]
pub struct LoadedConfiguration {
    pub node: NodeOptions,
    pub trajectory: TrajectoryOptions,
    /// Every file that contributed a layer, lowest precedence first.
    pub sources: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawConfiguration {
    node: NodeOptions,
    trajectory: TrajectoryOptions,
}

#[derive(Debug, Default, Deserialize)]
struct IncludeHeader {
    #[serde(default)]
    include: Vec<String>,
}

struct Layer {
    path: PathBuf,
    contents: String,
}

/// Loads node and trajectory options from a configuration directory.
#[derive(Debug, Clone)]
pub struct ConfigurationLoader {
    install_directory: Option<PathBuf>,
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self {
            install_directory: Some(PathBuf::from(DEFAULT_INSTALL_CONFIG_DIR)),
        }
    }
}

impl ConfigurationLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `directory` as the installation fallback instead of the default.
    pub fn with_install_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            install_directory: Some(directory.into()),
        }
    }

    /// Only ever search the requested directory.
    pub fn without_install_directory() -> Self {
        Self {
            install_directory: None,
        }
    }

    /// Build the resolver for a requested directory. The installation
    /// directory is appended only when it exists and differs.
    pub fn resolver_for(&self, configuration_directory: &Path) -> FileResolver {
        let mut directories = vec![configuration_directory.to_path_buf()];
        if let Some(install) = &self.install_directory {
            if install.is_dir() && install.as_path() != configuration_directory {
                directories.push(install.clone());
            }
        }
        FileResolver::new(directories)
    }

    pub fn load(
        &self,
        configuration_directory: impl AsRef<Path>,
        configuration_basename: &str,
    ) -> Result<(NodeOptions, TrajectoryOptions), ConfigurationError> {
        let loaded = self.load_with_sources(configuration_directory, configuration_basename)?;
        Ok((loaded.node, loaded.trajectory))
    }

    pub fn load_with_sources(
        &self,
        configuration_directory: impl AsRef<Path>,
        configuration_basename: &str,
    ) -> Result<LoadedConfiguration, ConfigurationError> {
        let directory = configuration_directory.as_ref();
        if directory.as_os_str().is_empty() {
            return Err(ConfigurationError::MissingIdentifier(
                "configuration_directory",
            ));
        }
        if configuration_basename.trim().is_empty() {
            return Err(ConfigurationError::MissingIdentifier(
                "configuration_basename",
            ));
        }
        fs::read_dir(directory).map_err(|source| ConfigurationError::DirectoryUnreadable {
            path: directory.to_path_buf(),
            source,
        })?;

        let resolver = self.resolver_for(directory);
        let mut layers = Vec::new();
        let mut stack = Vec::new();
        collect_layers(&resolver, configuration_basename, &mut stack, &mut layers)?;

        let root = layers
            .last()
            .map(|layer| layer.path.clone())
            .unwrap_or_else(|| directory.join(configuration_basename));
        let mut builder = Config::builder();
        for layer in &layers {
            debug!(config_path = %layer.path.display(), "layering configuration file");
            builder = builder.add_source(File::from_str(&layer.contents, FileFormat::Toml));
        }
        let raw: RawConfiguration = builder
            .build()
            .and_then(|merged| merged.try_deserialize())
            .map_err(|source| ConfigurationError::Schema {
                path: root.clone(),
                source,
            })?;

        raw.node.validate()?;
        raw.trajectory.validate()?;
        debug!(
            config_path = %root.display(),
            layers = layers.len(),
            "configuration loaded"
        );
        Ok(LoadedConfiguration {
            node: raw.node,
            trajectory: raw.trajectory,
            sources: layers.into_iter().map(|layer| layer.path).collect(),
        })
    }
}

fn collect_layers(
    resolver: &FileResolver,
    name: &str,
    stack: &mut Vec<PathBuf>,
    layers: &mut Vec<Layer>,
) -> Result<(), ConfigurationError> {
    let (path, contents) = resolver.read(name)?;
    if stack.contains(&path) {
        return Err(ConfigurationError::IncludeCycle {
            name: name.to_owned(),
        });
    }
    let header: IncludeHeader =
        toml::from_str(&contents).map_err(|source| ConfigurationError::Syntax {
            path: path.clone(),
            source,
        })?;

    stack.push(path.clone());
    for include in &header.include {
        collect_layers(resolver, include, stack, layers)?;
    }
    stack.pop();

    layers.push(Layer { path, contents });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BASE: &str = r#"
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
use_odometry = false
use_nav_sat = false
use_landmarks = false
num_laser_scans = 1
num_multi_echo_laser_scans = 0
num_subdivisions_per_laser_scan = 1
num_point_clouds = 0
"#;

    #[test]
    fn include_is_overridden_by_including_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("base.toml"), BASE).unwrap();
        fs::write(
            dir.path().join("robot.toml"),
            "include = [\"base.toml\"]\n[trajectory]\nuse_odometry = true\n",
        )
        .unwrap();

        let loaded = ConfigurationLoader::without_install_directory()
            .load_with_sources(dir.path(), "robot.toml")
            .unwrap();
        assert!(loaded.trajectory.use_odometry);
        assert_eq!(loaded.node.map_frame, "map");
        assert_eq!(
            loaded.sources,
            vec![dir.path().join("base.toml"), dir.path().join("robot.toml")]
        );
    }

    #[test]
    fn requested_directory_shadows_install_directory() {
        let requested = tempdir().unwrap();
        let install = tempdir().unwrap();
        fs::write(install.path().join("base.toml"), BASE).unwrap();
        fs::write(
            requested.path().join("base.toml"),
            BASE.replace("\"map\"", "\"world\""),
        )
        .unwrap();
        fs::write(
            requested.path().join("robot.toml"),
            "include = [\"base.toml\"]\n",
        )
        .unwrap();

        let loader = ConfigurationLoader::with_install_directory(install.path());
        let (node, _) = loader.load(requested.path(), "robot.toml").unwrap();
        assert_eq!(node.map_frame, "world");
    }

    #[test]
    fn install_directory_supplies_missing_includes() {
        let requested = tempdir().unwrap();
        let install = tempdir().unwrap();
        fs::write(install.path().join("base.toml"), BASE).unwrap();
        fs::write(
            requested.path().join("robot.toml"),
            "include = [\"base.toml\"]\n",
        )
        .unwrap();

        let loader = ConfigurationLoader::with_install_directory(install.path());
        let loaded = loader
            .load_with_sources(requested.path(), "robot.toml")
            .unwrap();
        assert_eq!(loaded.sources[0], install.path().join("base.toml"));
    }

    #[test]
    fn include_cycle_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.toml"), "include = [\"b.toml\"]\n").unwrap();
        fs::write(dir.path().join("b.toml"), "include = [\"a.toml\"]\n").unwrap();
        let err = ConfigurationLoader::without_install_directory()
            .load(dir.path(), "a.toml")
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::IncludeCycle { .. }));
    }

    #[test]
    fn missing_required_field_is_a_schema_error() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("robot.toml"),
            BASE.replace("map_frame = \"map\"\n", ""),
        )
        .unwrap();
        let err = ConfigurationLoader::without_install_directory()
            .load(dir.path(), "robot.toml")
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::Schema { .. }), "{err}");
    }

    #[test]
    fn oversized_sensor_counts_are_rejected() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("robot.toml"),
            BASE.replace("num_laser_scans = 1", "num_laser_scans = 4294967295")
                .replace("num_point_clouds = 0", "num_point_clouds = 1"),
        )
        .unwrap();
        let err = ConfigurationLoader::without_install_directory()
            .load(dir.path(), "robot.toml")
            .unwrap_err();
        match err {
            ConfigurationError::Invalid { field, .. } => {
                assert_eq!(field, "trajectory.num_laser_scans")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_identifiers_are_reported_by_name() {
        let loader = ConfigurationLoader::without_install_directory();
        let err = loader.load("", "robot.toml").unwrap_err();
        assert_eq!(err.to_string(), "-configuration_directory is missing.");
        let err = loader.load("/tmp", "").unwrap_err();
        assert_eq!(err.to_string(), "-configuration_basename is missing.");
    }

    #[test]
    fn repeated_loads_serialize_identically() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("base.toml"), BASE).unwrap();
        fs::write(
            dir.path().join("robot.toml"),
            "include = [\"base.toml\"]\n[trajectory.topics]\nnamespace = \"robot_a\"\n",
        )
        .unwrap();
        let loader = ConfigurationLoader::without_install_directory();
        let render = |options: (NodeOptions, TrajectoryOptions)| {
            serde_json::to_string(&options).unwrap()
        };
        let first = render(loader.load(dir.path(), "robot.toml").unwrap());
        let second = render(loader.load(dir.path(), "robot.toml").unwrap());
        assert_eq!(first, second);
        assert!(first.contains("\"namespace\":\"robot_a\""));
    }
}
