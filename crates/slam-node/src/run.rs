//! ---
//! slam_section: "01-core-functionality"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Node controller, sensor ingress and run sequence."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
//! Top-level driver: configuration, engine, controller, steady state and
//! ordered shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;

use slam_common::{
    ConfigurationError, ConfigurationLoader, LogFormat, LoggingConfig, NodeOptions,
    TrajectoryOptions,
};
use slam_engine::{create_map_builder, MapBuilder, OptimizationSummary, TrajectoryId};
use slam_logging::{log_lifecycle_event, node_warn, LifecycleOutcome, LogContext};
use slam_metrics::spawn_http_server;
use tracing::{info, warn};

use crate::controller::{NodeController, NODE_NAME};
use crate::error::NodeError;
use crate::ingress::SensorIngress;

/// Everything the run sequence needs, passed in explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub configuration_directory: PathBuf,
    pub configuration_basename: String,
    /// Fallback search directory. `None` searches the requested directory only.
    pub install_configuration_directory: Option<PathBuf>,
    pub load_state_filename: Option<PathBuf>,
    pub load_frozen_state: bool,
    pub start_trajectory_with_default_topics: bool,
    pub save_state_filename: Option<PathBuf>,
    pub collect_metrics: bool,
    /// Where the `/metrics` exporter listens when metrics are collected.
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            configuration_directory: PathBuf::new(),
            configuration_basename: String::new(),
            install_configuration_directory: Some(PathBuf::from(
                slam_common::DEFAULT_INSTALL_CONFIG_DIR,
            )),
            load_state_filename: None,
            load_frozen_state: true,
            start_trajectory_with_default_topics: true,
            save_state_filename: None,
            collect_metrics: false,
            metrics_listen: None,
        }
    }
}

impl RunOptions {
    pub fn new(
        configuration_directory: impl Into<PathBuf>,
        configuration_basename: impl Into<String>,
    ) -> Self {
        Self {
            configuration_directory: configuration_directory.into(),
            configuration_basename: configuration_basename.into(),
            ..Self::default()
        }
    }

    /// Both configuration identifiers must be present.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.configuration_directory.as_os_str().is_empty() {
            return Err(ConfigurationError::MissingIdentifier(
                "configuration_directory",
            ));
        }
        if self.configuration_basename.trim().is_empty() {
            return Err(ConfigurationError::MissingIdentifier(
                "configuration_basename",
            ));
        }
        Ok(())
    }

    /// Logging for a node started from these options. The log file carries
    /// the configuration basename.
    pub fn logging_config(&self, directory: impl Into<PathBuf>, format: LogFormat) -> LoggingConfig {
        LoggingConfig::new(directory, format).with_configuration(&self.configuration_basename)
    }

    fn loader(&self) -> ConfigurationLoader {
        match &self.install_configuration_directory {
            Some(directory) => ConfigurationLoader::with_install_directory(directory),
            None => ConfigurationLoader::without_install_directory(),
        }
    }
}

/// Result of the best-effort save at shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Skipped,
    Saved(PathBuf),
    Failed { path: PathBuf, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub finished_trajectories: Vec<TrajectoryId>,
    pub optimization: OptimizationSummary,
    pub save: SaveOutcome,
}

/// Steps one to five of the run sequence.
pub struct RunSequence;

impl RunSequence {
    /// Load configuration, build the engine and controller, restore prior
    /// state and auto-start the default trajectory. Every error returned
    /// here is fatal.
    pub fn prepare<F>(options: &RunOptions, engine_factory: F) -> Result<ActiveNode, NodeError>
    where
        F: FnOnce(&NodeOptions) -> Box<dyn MapBuilder>,
    {
        let ctx = LogContext::new().with_node(NODE_NAME).with_phase("startup");
        let loaded = options.validate().map_err(NodeError::from).and_then(|()| {
            options
                .loader()
                .load_with_sources(
                    &options.configuration_directory,
                    &options.configuration_basename,
                )
                .map_err(NodeError::from)
        });
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                log_lifecycle_event(
                    Some(&ctx),
                    "load_configuration",
                    &err.to_string(),
                    LifecycleOutcome::Fatal,
                );
                return Err(err);
            }
        };
        info!(
            configuration_directory = %options.configuration_directory.display(),
            configuration_basename = %options.configuration_basename,
            files = loaded.sources.len(),
            "configuration resolved"
        );

        let engine = engine_factory(&loaded.node);
        let mut controller = NodeController::new(loaded.node, engine, options.collect_metrics)?;

        if let Some(path) = &options.load_state_filename {
            controller.load_state(path, options.load_frozen_state)?;
        }

        let mut default_trajectory = None;
        if options.start_trajectory_with_default_topics {
            match controller.start_trajectory(loaded.trajectory.clone()) {
                Ok(id) => default_trajectory = Some(id),
                Err(err) => node_warn!(
                    context = ctx,
                    "default trajectory could not be started: {err}"
                ),
            }
        }

        Ok(ActiveNode {
            controller,
            trajectory_options: loaded.trajectory,
            default_trajectory,
            save_state_filename: options.save_state_filename.clone(),
        })
    }
}

/// A node in its steady state, between start-up and shutdown.
#[derive(Debug)]
pub struct ActiveNode {
    controller: NodeController,
    trajectory_options: TrajectoryOptions,
    default_trajectory: Option<TrajectoryId>,
    save_state_filename: Option<PathBuf>,
}

impl ActiveNode {
    pub fn controller(&self) -> &NodeController {
        &self.controller
    }

    /// For starting further trajectories while running.
    pub fn controller_mut(&mut self) -> &mut NodeController {
        &mut self.controller
    }

    pub fn sensor_ingress(&self) -> SensorIngress {
        self.controller.sensor_ingress()
    }

    /// Trajectory options from the loaded configuration.
    pub fn trajectory_options(&self) -> &TrajectoryOptions {
        &self.trajectory_options
    }

    pub fn default_trajectory(&self) -> Option<TrajectoryId> {
        self.default_trajectory
    }

    /// Steps seven and eight: finish, optimize, save when configured, then
    /// release the controller and with it the engine. Blocks until the
    /// final optimization completes. A failed save is reported in the
    /// returned [`RunReport`], not as an error.
    pub fn shutdown(self) -> Result<RunReport, NodeError> {
        let ActiveNode {
            mut controller,
            save_state_filename,
            ..
        } = self;

        let finished_trajectories = controller.finish_all_trajectories()?;
        let optimization = controller.run_final_optimization()?;
        let save = match save_state_filename {
            None => SaveOutcome::Skipped,
            Some(path) => match controller.serialize_state(&path, true) {
                Ok(()) => SaveOutcome::Saved(path),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "state could not be saved");
                    SaveOutcome::Failed {
                        path,
                        error: err.to_string(),
                    }
                }
            },
        };

        drop(controller);
        let ctx = LogContext::new().with_node(NODE_NAME).with_phase("released");
        log_lifecycle_event(
            Some(&ctx),
            "shutdown",
            "node resources released",
            LifecycleOutcome::Success,
        );
        Ok(RunReport {
            finished_trajectories,
            optimization,
            save,
        })
    }
}

/// Run the node until `termination` resolves, then shut it down in order.
///
/// The shutdown tail runs on a blocking thread since the final optimization
/// has no bound on its duration.
pub async fn run<F, S>(
    options: RunOptions,
    engine_factory: F,
    termination: S,
) -> Result<RunReport, NodeError>
where
    F: FnOnce(&NodeOptions) -> Box<dyn MapBuilder>,
    S: Future<Output = ()>,
{
    let node = RunSequence::prepare(&options, engine_factory)?;

    let exporter = match (node.controller().metrics_registry(), options.metrics_listen) {
        (Some(registry), Some(addr)) => match spawn_http_server(registry, addr) {
            Ok(server) => {
                info!(address = %server.addr(), "metrics exporter listening");
                Some(server)
            }
            Err(err) => {
                warn!(error = %err, "metrics exporter could not be started");
                None
            }
        },
        _ => None,
    };

    info!(
        active_trajectories = node.controller().active_trajectories().len(),
        "node running; waiting for termination signal"
    );
    termination.await;
    info!("termination requested; shutting down");

    let report = tokio::task::spawn_blocking(move || node.shutdown())
        .await
        .map_err(NodeError::from)
        .and_then(|report| report);

    if let Some(server) = exporter {
        if let Err(err) = server.shutdown().await {
            warn!(error = %err, "metrics exporter did not stop cleanly");
        }
    }
    report
}

/// Engine factory used by the daemon.
pub fn default_engine(options: &NodeOptions) -> Box<dyn MapBuilder> {
    create_map_builder(&options.map_builder)
}
