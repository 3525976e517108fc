//! ---
//! slam_section: "01-core-functionality"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Node controller, sensor ingress and run sequence."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use slam_common::{NodeOptions, TrajectoryOptions};
use slam_engine::{MapBuilder, OptimizationSummary, TrajectoryId, TrajectoryState};
use slam_logging::{log_lifecycle_event, node_warn, LifecycleOutcome, LogContext};
use slam_metrics::{new_registry, NodeMetrics, SharedRegistry};
use slam_persistence::{replace_file, StagedWriteError};
use tracing::{debug, info};

use crate::error::{
    LifecycleOrderError, NodeError, StateLoadError, StateSaveError, TrajectoryStartError,
};
use crate::ingress::{SensorIngress, TrajectoryBinding};

/// Node name carried in lifecycle log events.
pub(crate) const NODE_NAME: &str = "slam_node";

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecyclePhase {
    /// Engine owned, no trajectory started yet. State may still be loaded.
    Constructed,
    /// At least one trajectory has been started.
    Running,
    /// Trajectories finished; no new ones may start.
    Finished,
    /// Final optimization completed.
    Optimized,
}

impl LifecyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecyclePhase::Constructed => "constructed",
            LifecyclePhase::Running => "running",
            LifecyclePhase::Finished => "finished",
            LifecyclePhase::Optimized => "optimized",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared between the controller and its ingress handles.
///
/// Lock order is `bindings` before `engine`.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) engine: RwLock<Box<dyn MapBuilder>>,
    pub(crate) bindings: RwLock<BTreeMap<TrajectoryId, TrajectoryBinding>>,
    pub(crate) metrics: Option<NodeMetrics>,
}

/// Owns the mapping engine and enforces the lifecycle ordering.
///
/// Lifecycle operations take `&mut self`, so they are serialized by the
/// borrow checker. Sensor callbacks go through [`SensorIngress`] handles.
#[derive(Debug)]
pub struct NodeController {
    options: NodeOptions,
    shared: Arc<Shared>,
    registry: Option<SharedRegistry>,
    phase: LifecyclePhase,
    state_loaded: bool,
}

impl NodeController {
    /// Take ownership of `engine`. With `collect_metrics` the engine and the
    /// controller register their metric families in a fresh registry.
    pub fn new(
        options: NodeOptions,
        mut engine: Box<dyn MapBuilder>,
        collect_metrics: bool,
    ) -> Result<Self, NodeError> {
        let (registry, metrics) = if collect_metrics {
            let registry = new_registry();
            engine
                .register_metrics(&registry)
                .map_err(|err| NodeError::Metrics(anyhow::Error::new(err)))?;
            let metrics = NodeMetrics::new(&registry)?;
            (Some(registry), Some(metrics))
        } else {
            (None, None)
        };
        info!(
            map_frame = %options.map_frame,
            tf_buffer_cache_sec = options.tf_buffer_cache.as_secs_f64(),
            collect_metrics,
            "node controller constructed"
        );
        let controller = Self {
            options,
            shared: Arc::new(Shared {
                engine: RwLock::new(engine),
                bindings: RwLock::new(BTreeMap::new()),
                metrics,
            }),
            registry,
            phase: LifecyclePhase::Constructed,
            state_loaded: false,
        };
        controller.lifecycle("construct", "engine ownership taken", LifecycleOutcome::Success);
        Ok(controller)
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn state_loaded(&self) -> bool {
        self.state_loaded
    }

    pub fn metrics_registry(&self) -> Option<SharedRegistry> {
        self.registry.clone()
    }

    pub fn sensor_ingress(&self) -> SensorIngress {
        SensorIngress::new(Arc::downgrade(&self.shared))
    }

    /// Trajectories currently accepting sensor input.
    pub fn active_trajectories(&self) -> Vec<TrajectoryId> {
        self.shared
            .bindings
            .read()
            .iter()
            .filter(|(_, binding)| binding.active)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Engine view of every trajectory, including restored ones.
    pub fn trajectory_states(&self) -> BTreeMap<TrajectoryId, TrajectoryState> {
        self.shared.engine.read().trajectory_states()
    }

    /// Restore a state blob into the engine. Only allowed before the first
    /// trajectory starts; returns the mapping from stored to assigned ids.
    pub fn load_state(
        &mut self,
        path: &Path,
        load_frozen_state: bool,
    ) -> Result<BTreeMap<TrajectoryId, TrajectoryId>, NodeError> {
        self.require(
            "load_state",
            self.phase == LifecyclePhase::Constructed,
            "state must be loaded before any trajectory starts",
        )?;
        let result = self.restore(path, load_frozen_state);
        self.record_state_operation("load", result.is_ok());
        match result {
            Ok(mapping) => {
                self.state_loaded = true;
                self.lifecycle(
                    "load_state",
                    &format!(
                        "restored {} trajectories from {} (frozen: {load_frozen_state})",
                        mapping.len(),
                        path.display()
                    ),
                    LifecycleOutcome::Success,
                );
                Ok(mapping)
            }
            Err(err) => {
                self.lifecycle("load_state", &err.to_string(), LifecycleOutcome::Fatal);
                Err(err.into())
            }
        }
    }

    fn restore(
        &self,
        path: &Path,
        load_frozen_state: bool,
    ) -> Result<BTreeMap<TrajectoryId, TrajectoryId>, StateLoadError> {
        let file = File::open(path).map_err(|source| StateLoadError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        self.shared
            .engine
            .write()
            .load_state(&mut reader, load_frozen_state)
            .map_err(|source| StateLoadError::Invalid {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Start a trajectory bound to the topics in `options`.
    pub fn start_trajectory(
        &mut self,
        options: TrajectoryOptions,
    ) -> Result<TrajectoryId, NodeError> {
        self.require(
            "start_trajectory",
            self.phase <= LifecyclePhase::Running,
            "trajectories have already been finished",
        )?;
        let result = self.bind_trajectory(options);
        match result {
            Ok(id) => {
                self.phase = LifecyclePhase::Running;
                let active = self.active_trajectories().len();
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_trajectory_started();
                    metrics.set_active_trajectories(active);
                }
                let ctx = self.context().with_trajectory(id.get());
                log_lifecycle_event(
                    Some(&ctx),
                    "start_trajectory",
                    &format!("trajectory started ({active} active)"),
                    LifecycleOutcome::Success,
                );
                Ok(id)
            }
            Err(err) => {
                self.lifecycle("start_trajectory", &err.to_string(), LifecycleOutcome::Degraded);
                Err(err.into())
            }
        }
    }

    fn bind_trajectory(&self, options: TrajectoryOptions) -> Result<TrajectoryId, TrajectoryStartError> {
        options.validate()?;
        let expected = options.expected_sensor_ids();
        let mut requested = BTreeSet::new();
        for sensor in &expected {
            if !requested.insert(sensor.topic.as_str()) {
                return Err(TrajectoryStartError::DuplicateTopic {
                    topic: sensor.topic.clone(),
                });
            }
        }

        let mut bindings = self.shared.bindings.write();
        for (owner, binding) in bindings.iter().filter(|(_, binding)| binding.active) {
            if let Some(topic) = binding.topics().find(|topic| requested.contains(topic)) {
                return Err(TrajectoryStartError::TopicInUse {
                    topic: topic.to_owned(),
                    owner: *owner,
                });
            }
            if options.provide_odom_frame
                && binding.options.provide_odom_frame
                && binding.options.odom_frame == options.odom_frame
            {
                return Err(TrajectoryStartError::OdomFrameInUse {
                    frame: options.odom_frame.clone(),
                    owner: *owner,
                });
            }
        }

        let id = self
            .shared
            .engine
            .write()
            .add_trajectory_builder(&expected, &options);
        debug!(
            trajectory_id = %id,
            topics = ?expected.iter().map(|s| s.topic.as_str()).collect::<Vec<_>>(),
            "trajectory bound"
        );
        bindings.insert(id, TrajectoryBinding::new(options));
        Ok(id)
    }

    /// Stop every active trajectory. Waits for in-flight sensor deliveries.
    ///
    /// Once called, no new trajectory may start. Later calls do nothing and
    /// return an empty list.
    pub fn finish_all_trajectories(&mut self) -> Result<Vec<TrajectoryId>, NodeError> {
        if self.phase >= LifecyclePhase::Finished {
            debug!(phase = %self.phase, "finish_all_trajectories is a no-op");
            return Ok(Vec::new());
        }
        let mut finished = Vec::new();
        {
            let mut bindings = self.shared.bindings.write();
            let mut engine = self.shared.engine.write();
            for (id, binding) in bindings.iter_mut().filter(|(_, binding)| binding.active) {
                binding.active = false;
                if let Err(err) = engine.finish_trajectory(*id) {
                    let ctx = LogContext::new()
                        .with_node(NODE_NAME)
                        .with_trajectory(id.get());
                    node_warn!(context = ctx, "engine refused to finish trajectory: {err}");
                }
                finished.push(*id);
            }
        }
        self.phase = LifecyclePhase::Finished;
        if let Some(metrics) = &self.shared.metrics {
            metrics.set_active_trajectories(0);
        }
        self.lifecycle(
            "finish_all_trajectories",
            &format!("{} trajectories finished", finished.len()),
            LifecycleOutcome::Success,
        );
        Ok(finished)
    }

    /// Blocking global optimization. Requires finished trajectories and
    /// runs at most once.
    pub fn run_final_optimization(&mut self) -> Result<OptimizationSummary, NodeError> {
        self.require(
            "run_final_optimization",
            self.phase != LifecyclePhase::Optimized,
            "the final optimization has already run",
        )?;
        self.require(
            "run_final_optimization",
            self.phase == LifecyclePhase::Finished,
            "trajectories must be finished first",
        )?;
        let started = Instant::now();
        let summary = self.shared.engine.write().run_final_optimization();
        let elapsed = started.elapsed();
        if let Some(metrics) = &self.shared.metrics {
            metrics.observe_final_optimization(elapsed.as_secs_f64());
        }
        self.phase = LifecyclePhase::Optimized;
        self.lifecycle(
            "run_final_optimization",
            &format!(
                "optimized {} trajectories ({} frozen) in {:.3}s",
                summary.trajectories_optimized,
                summary.trajectories_frozen,
                elapsed.as_secs_f64()
            ),
            LifecycleOutcome::Success,
        );
        Ok(summary)
    }

    /// Write the engine state to `path`. Allowed in any phase and any number
    /// of times; an existing file is only replaced once the new blob is
    /// complete.
    pub fn serialize_state(
        &mut self,
        path: &Path,
        include_unfinished_submaps: bool,
    ) -> Result<(), NodeError> {
        let result = self.write_state(path, include_unfinished_submaps);
        self.record_state_operation("save", result.is_ok());
        match result {
            Ok(()) => {
                self.lifecycle(
                    "serialize_state",
                    &format!(
                        "state written to {} (unfinished submaps: {include_unfinished_submaps})",
                        path.display()
                    ),
                    LifecycleOutcome::Success,
                );
                Ok(())
            }
            Err(err) => {
                self.lifecycle("serialize_state", &err.to_string(), LifecycleOutcome::Degraded);
                Err(err.into())
            }
        }
    }

    fn write_state(&self, path: &Path, include_unfinished_submaps: bool) -> Result<(), StateSaveError> {
        // Holding the bindings lock keeps sensor deliveries out while the
        // engine is being written.
        let _bindings = self.shared.bindings.write();
        let engine = self.shared.engine.read();
        replace_file(path, |writer| {
            engine.serialize_state(include_unfinished_submaps, writer)
        })
        .map_err(|err| match err {
            StagedWriteError::Io(source) => StateSaveError::Unwritable {
                path: path.to_path_buf(),
                source,
            },
            StagedWriteError::Write(source) => StateSaveError::Serialization {
                path: path.to_path_buf(),
                source,
            },
        })
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: bool,
        reason: &'static str,
    ) -> Result<(), LifecycleOrderError> {
        if allowed {
            return Ok(());
        }
        let err = LifecycleOrderError {
            operation,
            phase: self.phase,
            reason,
        };
        self.lifecycle(operation, &err.to_string(), LifecycleOutcome::Degraded);
        Err(err)
    }

    fn record_state_operation(&self, operation: &str, success: bool) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_state_operation(operation, success);
        }
    }

    fn context(&self) -> LogContext<'static> {
        LogContext::new()
            .with_node(NODE_NAME)
            .with_phase(self.phase.as_str())
    }

    fn lifecycle(&self, event: &str, message: &str, outcome: LifecycleOutcome) {
        log_lifecycle_event(Some(&self.context()), event, message, outcome);
    }
}

impl Drop for NodeController {
    fn drop(&mut self) {
        debug!(phase = %self.phase, "node controller released");
    }
}
