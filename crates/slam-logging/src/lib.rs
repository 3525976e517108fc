//! ---
//! slam_section: "03-persistence-logging"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Structured lifecycle logging adapters."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Lifecycle-aware logging helpers for the node controller.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for development and tests.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Node instance name.
    pub node: Option<&'a str>,
    /// Trajectory the event concerns.
    pub trajectory: Option<u32>,
    /// Lifecycle phase when the event was emitted.
    pub phase: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node name.
    pub fn with_node(mut self, node: &'a str) -> Self {
        self.node = Some(node);
        self
    }

    /// Attach a trajectory identifier.
    pub fn with_trajectory(mut self, trajectory: u32) -> Self {
        self.trajectory = Some(trajectory);
        self
    }

    /// Attach a lifecycle phase descriptor.
    pub fn with_phase(mut self, phase: &'a str) -> Self {
        self.phase = Some(phase);
        self
    }
}

/// Outcome of a lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The step completed.
    Success,
    /// The step failed but the node keeps running.
    Degraded,
    /// The step failed and the node cannot continue.
    Fatal,
}

impl LifecycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Degraded => "degraded",
            LifecycleOutcome::Fatal => "fatal",
        }
    }
}

/// Emit a standardized lifecycle event.
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    let node = ctx.node.unwrap_or("");
    let phase = ctx.phase.unwrap_or("");
    // `tracing::event!` needs a constant level, hence one arm per level.
    match outcome {
        LifecycleOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            node,
            trajectory = ctx.trajectory,
            phase,
            "{message}"
        ),
        LifecycleOutcome::Degraded => tracing::warn!(
            event,
            outcome = outcome.as_str(),
            node,
            trajectory = ctx.trajectory,
            phase,
            "{message}"
        ),
        LifecycleOutcome::Fatal => tracing::error!(
            event,
            outcome = outcome.as_str(),
            node,
            trajectory = ctx.trajectory,
            phase,
            "{message}"
        ),
    }
}
