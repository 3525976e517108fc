//! ---
//! slam_section: "03-persistence-logging"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Metrics collection and export utilities."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the node.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
///
/// Binding to port 0 picks a free port; [`MetricsServer::addr`] reports the
/// address actually bound.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to query metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the node controller.
#[derive(Clone, Debug)]
pub struct NodeMetrics {
    trajectories_started: IntCounter,
    trajectories_active: IntGauge,
    sensor_samples: IntCounterVec,
    final_optimization_seconds: Histogram,
    state_operations: IntCounterVec,
}

impl NodeMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let trajectories_started = IntCounter::with_opts(Opts::new(
            "slam_node_trajectories_started_total",
            "Trajectories started since the node came up",
        ))?;
        registry.register(Box::new(trajectories_started.clone()))?;

        let trajectories_active = IntGauge::with_opts(Opts::new(
            "slam_node_trajectories_active",
            "Trajectories currently accepting sensor input",
        ))?;
        registry.register(Box::new(trajectories_active.clone()))?;

        let sensor_samples = IntCounterVec::new(
            Opts::new(
                "slam_node_sensor_samples_total",
                "Sensor samples seen by the node, by sensor kind and disposition",
            ),
            &["kind", "disposition"],
        )?;
        registry.register(Box::new(sensor_samples.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 4.0, 12)
            .context("failed to construct histogram buckets")?;
        let final_optimization_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "slam_node_final_optimization_seconds",
                "Wall time spent in the final global optimization",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(final_optimization_seconds.clone()))?;

        let state_operations = IntCounterVec::new(
            Opts::new(
                "slam_node_state_operations_total",
                "State load and save attempts by outcome",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(state_operations.clone()))?;

        Ok(Self {
            trajectories_started,
            trajectories_active,
            sensor_samples,
            final_optimization_seconds,
            state_operations,
        })
    }

    pub fn record_trajectory_started(&self) {
        self.trajectories_started.inc();
    }

    pub fn set_active_trajectories(&self, count: usize) {
        self.trajectories_active.set(count as i64);
    }

    /// `disposition` is one of `accepted`, `sampled_out` or `rejected`.
    pub fn record_sensor_sample(&self, kind: &str, disposition: &str) {
        self.sensor_samples
            .with_label_values(&[kind, disposition])
            .inc();
    }

    pub fn observe_final_optimization(&self, seconds: f64) {
        self.final_optimization_seconds.observe(seconds);
    }

    pub fn record_state_operation(&self, operation: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.state_operations
            .with_label_values(&[operation, outcome])
            .inc();
    }
}

/// Metrics owned by the mapping engine.
#[derive(Clone, Debug)]
pub struct MapBuilderMetrics {
    submaps_finished: IntCounter,
    range_data_inserted: IntCounter,
    trajectory_nodes: IntGauge,
    optimizations: IntCounter,
}

impl MapBuilderMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let submaps_finished = IntCounter::with_opts(Opts::new(
            "slam_map_builder_submaps_finished_total",
            "Submaps that reached their range data quota",
        ))?;
        registry.register(Box::new(submaps_finished.clone()))?;

        let range_data_inserted = IntCounter::with_opts(Opts::new(
            "slam_map_builder_range_data_total",
            "Range measurements inserted into submaps",
        ))?;
        registry.register(Box::new(range_data_inserted.clone()))?;

        let trajectory_nodes = IntGauge::with_opts(Opts::new(
            "slam_map_builder_trajectory_nodes",
            "Trajectory nodes held by the pose graph",
        ))?;
        registry.register(Box::new(trajectory_nodes.clone()))?;

        let optimizations = IntCounter::with_opts(Opts::new(
            "slam_map_builder_optimizations_total",
            "Global optimization passes run",
        ))?;
        registry.register(Box::new(optimizations.clone()))?;

        Ok(Self {
            submaps_finished,
            range_data_inserted,
            trajectory_nodes,
            optimizations,
        })
    }

    pub fn record_range_data(&self) {
        self.range_data_inserted.inc();
    }

    pub fn record_submap_finished(&self) {
        self.submaps_finished.inc();
    }

    pub fn set_trajectory_nodes(&self, count: usize) {
        self.trajectory_nodes.set(count as i64);
    }

    pub fn record_optimization(&self) {
        self.optimizations.inc();
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn node_metrics_register_once_per_registry() {
        let registry = new_registry();
        let metrics = NodeMetrics::new(&registry).unwrap();
        metrics.record_trajectory_started();
        metrics.set_active_trajectories(2);
        metrics.record_state_operation("save", false);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"slam_node_trajectories_started_total".to_owned()));
        assert!(names.contains(&"slam_node_state_operations_total".to_owned()));
        assert!(NodeMetrics::new(&registry).is_err(), "duplicate registration");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exporter_serves_registered_families() {
        let registry = new_registry();
        let metrics = MapBuilderMetrics::new(&registry).unwrap();
        metrics.record_range_data();

        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("slam_map_builder_range_data_total 1"));
        assert!(
            response
                .to_ascii_lowercase()
                .contains(&format!("content-type: {}", prometheus::TEXT_FORMAT)),
            "{response}"
        );
        server.shutdown().await.unwrap();
    }
}
