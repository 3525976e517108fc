//! ---
//! slam_section: "01-core-functionality"
//! slam_subsection: "binary"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Binary entrypoint for the SLAM node daemon."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use slam_common::logging::init_tracing;
use slam_common::{LogFormat, LoggingConfig, DEFAULT_INSTALL_CONFIG_DIR};
use slam_node::{default_engine, run, RunOptions, RunReport, SaveOutcome};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "SLAM node daemon",
    long_about = "Loads the node configuration, optionally restores a prior map state, \
                  starts the default trajectory and runs until interrupted. On Ctrl-C all \
                  trajectories are finished, the final optimization runs and the state is \
                  saved when requested."
)]
struct Cli {
    #[arg(
        long,
        value_name = "DIR",
        default_value = "",
        help = "First directory in which configuration files are searched"
    )]
    configuration_directory: String,

    #[arg(
        long,
        value_name = "FILE",
        default_value = "",
        help = "Basename, i.e. not containing any directory prefix, of the configuration file"
    )]
    configuration_basename: String,

    #[arg(
        long,
        value_name = "DIR",
        default_value = DEFAULT_INSTALL_CONFIG_DIR,
        help = "Fallback directory searched after the configuration directory"
    )]
    install_configuration_directory: PathBuf,

    #[arg(
        long,
        value_name = "FILE",
        help = "If non-empty, filename of a state blob to load before starting"
    )]
    load_state_filename: Option<String>,

    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        help = "Load the saved state as frozen (non-optimized) trajectories"
    )]
    load_frozen_state: bool,

    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        help = "Start the first trajectory immediately with the configured topics"
    )]
    start_trajectory_with_default_topics: bool,

    #[arg(
        long,
        value_name = "FILE",
        help = "If non-empty, serialize state to this file on shutdown"
    )]
    save_state_filename: Option<String>,

    #[arg(long, help = "Activate metrics collection and the /metrics exporter")]
    collect_metrics: bool,

    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:9898")]
    metrics_listen: SocketAddr,

    #[arg(long, value_name = "DIR", default_value = "target/logs")]
    log_dir: PathBuf,

    #[arg(long, value_name = "FORMAT", default_value = "pretty", help = "pretty or json")]
    log_format: LogFormat,
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            configuration_directory: PathBuf::from(&self.configuration_directory),
            configuration_basename: self.configuration_basename.clone(),
            install_configuration_directory: Some(self.install_configuration_directory.clone()),
            load_state_filename: non_empty(&self.load_state_filename),
            load_frozen_state: self.load_frozen_state,
            start_trajectory_with_default_topics: self.start_trajectory_with_default_topics,
            save_state_filename: non_empty(&self.save_state_filename),
            collect_metrics: self.collect_metrics,
            metrics_listen: Some(self.metrics_listen),
        }
    }

    fn logging(&self) -> LoggingConfig {
        self.run_options()
            .logging_config(&self.log_dir, self.log_format)
    }
}

fn non_empty(path: &Option<String>) -> Option<PathBuf> {
    path.as_deref()
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing("slam-noded", &cli.logging()) {
        eprintln!("failed to initialise logging: {err:#}");
        return ExitCode::FAILURE;
    }

    let result = run_daemon(&cli, ctrl_c()).await;
    ExitCode::from(exit_status(&result))
}

async fn ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("ctrl-c received; shutting down"),
        Err(err) => warn!(error = %err, "unable to listen for ctrl-c; shutting down"),
    }
}

async fn run_daemon<S>(cli: &Cli, termination: S) -> Result<RunReport>
where
    S: Future<Output = ()>,
{
    let options = cli.run_options();
    info!(
        configuration_directory = %options.configuration_directory.display(),
        configuration_basename = %options.configuration_basename,
        collect_metrics = options.collect_metrics,
        "starting slam node"
    );
    run(options, default_engine, termination)
        .await
        .context("slam node run failed")
}

/// Process exit status for a finished run. A state file that could not be
/// written does not make the shutdown unclean.
fn exit_status(result: &Result<RunReport>) -> u8 {
    match result {
        Ok(report) => {
            if let SaveOutcome::Failed { path, error } = &report.save {
                warn!(path = %path.display(), error = %error, "state was not saved");
            }
            info!(
                finished = report.finished_trajectories.len(),
                optimized = report.optimization.trajectories_optimized,
                "node shut down cleanly"
            );
            0
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "node terminated with a fatal error");
            eprintln!("{err:#}");
            1
        }
    }
}
