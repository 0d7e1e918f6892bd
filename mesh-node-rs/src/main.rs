//! Mesh Node
//!
//! Runs the stations of a fabric configuration, one supervised task each.

use clap::Parser;
use futures_util::future::join_all;
use mesh_core::{Fabric, FabricConfig, StationControl, StationState, Supervisor, SupervisorExit};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Mesh fabric node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fabric configuration (JSON)
    #[arg(short, long, default_value = "mesh.json")]
    config: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Only run these stations (repeatable)
    #[arg(short, long)]
    station: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = FabricConfig::load(&args.config)?;
    for name in &args.station {
        config.station(name)?;
    }
    info!(
        "Mesh node starting with {} stations from {}",
        config.stations.len(),
        args.config
    );

    let fabric = Fabric::new(config.global.clone());
    for station in &config.stations {
        fabric.register(station.clone());
    }

    let selected: Vec<String> = config
        .stations
        .iter()
        .map(|s| s.station_name.clone())
        .filter(|name| args.station.is_empty() || args.station.contains(name))
        .collect();

    let mut events = fabric.events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Event log skipped {} events", missed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            info!(
                "Event: {:?} {} at {}{}",
                event.kind,
                event.station,
                event.at.format("%H:%M:%S%.3f"),
                event
                    .detail
                    .as_deref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            );
        }
    });

    let handles: Vec<_> = selected
        .iter()
        .map(|name| Supervisor::new(name.clone(), fabric.clone()).spawn())
        .collect();

    let control = StationControl::new(fabric.clone());
    let supervised = join_all(handles);
    tokio::pin!(supervised);

    let results = tokio::select! {
        results = &mut supervised => results,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested, closing stations");
            for name in control.controllable() {
                control.close(&name, false).await;
            }
            // system stations refuse external control; the node owns them
            for name in &selected {
                fabric.directory.transition(name, |s| {
                    matches!(s, StationState::Running | StationState::Paused)
                        .then_some(StationState::Closing)
                });
            }
            match tokio::time::timeout(fabric.global.close_timeout(), &mut supervised).await {
                Ok(results) => results,
                Err(_) => {
                    warn!("Stations did not stop within {:?}", fabric.global.close_timeout());
                    return Ok(());
                }
            }
        }
    };

    for (name, result) in selected.iter().zip(results) {
        match result {
            Ok(SupervisorExit::Closed) => info!("{}: closed", name),
            Ok(SupervisorExit::InitFailed(e)) => error!("{}: failed to start: {}", name, e),
            Ok(SupervisorExit::Exhausted { restarts, reason }) => {
                error!("{}: gave up after {} restarts: {}", name, restarts, reason)
            }
            Err(e) => error!("{}: supervisor task failed: {}", name, e),
        }
    }
    Ok(())
}
