use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Arg, ArgAction, Command};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use service_graph::{
    GraphView, ServerConfig, ServiceGraph, ServiceGraphCache, ServiceGraphError, ServiceGraphRequest, SnapshotBackend, TimeRange,
};

fn cli() -> Command {
    Command::new("service-graph")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Builds a service graph for a time window from recorded flow data")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (defaults to the user config directory)"),
        )
        .arg(
            Arg::new("snapshot")
                .short('s')
                .long("snapshot")
                .value_name("FILE")
                .help("JSON snapshot of flow logs, events and labels")
                .required(true),
        )
        .arg(
            Arg::new("view")
                .short('v')
                .long("view")
                .value_name("FILE")
                .help("JSON graph view: focus, expanded nodes, layers, host groups"),
        )
        .arg(
            Arg::new("cluster")
                .long("cluster")
                .value_name("NAME")
                .help("Cluster to query")
                .default_value(service_graph::config::defaults::DEFAULT_CLUSTER),
        )
        .arg(Arg::new("from").long("from").value_name("TIME").help("Window start, RFC 3339 or now-<n><s|m|h|d>"))
        .arg(Arg::new("to").long("to").value_name("TIME").help("Window end, RFC 3339 or now"))
        .arg(
            Arg::new("force-refresh")
                .long("force-refresh")
                .help("Re-query the backend even if the window is cached")
                .action(ArgAction::SetTrue),
        )
}

fn init_logging(config: &ServerConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // stdout carries the graph, so logs go to stderr or the configured file.
    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
        }
    }
    Ok(())
}

fn load_view(path: Option<&Path>) -> Result<GraphView> {
    let Some(path) = path else {
        return Ok(GraphView::default());
    };
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read view file: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse view file: {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let config = ServerConfig::load(config_path.as_deref())?;
    init_logging(&config)?;
    info!("🚀 Starting service graph...");

    let snapshot_path = matches.get_one::<String>("snapshot").map(PathBuf::from).context("--snapshot is required")?;
    let backend = SnapshotBackend::load(&snapshot_path, config.cache.max_aggregated_records)?;
    info!("✅ Backend loaded");

    let shutdown = CancellationToken::new();
    let cache = ServiceGraphCache::new(Arc::new(backend), config.cache.clone(), shutdown.clone());
    if config.cache.prefetch {
        cache.prefetch(&config.cache.prefetch_clusters()).await;
    }
    let graph = ServiceGraph::new(cache);

    let view = load_view(matches.get_one::<String>("view").map(Path::new))?;
    let from = matches.get_one::<String>("from").unwrap_or(&config.request.default_from);
    let to = matches.get_one::<String>("to").unwrap_or(&config.request.default_to);
    let cluster = matches
        .get_one::<String>("cluster")
        .cloned()
        .unwrap_or_else(|| service_graph::config::defaults::DEFAULT_CLUSTER.to_string());

    let request = ServiceGraphRequest {
        cluster,
        time_range: TimeRange::parse(from, to, Utc::now())?,
        view,
        timeout: config.request.timeout(),
        force_refresh: matches.get_flag("force-refresh"),
    };

    let cancel = CancellationToken::new();
    let result = tokio::select! {
        result = graph.get_service_graph(&request, &cancel) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling request");
            cancel.cancel();
            Err(ServiceGraphError::Cancelled)
        }
    };
    shutdown.cancel();

    match result {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&err.to_response())?);
            Err(err.into())
        }
    }
}
