//! NutriSync Smoke Harness
//!
//! Registers the offline gateway against a running deployment, replays a list
//! of requests through it and prints a JSON report of what came back and what
//! ended up in the cache.
//!
//! ```text
//! nutrisync-smoke --origin http://localhost:5173 --navigate /history /icon-192.png /api/suggest_foods
//! ```

use anyhow::Context;
use clap::Parser;
use nutrisync_common::{init_logging, LogConfig, LogFormat};
use nutrisync_net::{HttpNetwork, LoaderConfig, Request};
use nutrisync_sw::{
    CacheStore, DiskStore, GatewayConfig, MemoryStore, ServiceWorkerContainer, ServiceWorkerEvent,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "nutrisync-smoke")]
#[command(about = "Run the NutriSync offline gateway against a live deployment")]
struct Args {
    /// Gateway config file (defaults to the per-user config location)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the application origin
    #[arg(long)]
    origin: Option<Url>,

    /// Override the version token
    #[arg(long)]
    version: Option<String>,

    /// Keep the cache in memory instead of the storage dir
    #[arg(long)]
    memory: bool,

    /// Deliver a background sync signal after the requests
    #[arg(long)]
    sync: bool,

    /// Log output format: pretty, compact or json
    #[arg(long, default_value = "compact", value_parser = parse_log_format)]
    log_format: LogFormat,

    /// Paths to load as top-level navigations
    #[arg(long = "navigate", value_name = "PATH")]
    navigations: Vec<String>,

    /// Paths to fetch as sub-resources
    #[arg(value_name = "PATH")]
    paths: Vec<String>,
}

impl Args {
    /// Requests in replay order: navigations first, then sub-resources.
    fn requests(&self) -> Vec<(&str, bool)> {
        self.navigations
            .iter()
            .map(|p| (p.as_str(), true))
            .chain(self.paths.iter().map(|p| (p.as_str(), false)))
            .collect()
    }
}

fn parse_log_format(name: &str) -> Result<LogFormat, String> {
    LogFormat::from_name(name).ok_or_else(|| format!("unknown log format '{name}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if let Err(e) = init_logging(LogConfig::default().with_format(args.log_format)) {
        eprintln!("Warning: {e}");
    }

    let mut config = GatewayConfig::load(args.config.as_deref()).context("loading gateway config")?;
    if let Some(ref origin) = args.origin {
        config.origin = origin.clone();
    }
    if let Some(ref version) = args.version {
        config.version = version.clone();
    }

    let store: Arc<dyn CacheStore> = if args.memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            DiskStore::open_dir(&config.storage_dir)
                .await
                .with_context(|| format!("opening cache dir {}", config.storage_dir.display()))?,
        )
    };
    let network = Arc::new(HttpNetwork::new(LoaderConfig::default())?);

    info!(origin = %config.origin, version = %config.version, "Starting NutriSync smoke harness");

    let (container, mut events) = ServiceWorkerContainer::new(network, Arc::clone(&store));
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServiceWorkerEvent::StateChange { worker_id, new_state } => {
                    info!(worker = worker_id.raw(), state = ?new_state, "Worker state")
                }
                ServiceWorkerEvent::InstallFailed { worker_id, error } => {
                    warn!(worker = worker_id.raw(), %error, "Install failed")
                }
                ServiceWorkerEvent::ControllerChange { client_id, worker_id } => {
                    info!(client = %client_id, worker = worker_id.raw(), "Controller changed")
                }
            }
        }
    });

    let started = Instant::now();
    container
        .register(config.clone())
        .await
        .context("installing gateway")?;
    let install_ms = started.elapsed().as_millis();

    let requests = args.requests();
    let mut results = Vec::with_capacity(requests.len());
    for (path, navigate) in requests {
        let url = config.resolve(path)?;
        let request = if navigate {
            Request::navigate(url.clone())
        } else {
            Request::get(url.clone())
        };

        let started = Instant::now();
        let outcome = match container.dispatch_fetch(request).await {
            Ok(response) => {
                let status = response.status.as_u16();
                let content_type = response.content_type().map(|m| m.to_string());
                match response.bytes().await {
                    Ok(body) => json!({
                        "status": status,
                        "content_type": content_type,
                        "bytes": body.len(),
                    }),
                    Err(e) => json!({ "status": status, "error": e.to_string() }),
                }
            }
            Err(e) => json!({ "error": e.to_string() }),
        };
        results.push(json!({
            "url": url.as_str(),
            "navigate": navigate,
            "elapsed_ms": started.elapsed().as_millis(),
            "outcome": outcome,
        }));
    }

    let background_writes = container.settle().await;
    if args.sync {
        container.dispatch_sync(&config.sync_tag).await?;
    }

    let mut generations = serde_json::Map::new();
    for name in store.keys().await? {
        let entries = store.entries(&name).await?;
        generations.insert(name, json!(entries.len()));
    }

    let report = json!({
        "version": container.active_version().await,
        "install_ms": install_ms,
        "requests": results,
        "background_writes": background_writes,
        "generations": generations,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
