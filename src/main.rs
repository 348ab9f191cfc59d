use clap::Parser;
use ferrumha::{web, ConnectionRouter, Error, SentinelConfig, StatusReporter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sentinel-backed router for a replicated key-value store
#[derive(Debug, Parser)]
#[command(name = "ferrumha", version, about)]
struct Args {
    /// TOML configuration file (FERRUMHA_* variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address of the diagnostics server, overrides `web_addr`
    #[arg(long)]
    web_addr: Option<String>,
}

fn init_logging(config: &SentinelConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = SentinelConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.web_addr {
        config.web_addr = addr;
    }

    init_logging(&config);
    info!("FerrumHA starting for master {}", config.master_name);

    let config = Arc::new(config);
    let router = match ConnectionRouter::new(config.clone()) {
        Ok(router) => Arc::new(router),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Resolve once up front; failures here are not fatal, requests retry
    match router.refresh().await {
        Ok(view) => info!(
            "Primary {} with {} replicas",
            view.primary,
            view.replicas.len()
        ),
        Err(e @ Error::Configuration(_)) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
        Err(e) => warn!("Initial resolution failed: {}", e),
    }

    let reporter = StatusReporter::new(router);
    let web_addr = config.web_addr.clone();

    // Start Web server in background task
    let web_handle = tokio::spawn(async move {
        info!("Starting diagnostics server on {}", web_addr);
        if let Err(e) = web::run_web_server(&web_addr, reporter).await {
            error!("Web server error: {}", e);
        }
    });

    tokio::select! {
        _ = web_handle => error!("Web server stopped"),
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
