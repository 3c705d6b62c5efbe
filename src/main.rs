//! Mock Manager - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use hyper::Uri;
use mock_manager::{
    Fallback, MockLoader, MockManagerConfig, MockRegistry, MockServer, ReloadSession,
    ReloadSessions,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mock-manager",
    about = "Development-time HTTP mock server - file-defined mocks with hot reload",
    version
)]
struct Args {
    /// Path to configuration file, relative to the working directory
    #[arg(short, long, default_value = "mock-manager.yaml")]
    config: PathBuf,

    /// Project directory that holds `mock/`
    #[arg(long, default_value = ".")]
    cwd: PathBuf,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    listen: SocketAddr,

    /// Forward unmatched requests to this HTTP server (e.g. "http://127.0.0.1:3000")
    #[arg(short, long, value_name = "URI")]
    upstream: Option<Uri>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Do not reload when mock files change
    #[arg(long)]
    no_watch: bool,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and mock files, then exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../demos/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    let cwd = args
        .cwd
        .canonicalize()
        .with_context(|| format!("Working directory not found: {}", args.cwd.display()))?;
    let config_path = cwd.join(&args.config);

    let config = if config_path.exists() {
        info!(path = ?config_path, "Loading configuration");
        MockManagerConfig::from_file(&config_path)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", config_path);
    } else {
        info!("Using default configuration");
        MockManagerConfig::default()
    };

    if args.validate {
        config.validate()?;
        let records = MockLoader::new(&cwd, &config).load()?;
        println!(
            "Configuration is valid ({} mocks defined)",
            records.len()
        );
        return Ok(());
    }

    let watch = config.watch && !args.no_watch;
    let debounce = Duration::from_millis(config.debounce_ms);
    let registry = Arc::new(MockRegistry::new(&cwd, config));

    match registry.reload().await {
        Ok(summary) => info!(records = summary.records, "Mocks loaded"),
        Err(e) => warn!(error = %e, "Initial mock load failed, serving cached state only"),
    }

    let mut sessions = ReloadSessions::new();
    if watch {
        sessions.push(ReloadSession::start(registry.clone(), debounce)?);
    }

    let fallback = match args.upstream {
        Some(upstream) => {
            info!(upstream = %upstream, "Forwarding unmatched requests");
            Fallback::proxy(upstream)
        }
        None => Fallback::NotFound,
    };
    let server = MockServer::new(registry.clone()).with_fallback(fallback);

    tokio::select! {
        result = server.run(args.listen) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    sessions.stop_all();
    info!(
        requests = registry.total_requests(),
        matched = registry.total_matched(),
        "Mock manager stopped"
    );
    Ok(())
}
