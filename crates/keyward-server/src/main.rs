//! Keyward Server
//!
//! Identity command service listening for line-delimited JSON commands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use keyward_core::{AppConfig, StoreBackend};
use keyward_server::auth::PasswordService;
use keyward_server::{serve, Backend, Dispatcher, SystemClock, TcpGateway};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keyward-server")]
#[command(about = "Identity command service", long_about = None)]
#[command(version)]
struct Args {
    /// TOML configuration file; environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep all records in process memory instead of PostgreSQL
    #[arg(long)]
    in_memory: bool,

    /// Listen port (overrides configuration)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    if args.in_memory {
        config.database.backend = StoreBackend::Memory;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    init_tracing(&config);

    let backend = Backend::from_config(&config.database).await?;
    if config.database.backend == StoreBackend::Memory {
        tracing::warn!("Using in-memory stores, records are lost on exit");
    }

    let gateway = Arc::new(TcpGateway::new(&config.services));
    let dispatcher = Arc::new(Dispatcher::new(
        &config,
        backend,
        gateway,
        Arc::new(SystemClock),
        PasswordService::default(),
    ));
    dispatcher.roles().seed_defaults().await?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Keyward server listening on {}", addr);

    serve(
        listener,
        dispatcher,
        config.server.max_frame_bytes,
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        },
    )
    .await?;

    tracing::info!("Keyward server stopped");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let level = &config.logging.level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("keyward_server={level},keyward_core={level},audit=info").into()
    });

    if config.logging.json_format {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
