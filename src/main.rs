//! Racegate CLI entry point

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use racegate::{Config, Gateway, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "racegate")]
#[command(version = VERSION)]
#[command(about = "TCP tunnel proxy that races upstream proxies against direct paths")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Host to bind (overrides config)
    #[arg(long = "host")]
    host: Option<String>,

    /// Cache file for statistics saving and restoring
    #[arg(short = 'C', long = "cache")]
    cache: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    // Proxy workloads are connection-heavy; keep the runtime lean
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("racegate-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path.to_str().unwrap_or_default()) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(cache) = args.cache {
        config.cache_file = cache;
    }

    let level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("racegate={}", level).parse()?),
        )
        .init();

    info!("Racegate v{}", VERSION);

    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let gateway = match Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to initialize gateway: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
