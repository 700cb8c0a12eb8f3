//! Racegate - a racing TCP tunnel proxy
//!
//! For every client-requested destination, racegate opens parallel
//! connections across the configured upstream proxies and the
//! DNS-resolved direct path, commits to whichever proves itself fastest
//! and trustworthy, and keeps learning which paths work for which domains.
//!
//! # Architecture
//!
//! ```text
//!                  +---------------+
//!                  |   inbound/    |
//!                  | (accept+detect)
//!                  +-------+-------+
//!                          |
//!            +-------------+-------------+
//!            |                           |
//!     +------v------+            +-------v------+
//!     |  adapter/   |            |    race/     |
//!     | (http,socks)|            |  (sessions)  |
//!     +-------------+            +-------+------+
//!                                        |
//!                  +---------------------+
//!                  |
//!           +------v------+      +--------------+
//!           |    diag/    +------>   registry   |
//!           | (dns, ping, |      | (proxies +   |
//!           |  feedback)  |      |  overrides)  |
//!           +-------------+      +--------------+
//! ```

pub mod adapter;
pub mod common;
pub mod config;
pub mod diag;
pub mod inbound;
pub mod race;
pub mod registry;

pub use common::error::{Error, Result};
pub use config::Config;

use race::RaceSettings;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Gateway instance wiring the diagnostics engine, target registry and
/// inbound listener together
pub struct Gateway {
    config: Config,
    registry: Arc<registry::TargetRegistry>,
    engine: Arc<diag::DiagnosticEngine>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing racegate v{}", VERSION);

        let registry = Arc::new(registry::TargetRegistry::from_config(&config.upstreams)?);
        info!("Loaded {} upstream proxies", registry.proxies().len());

        let engine = diag::DiagnosticEngine::new(registry.clone(), &config)?;
        info!("Diagnostics engine initialized");

        Ok(Gateway {
            config,
            registry,
            engine,
            shutdown: CancellationToken::new(),
        })
    }

    /// Run until SIGINT/SIGTERM. The usage cache is restored at startup and
    /// written back on shutdown.
    pub async fn run(&self) -> Result<()> {
        self.engine.restore_cache();
        self.engine.spawn_background();

        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let inbound = inbound::Inbound::new(
            self.engine.clone(),
            self.registry.clone(),
            RaceSettings::from(&self.config.tunables),
        );
        let accept = tokio::spawn(inbound.run(listener, self.shutdown.child_token()));

        wait_for_signal().await;
        info!("Shutting down, saving cache");
        self.shutdown.cancel();
        self.engine.close();
        accept.abort();
        Ok(())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
