//! # Node Entry Point
//!
//! Startup order: CLI → logging → keypair (fatal on failure) → first
//! resource sample → journal → node state → bootstrap handshake + ring
//! join → background loops → HTTP server.
//!
//! Each background loop is an independently cancellable task on a shared
//! shutdown signal; loops log failures and keep ticking, they never
//! terminate on their own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn, Level};

use edgemesh_common::{Journal, NodeKeypair, PricingParameters};
use edgemesh_node::cli::Cli;
use edgemesh_node::gossip;
use edgemesh_node::handlers::build_router;
use edgemesh_node::monitor::{ResourceMonitor, SAMPLE_INTERVAL_SECS};
use edgemesh_node::offers::{self, ADVERTISE_INTERVAL_SECS};
use edgemesh_node::state::{Node, NodeConfig};

/// Chord stabilize / fix_fingers cadence.
const STABILIZE_INTERVAL: Duration = Duration::from_secs(5);

/// Well-known TLS material paths; when both exist, termination is
/// expected in front of the node.
const TLS_CERT_PATH: &str = "cert.pem";
const TLS_KEY_PATH: &str = "key.pem";

fn spawn_loop<F, Fut>(
    name: &'static str,
    shutdown: Arc<Notify>,
    delay: impl Fn() -> Duration + Send + 'static,
    tick: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay()) => tick().await,
                _ = shutdown.notified() => {
                    info!("{} loop stopped", name);
                    break;
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    // Keypair failure is the one startup error the node refuses to
    // work around.
    let keypair = match NodeKeypair::load_or_generate(&cli.key_file) {
        Ok(keypair) => keypair,
        Err(e) => {
            error!("cannot load or create node keypair: {}", e);
            std::process::exit(1);
        }
    };

    let monitor = ResourceMonitor::new();
    let journal = Journal::open(&cli.log_file)
        .with_context(|| format!("opening journal {}", cli.log_file.display()))?;

    if cli.promised_capacity.is_some() {
        info!("--promised_capacity is advisory; using hardware-derived capacity");
    }

    let config = NodeConfig {
        ip: cli.ip.clone(),
        port: cli.port,
        bootstrap: cli.bootstrap.clone(),
        debug: cli.debug,
        pricing: PricingParameters {
            cpu_per_hour_usd: cli.cpu_price,
            ram_gb_per_hour_usd: cli.ram_price,
        },
    };
    let node = Node::new(config, keypair, monitor, journal);

    info!("node {} (id {})", node.endpoint(), node.chord_id().short());
    info!("derived capacity: {}", node.promised_capacity);
    if std::path::Path::new(TLS_CERT_PATH).exists()
        && std::path::Path::new(TLS_KEY_PATH).exists()
    {
        info!("TLS material present; expecting external TLS termination");
    }

    // Join an existing ring when a bootstrap contact was given.
    if let Some(bootstrap) = node.config.bootstrap.clone() {
        if let Err(e) = gossip::register_with(&node, &bootstrap).await {
            warn!("bootstrap handshake with {} failed: {}", bootstrap, e);
        }
        match node
            .overlay
            .join(&bootstrap, &node.transport, &node.registry)
            .await
        {
            Ok(()) => {
                let joiner = node.clone();
                tokio::spawn(async move {
                    joiner
                        .overlay
                        .fix_first_fingers(&joiner.transport, &joiner.registry)
                        .await;
                });
            }
            Err(e) => warn!("ring join via {} failed: {}", bootstrap, e),
        }
    }

    let shutdown = Arc::new(Notify::new());
    let mut loops = Vec::new();

    {
        let node = node.clone();
        loops.push(spawn_loop(
            "stabilize",
            shutdown.clone(),
            || STABILIZE_INTERVAL,
            move || {
                let node = node.clone();
                async move {
                    node.overlay.stabilize(&node.transport, &node.registry).await;
                }
            },
        ));
    }
    {
        let node = node.clone();
        loops.push(spawn_loop(
            "fix_fingers",
            shutdown.clone(),
            || STABILIZE_INTERVAL,
            move || {
                let node = node.clone();
                async move {
                    node.overlay
                        .fix_fingers_once(&node.transport, &node.registry)
                        .await;
                }
            },
        ));
    }
    {
        let node = node.clone();
        loops.push(spawn_loop(
            "discovery",
            shutdown.clone(),
            gossip::next_discovery_delay,
            move || {
                let node = node.clone();
                async move {
                    gossip::discovery_tick(&node).await;
                    gossip::health_tick(&node).await;
                }
            },
        ));
    }
    {
        let node = node.clone();
        loops.push(spawn_loop(
            "monitor",
            shutdown.clone(),
            || Duration::from_secs(SAMPLE_INTERVAL_SECS),
            move || {
                let node = node.clone();
                async move {
                    node.monitor.refresh();
                    let load = node
                        .current_load
                        .load(std::sync::atomic::Ordering::SeqCst);
                    node.registry.update_self(node.promised_capacity, load);
                }
            },
        ));
    }
    {
        let node = node.clone();
        loops.push(spawn_loop(
            "advertise",
            shutdown.clone(),
            || Duration::from_secs(ADVERTISE_INTERVAL_SECS),
            move || {
                let node = node.clone();
                async move {
                    offers::advertise_once(&node).await;
                }
            },
        ));
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", node.config.port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("listening on {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, build_router(node))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("ctrl-c listener failed: {}", e);
            }
            info!("shutdown requested");
            server_shutdown.notify_waiters();
        })
        .await
        .context("http server")?;

    for handle in loops {
        let _ = handle.await;
    }
    info!("node stopped cleanly");
    Ok(())
}
