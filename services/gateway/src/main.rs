//! Gateway daemon entry point.
//!
//! Startup order: config, storage (with integrity check), default-harness
//! upsert, UDP session recovery, listener binds, then the serve tasks and
//! the liveness sweeper.  Exit codes: 0 clean shutdown, 1 config error,
//! 2 listener bind failure, 3 storage unreachable or corrupt.

use clap::Parser;
use gateway::config::{self, ListenerConfig};
use gateway::heartbeat::Heartbeat;
use gateway::storage::{SqliteStore, shared};
use gateway::{GatewayCtx, tcp, udp};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "gateway", about = "Multi-protocol GPS tracker gateway")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/fleet-gateway/gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let config = config::load_config_from_path(&args.config).unwrap_or_else(|e| {
        eprintln!("FATAL: config: {e}");
        std::process::exit(1);
    });

    let store = SqliteStore::open(std::path::Path::new(&config.storage.sqlite_path))
        .unwrap_or_else(|e| {
            eprintln!("FATAL: storage: {e}");
            std::process::exit(3);
        });
    if let Err(e) = store.integrity_check() {
        eprintln!("FATAL: storage integrity: {e}");
        std::process::exit(3);
    }
    let storage = shared(store);
    // Race-free default harness: upsert once at startup, never under load.
    if let Err(e) = storage.lock().await.create_default_harness() {
        eprintln!("FATAL: default harness: {e}");
        std::process::exit(3);
    }

    let ctx = GatewayCtx::build(&config, storage).await.unwrap_or_else(|e| {
        eprintln!("FATAL: storage: {e}");
        std::process::exit(3);
    });

    // Bind everything before serving anything, so a port clash is a clean
    // startup failure rather than a half-running gateway.
    let bind_tcp = |listener: &ListenerConfig, name: &str| {
        let bind = listener.bind.clone();
        let name = name.to_owned();
        async move {
            match TcpListener::bind(&bind).await {
                Ok(listener) => {
                    info!(%bind, protocol = %name, "listening (tcp)");
                    listener
                }
                Err(e) => {
                    eprintln!("FATAL: bind {name} on {bind}: {e}");
                    std::process::exit(2);
                }
            }
        }
    };
    let bind_udp = |listener: &ListenerConfig, name: &str| {
        let bind = listener.bind.clone();
        let name = name.to_owned();
        async move {
            match UdpSocket::bind(&bind).await {
                Ok(socket) => {
                    info!(%bind, protocol = %name, "listening (udp)");
                    socket
                }
                Err(e) => {
                    eprintln!("FATAL: bind {name} on {bind}: {e}");
                    std::process::exit(2);
                }
            }
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if config.listeners.wialon.enabled {
        let listener = bind_tcp(&config.listeners.wialon, "wialon").await;
        tasks.push(tokio::spawn(tcp::serve_wialon(
            listener,
            Arc::clone(&ctx),
            shutdown_rx.clone(),
        )));
    }
    if config.listeners.concox.enabled {
        let listener = bind_tcp(&config.listeners.concox, "concox").await;
        tasks.push(tokio::spawn(tcp::serve_concox(
            listener,
            Arc::clone(&ctx),
            shutdown_rx.clone(),
        )));
    }
    if config.listeners.sgavl.enabled {
        let listener = bind_tcp(&config.listeners.sgavl, "sgavl").await;
        tasks.push(tokio::spawn(tcp::serve_sgavl(
            listener,
            Arc::clone(&ctx),
            shutdown_rx.clone(),
        )));
    }
    if config.listeners.meiligao.enabled {
        let socket = bind_udp(&config.listeners.meiligao, "meiligao").await;
        tasks.push(tokio::spawn(udp::serve_meiligao(
            socket,
            Arc::clone(&ctx),
            shutdown_rx.clone(),
        )));
    }
    if config.listeners.blu.enabled {
        let socket = bind_udp(&config.listeners.blu, "blu").await;
        tasks.push(tokio::spawn(udp::serve_blu(
            socket,
            Arc::clone(&ctx),
            shutdown_rx.clone(),
        )));
    }

    let heartbeat = Arc::new(Heartbeat::new(
        Arc::clone(&ctx.registry),
        Arc::clone(&ctx.sessions),
        config.timeouts.heartbeat_timeout,
        config.timeouts.heartbeat_timeout_blu,
    ));
    tasks.push(tokio::spawn(heartbeat.run(
        config.timeouts.heartbeat_interval,
        shutdown_rx.clone(),
    )));

    info!("gateway started");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");

    let _ = shutdown_tx.send(true);
    // In-flight connections get the grace window to finish their frame.
    if tokio::time::timeout(SHUTDOWN_GRACE, futures_util::future::join_all(tasks))
        .await
        .is_err()
    {
        warn!("shutdown grace period elapsed, closing remaining sockets");
    }
    info!("gateway stopped");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler failed, ctrl-c only");
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
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
