use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use vport_net::audit::create_audit_logger;
use vport_net::config::{Backend, Config};
use vport_net::forward::{ForwardingEngine, transmit_channel};
use vport_net::host::{HostEnvironment, LoopbackHost, TapHost};
use vport_net::server::ControlServer;
use vport_net::{ControlHandler, LinkManager, PortRegistry};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = config.log_filter().context("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        socket = %config.socket.display(),
        backend = ?config.backend,
        max_ports = config.max_ports,
        workers = config.workers,
        "Starting vportd"
    );

    let (tx, rx) = transmit_channel();
    let host: Arc<dyn HostEnvironment> = match config.backend {
        Backend::Tap => Arc::new(TapHost::new(tx)),
        Backend::Loopback => Arc::new(LoopbackHost::new().with_transmit(tx)),
    };

    let audit = create_audit_logger();
    let registry = Arc::new(PortRegistry::new(host, config.max_ports, audit));
    let links = LinkManager::new(Arc::clone(&registry));
    let engine = Arc::new(ForwardingEngine::new(Arc::clone(&registry)));
    let mut workers = engine
        .spawn_workers(rx, config.workers)
        .context("Failed to start forwarding workers")?;

    let server = ControlServer::bind(&config.socket, ControlHandler::new(links.clone()))
        .context("Failed to create control socket")?;

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    let result = server
        .run(async {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
        })
        .await;
    if let Err(e) = &result {
        error!(error = %e, "Control socket error");
    }
    drop(server);

    // Lower every carrier and release every device before the workers go.
    links.teardown();
    workers.stop();

    let stats = engine.stats();
    info!(
        forwarded = stats.forwarded,
        dropped = stats.dropped,
        "Daemon stopped"
    );
    result.map_err(Into::into)
}
