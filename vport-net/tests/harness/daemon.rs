//! In-process daemon bound to a temp-dir control socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use vport_net::audit::AuditLogger;
use vport_net::client::ControlClient;
use vport_net::forward::{ForwardingEngine, ForwardingWorkers, transmit_channel};
use vport_net::host::{HostEnvironment, LoopbackHost};
use vport_net::server::{ControlServer, ServerError};
use vport_net::{ControlHandler, LinkManager, PortRegistry};

use super::LARGE_INBOX;

/// Reply timeout used by test clients.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A running daemon. Stops the server and workers on drop.
pub struct TestDaemon {
    _tmp_dir: TempDir,
    socket_path: PathBuf,
    pub host: Arc<LoopbackHost>,
    pub links: LinkManager,
    pub engine: Arc<ForwardingEngine>,
    workers: Option<ForwardingWorkers>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<Result<(), ServerError>>>,
}

impl TestDaemon {
    pub fn start() -> Self {
        Self::start_with_max_ports(vport_net::registry::DEFAULT_MAX_PORTS)
    }

    /// Must be called from within a tokio runtime.
    pub fn start_with_max_ports(max_ports: usize) -> Self {
        let tmp_dir = TempDir::new().expect("Failed to create temp dir");
        let socket_path = tmp_dir.path().join("vport.sock");

        let (tx, rx) = transmit_channel();
        let host = Arc::new(
            LoopbackHost::new()
                .with_transmit(tx)
                .with_inbox_capacity(LARGE_INBOX),
        );
        let registry = Arc::new(PortRegistry::new(
            Arc::clone(&host) as Arc<dyn HostEnvironment>,
            max_ports,
            Arc::new(AuditLogger::new_noop()),
        ));
        let links = LinkManager::new(Arc::clone(&registry));
        let engine = Arc::new(ForwardingEngine::new(registry));
        let workers = engine.spawn_workers(rx, 2).expect("Failed to spawn workers");

        let server = ControlServer::bind(&socket_path, ControlHandler::new(links.clone()))
            .expect("Failed to bind control socket");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            server
                .run(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Self {
            _tmp_dir: tmp_dir,
            socket_path,
            host,
            links,
            engine,
            workers: Some(workers),
            shutdown: Some(shutdown_tx),
            server: Some(server),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn client(&self) -> ControlClient {
        ControlClient::connect(&self.socket_path, CLIENT_TIMEOUT).expect("Failed to bind client")
    }

    /// Stop the server and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(server) = self.server.take() {
            server
                .await
                .expect("Server task panicked")
                .expect("Server failed");
        }
        self.links.teardown();
        if let Some(mut workers) = self.workers.take() {
            workers.stop();
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
