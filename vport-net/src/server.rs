//! Unix datagram control socket.
//!
//! Every datagram is one request. It is executed on the blocking pool, since
//! registration may hit the kernel, and the reply goes back to the address the
//! request came from. Requests from different clients are served concurrently.

use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UnixDatagram;
use tracing::{debug, error, info, warn};

use crate::handler::ControlHandler;

/// Receive buffer size. Anything past a request is ignored anyway.
const MAX_DATAGRAM: usize = 4096;

/// Control socket errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind control socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Server side of the control socket.
///
/// The socket file is removed when the server is dropped.
pub struct ControlServer {
    socket: Arc<UnixDatagram>,
    path: PathBuf,
    handler: ControlHandler,
}

impl ControlServer {
    /// Bind the control socket at `path`, replacing a stale socket file.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>, handler: ControlHandler) -> Result<Self, ServerError> {
        let path = path.as_ref().to_path_buf();
        let bind_err = |source| ServerError::Bind {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(bind_err)?;
        }
        if path.exists() {
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let socket = UnixDatagram::bind(&path).map_err(bind_err)?;
        // Only the owner may drive the patch panel.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .map_err(bind_err)?;

        info!(path = %path.display(), "Control socket listening");
        Ok(Self {
            socket: Arc::new(socket),
            path,
            handler,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve requests until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tokio::pin!(shutdown);

        loop {
            let (len, addr) = tokio::select! {
                _ = &mut shutdown => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "Failed to receive request");
                        continue;
                    }
                },
            };

            let Some(client) = addr.as_pathname().map(Path::to_path_buf) else {
                warn!(len, "Request from unbound client, cannot reply");
                continue;
            };

            let datagram = buf[..len].to_vec();
            let handler = self.handler.clone();
            let socket = Arc::clone(&self.socket);
            tokio::spawn(async move {
                let reply =
                    match tokio::task::spawn_blocking(move || handler.handle_datagram(&datagram))
                        .await
                    {
                        Ok(reply) => reply,
                        Err(e) => {
                            error!(error = %e, "Request handler failed");
                            return;
                        }
                    };
                if let Err(e) = socket.send_to(&reply, &client).await {
                    warn!(client = %client.display(), error = %e, "Failed to send reply");
                }
            });
        }

        debug!(path = %self.path.display(), "Control socket stopped");
        Ok(())
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
