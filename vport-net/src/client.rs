//! Control socket client.
//!
//! A datagram reply is addressed to the sender's bound path, so the client
//! binds a private socket in the temp directory and removes it again on drop.
//! One request is in flight at a time.

use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, recv};
use thiserror::Error;
use tokio::net::UnixDatagram;
use tracing::debug;

use crate::port::NameError;
use crate::protocol::{Action, DecodeError, REPLY_LEN, Reply, Request, check_name};

/// Default time to wait for a reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid port name {name:?}: {source}")]
    InvalidName {
        name: String,
        #[source]
        source: NameError,
    },

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Malformed reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Client side of the control socket.
pub struct ControlClient {
    socket: UnixDatagram,
    local_path: PathBuf,
    server: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    /// Bind a private reply socket and target the server at `server`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(server: impl AsRef<Path>, timeout: Duration) -> Result<Self, ClientError> {
        let local_path = std::env::temp_dir().join(format!(
            "vport-client-{}-{}.sock",
            std::process::id(),
            CLIENT_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        if local_path.exists() {
            std::fs::remove_file(&local_path)?;
        }
        let socket = UnixDatagram::bind(&local_path)?;
        debug!(path = %local_path.display(), "Client socket bound");

        Ok(Self {
            socket,
            local_path,
            server: server.as_ref().to_path_buf(),
            timeout,
        })
    }

    pub async fn add(&mut self, name: &str) -> Result<Reply, ClientError> {
        self.request(&checked(Action::Add, name, "")?).await
    }

    pub async fn remove(&mut self, name: &str) -> Result<Reply, ClientError> {
        self.request(&checked(Action::Remove, name, "")?).await
    }

    pub async fn connect_ports(&mut self, a: &str, b: &str) -> Result<Reply, ClientError> {
        self.request(&checked(Action::Connect, a, b)?).await
    }

    pub async fn disconnect(&mut self, name: &str) -> Result<Reply, ClientError> {
        self.request(&checked(Action::Disconnect, name, "")?).await
    }

    pub async fn dump(&mut self, name: &str) -> Result<Reply, ClientError> {
        self.request(&checked(Action::Dump, name, "")?).await
    }

    /// Send one request and wait for its reply.
    pub async fn request(&mut self, request: &Request) -> Result<Reply, ClientError> {
        let datagram = request.encode().map_err(|source| ClientError::InvalidName {
            name: request.ports.join(","),
            source,
        })?;
        self.send_raw(&datagram).await
    }

    /// Send an arbitrary datagram and wait for a reply.
    pub async fn send_raw(&mut self, datagram: &[u8]) -> Result<Reply, ClientError> {
        let mut buf = [0u8; REPLY_LEN * 2];
        self.discard_stale(&mut buf)?;
        self.socket.send_to(datagram, &self.server).await?;

        let len = tokio::time::timeout(self.timeout, self.socket.recv(&mut buf))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        Ok(Reply::decode(&buf[..len])?)
    }

    /// Drop replies that arrived after their request timed out.
    ///
    /// Replies carry no request id, a late one would otherwise be taken as the
    /// answer to the next request.
    fn discard_stale(&self, buf: &mut [u8]) -> Result<(), ClientError> {
        loop {
            // Straight to the socket: tokio only tries a read once its
            // reactor has seen the socket become readable.
            match recv(self.socket.as_raw_fd(), buf, MsgFlags::MSG_DONTWAIT) {
                Ok(len) => debug!(len, "Discarded stale reply"),
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            }
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local_path);
    }
}

/// Reject a name that does not fit its wire field.
pub fn validate_name(name: &str) -> Result<(), ClientError> {
    check_name(name).map_err(|source| ClientError::InvalidName {
        name: name.to_string(),
        source,
    })
}

fn checked(action: Action, first: &str, second: &str) -> Result<Request, ClientError> {
    validate_name(first)?;
    validate_name(second)?;
    Ok(Request::new(action, first, second))
}
