//! Forwarding engine.
//!
//! Frames transmitted on a port are handed to the engine, which reads the
//! port's current peer from the registry's link table and moves the frame into
//! the peer's receive path. The peer lookup is lock-free; delivery holds the
//! peer's lock for reading, which keeps the peer from being unlinked or
//! unregistered while the frame is injected.
//!
//! Hosting environments do not call the engine directly. They submit
//! [`Transmit`]s over a bounded channel that a pool of forwarding workers
//! drains, the same way reactors exchange packets over crossbeam channels.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use tracing::{debug, info, trace};

use crate::port::PortId;
use crate::registry::PortRegistry;

/// Capacity of the transmit channel between hosts and workers.
pub const TRANSMIT_QUEUE_SIZE: usize = 1024;

/// An Ethernet frame, moved unmodified from port to peer.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn new(data: Vec<u8>) -> Self {
        Frame(data)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Frame {
    fn from(data: Vec<u8>) -> Self {
        Frame(data)
    }
}

impl From<&[u8]> for Frame {
    fn from(data: &[u8]) -> Self {
        Frame(data.to_vec())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({} bytes)", self.0.len())
    }
}

/// A frame sent on a port, on its way to the engine.
#[derive(Debug)]
pub struct Transmit {
    pub port: PortId,
    pub frame: Frame,
}

/// Sender half used by hosting environments to submit frames.
pub type TransmitSender = Sender<Transmit>;

/// Receiver half drained by the forwarding workers.
pub type TransmitReceiver = Receiver<Transmit>;

/// Create the transmit channel.
pub fn transmit_channel() -> (TransmitSender, TransmitReceiver) {
    bounded(TRANSMIT_QUEUE_SIZE)
}

/// Why a frame was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The sending port has no peer
    NoPeer,
    /// The peer went away before delivery
    PeerGone,
    /// The peer's device refused the frame
    DeliveryFailed,
}

/// Outcome of forwarding one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Forwarded(PortId),
    Dropped(DropReason),
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub forwarded: u64,
    pub dropped: u64,
}

/// Per-frame fast path.
pub struct ForwardingEngine {
    registry: Arc<PortRegistry>,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl ForwardingEngine {
    pub fn new(registry: Arc<PortRegistry>) -> Self {
        Self {
            registry,
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Forward a frame sent on `port` to its current peer.
    ///
    /// Drops are counted, never reported as errors.
    pub fn transmit(&self, port: PortId, frame: Frame) -> Disposition {
        let disposition = self.forward(port, frame);
        match disposition {
            Disposition::Forwarded(peer) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                trace!(port = %port, peer = %peer, "Frame forwarded");
            }
            Disposition::Dropped(reason) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(port = %port, ?reason, "Frame dropped");
            }
        }
        disposition
    }

    fn forward(&self, port: PortId, frame: Frame) -> Disposition {
        let Some(peer_id) = self.registry.peer_of(port) else {
            return Disposition::Dropped(DropReason::NoPeer);
        };
        let Some(peer) = self.registry.get(peer_id) else {
            return Disposition::Dropped(DropReason::PeerGone);
        };

        let state = peer.read();
        // Unlinking needs the peer's write lock, so the link either still
        // holds for the whole delivery or was already gone.
        if self.registry.peer_of(peer_id) != Some(port) {
            return Disposition::Dropped(DropReason::NoPeer);
        }
        let Some(device) = state.device() else {
            return Disposition::Dropped(DropReason::PeerGone);
        };
        match device.deliver(frame) {
            Ok(()) => Disposition::Forwarded(peer_id),
            Err(e) => {
                debug!(port = %peer.name(), error = %e, "Delivery failed");
                Disposition::Dropped(DropReason::DeliveryFailed)
            }
        }
    }

    pub fn stats(&self) -> ForwardStats {
        ForwardStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Start `count` worker threads draining `rx`.
    pub fn spawn_workers(
        self: &Arc<Self>,
        rx: TransmitReceiver,
        count: usize,
    ) -> io::Result<ForwardingWorkers> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut threads = Vec::with_capacity(count);

        for index in 0..count.max(1) {
            let engine = Arc::clone(self);
            let rx = rx.clone();
            let shutdown = shutdown_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("vport-fwd-{index}"))
                .spawn(move || engine.run_worker(rx, shutdown))?;
            threads.push(handle);
        }

        info!(workers = threads.len(), "Forwarding workers started");
        Ok(ForwardingWorkers {
            shutdown: Some(shutdown_tx),
            threads,
        })
    }

    fn run_worker(&self, rx: TransmitReceiver, shutdown: Receiver<()>) {
        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(Transmit { port, frame }) => {
                        self.transmit(port, frame);
                    }
                    // every host is gone
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
        debug!("Forwarding worker stopped");
    }
}

/// Handle to the running forwarding workers. Stops and joins them on drop.
pub struct ForwardingWorkers {
    shutdown: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl ForwardingWorkers {
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Signal all workers to stop and wait for them.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel, waking every worker.
        self.shutdown.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ForwardingWorkers {
    fn drop(&mut self) {
        self.stop();
    }
}
