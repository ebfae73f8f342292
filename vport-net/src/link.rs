//! Link manager.
//!
//! Owns the pairing state machine. A link is two entries in the registry's
//! link table, written in a single store while both port locks are held, so
//! neither control operations nor the forwarding path ever see one direction
//! without the other.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{PortError, Result};
use crate::port::{PortName, PortState, lock_pair};
use crate::registry::PortRegistry;

/// Connects and disconnects ports.
#[derive(Clone)]
pub struct LinkManager {
    registry: Arc<PortRegistry>,
}

impl LinkManager {
    pub fn new(registry: Arc<PortRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    /// Pair two ports and raise carrier on both.
    pub fn connect(&self, name1: &str, name2: &str) -> Result<()> {
        let a = self
            .registry
            .lookup(name1)
            .ok_or_else(|| PortError::NoSuchDevice(name1.to_string()))?;
        let b = self
            .registry
            .lookup(name2)
            .ok_or_else(|| PortError::NoSuchDevice(name2.to_string()))?;

        if a.id() == b.id() {
            return Err(PortError::DeviceBusy(name1.to_string()));
        }

        {
            let (state_a, state_b) = lock_pair(&a, &b);

            // Either side may have been removed since the lookup.
            if !state_a.is_registered() {
                return Err(PortError::NoSuchDevice(name1.to_string()));
            }
            if !state_b.is_registered() {
                return Err(PortError::NoSuchDevice(name2.to_string()));
            }
            if self.registry.peer_of(a.id()).is_some() {
                return Err(PortError::DeviceBusy(name1.to_string()));
            }
            if self.registry.peer_of(b.id()).is_some() {
                return Err(PortError::DeviceBusy(name2.to_string()));
            }

            self.registry.link(a.id(), b.id());
            set_carrier(a.name(), &state_a, true);
            set_carrier(b.name(), &state_b, true);
        }

        info!(port = %a.name(), peer = %b.name(), "Ports connected");
        self.registry.audit().link_up(a.name(), b.name());
        Ok(())
    }

    /// Unpair a port from its peer and lower carrier on both.
    ///
    /// Succeeds without doing anything when the port has no peer.
    pub fn disconnect(&self, name: &str) -> Result<()> {
        let port = self
            .registry
            .lookup(name)
            .ok_or_else(|| PortError::NoSuchDevice(name.to_string()))?;

        loop {
            let Some(peer_id) = self.registry.peer_of(port.id()) else {
                // Still need the port to exist for the no-op to be meaningful.
                if !port.is_registered() {
                    return Err(PortError::NoSuchDevice(name.to_string()));
                }
                debug!(port = %name, "Port has no peer");
                return Ok(());
            };

            // A linked port cannot be removed, so the peer must be live.
            let Some(peer) = self.registry.get(peer_id) else {
                continue;
            };

            let (state, peer_state) = lock_pair(&port, &peer);
            if !state.is_registered() {
                return Err(PortError::NoSuchDevice(name.to_string()));
            }
            if self.registry.peer_of(port.id()) != Some(peer_id) {
                // Relinked between the read and the locks; try again.
                continue;
            }

            self.registry.unlink(port.id(), peer_id);
            set_carrier(port.name(), &state, false);
            set_carrier(peer.name(), &peer_state, false);
            drop((state, peer_state));

            info!(port = %port.name(), peer = %peer.name(), "Ports disconnected");
            self.registry.audit().link_down(port.name(), peer.name());
            return Ok(());
        }
    }

    /// Name of the port's peer, `None` when unpaired.
    pub fn dump(&self, name: &str) -> Result<Option<PortName>> {
        let port = self
            .registry
            .lookup(name)
            .ok_or_else(|| PortError::NoSuchDevice(name.to_string()))?;

        let state = port.read();
        if !state.is_registered() {
            return Err(PortError::NoSuchDevice(name.to_string()));
        }
        // The peer cannot be removed while linked, and relinking needs our
        // write lock, so the pair is stable here.
        let peer = self
            .registry
            .peer_of(port.id())
            .and_then(|id| self.registry.get(id))
            .map(|peer| peer.name().clone());
        Ok(peer)
    }

    /// Disconnect and remove every port.
    pub fn teardown(&self) {
        for name in self.registry.names() {
            if let Err(e) = self.disconnect(name.as_str()) {
                warn!(port = %name, error = %e, "Failed to disconnect port during teardown");
            }
            if let Err(e) = self.registry.remove(name.as_str()) {
                warn!(port = %name, error = %e, "Failed to remove port during teardown");
            }
        }
    }
}

fn set_carrier(name: &PortName, state: &PortState, up: bool) {
    if let Some(device) = state.device()
        && let Err(e) = device.set_carrier(up)
    {
        warn!(port = %name, up, error = %e, "Failed to set carrier");
    }
}
