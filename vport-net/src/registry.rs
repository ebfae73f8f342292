//! Port registry.
//!
//! Owns the set of live ports and the storage for the peer relation. The name
//! index is only touched by the control plane. The id index and the link table
//! are published through `ArcSwap` so the forwarding path can resolve a peer
//! without taking any lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::error::{PortError, Result};
use crate::host::{HostEnvironment, HostError};
use crate::port::{Port, PortHandle, PortId, PortIdAllocator, PortName};

/// Default upper bound on the number of ports.
pub const DEFAULT_MAX_PORTS: usize = 256;

/// Snapshot of the peer relation: every linked port maps to its peer.
pub type LinkTable = HashMap<PortId, PortId>;

/// Central registry for all ports.
pub struct PortRegistry {
    /// Hosting environment that backs ports with devices
    host: Arc<dyn HostEnvironment>,
    /// Ports by name, including ports still being registered
    names: RwLock<HashMap<PortName, PortHandle>>,
    /// Registered ports by id (lock-free reads via ArcSwap)
    ports: ArcSwap<HashMap<PortId, PortHandle>>,
    /// Peer relation (lock-free reads via ArcSwap)
    links: ArcSwap<LinkTable>,
    ids: PortIdAllocator,
    max_ports: usize,
    audit: Arc<AuditLogger>,
}

impl PortRegistry {
    /// Create an empty registry backed by `host`.
    pub fn new(host: Arc<dyn HostEnvironment>, max_ports: usize, audit: Arc<AuditLogger>) -> Self {
        PortRegistry {
            host,
            names: RwLock::new(HashMap::new()),
            ports: ArcSwap::from_pointee(HashMap::new()),
            links: ArcSwap::from_pointee(HashMap::new()),
            ids: PortIdAllocator::default(),
            max_ports,
            audit,
        }
    }

    /// Create a new port and register it with the hosting environment.
    ///
    /// The name is reserved before registration starts, so two concurrent adds
    /// of the same name cannot both succeed. The reservation is released again
    /// if registration fails.
    pub fn add(&self, name: &str) -> Result<PortId> {
        let name = PortName::new(name).map_err(|e| PortError::CannotRegister {
            name: name.to_string(),
            source: HostError::InvalidName(e),
        })?;

        let port = {
            let mut names = self.names_write();
            if names.contains_key(name.as_str()) {
                return Err(PortError::AlreadyExists(name.to_string()));
            }
            if names.len() >= self.max_ports || names.try_reserve(1).is_err() {
                warn!(port = %name, max_ports = self.max_ports, "Port limit reached");
                return Err(PortError::NoMemory(name.to_string()));
            }
            let port = Arc::new(Port::new(self.ids.next(), name.clone()));
            names.insert(name.clone(), Arc::clone(&port));
            port
        };

        let id = port.id();
        let device = match self.host.register(id, &name) {
            Ok(device) => device,
            Err(e) => {
                self.names_write().remove(name.as_str());
                warn!(port = %name, error = %e, "Failed to register port");
                return Err(PortError::CannotRegister {
                    name: name.to_string(),
                    source: e,
                });
            }
        };

        {
            // Publish under the port lock: nobody can act on the port before
            // it is both registered and resolvable by id.
            let mut state = port.write();
            state.register(device);
            self.ports.rcu(|current| {
                let mut next = HashMap::clone(current);
                next.insert(id, Arc::clone(&port));
                next
            });
        }

        info!(port = %name, id = %id, "Port added");
        self.audit.port_added(&name);
        Ok(id)
    }

    /// Unregister a port and release it.
    ///
    /// Refused with `DeviceBusy` while the port has a peer.
    pub fn remove(&self, name: &str) -> Result<()> {
        let port = self
            .lookup(name)
            .ok_or_else(|| PortError::NoSuchDevice(name.to_string()))?;
        let id = port.id();

        let device = {
            // Taking the write lock waits out every delivery into this port.
            let mut state = port.write();
            if !state.is_registered() {
                return Err(PortError::NoSuchDevice(name.to_string()));
            }
            if self.peer_of(id).is_some() {
                return Err(PortError::DeviceBusy(name.to_string()));
            }

            let device = state.unregister();
            self.ports.rcu(|current| {
                let mut next = HashMap::clone(current);
                next.remove(&id);
                next
            });
            device
        };

        // Device teardown can block (a TAP pump is joined), keep it outside
        // the port lock. Nothing reaches the device once it left the state.
        // The name stays reserved until the device is gone.
        if let Some(device) = device
            && let Err(e) = device.unregister()
        {
            warn!(port = %name, error = %e, "Failed to tear down device");
        }
        self.names_write().remove(name);

        info!(port = %name, id = %id, "Port removed");
        self.audit.port_removed(port.name());
        Ok(())
    }

    /// Find a registered port by name.
    pub fn lookup(&self, name: &str) -> Option<PortHandle> {
        // Port locks rank before the names lock, release it before checking.
        let port = self.names_read().get(name).cloned()?;
        port.is_registered().then_some(port)
    }

    /// Find a registered port by id without taking any lock.
    pub fn get(&self, id: PortId) -> Option<PortHandle> {
        self.ports.load().get(&id).cloned()
    }

    /// Current peer of a port.
    pub fn peer_of(&self, id: PortId) -> Option<PortId> {
        self.links.load().get(&id).copied()
    }

    /// Consistent snapshot of the whole peer relation.
    pub fn link_snapshot(&self) -> Arc<LinkTable> {
        self.links.load_full()
    }

    /// Names of all registered ports, sorted.
    pub fn names(&self) -> Vec<PortName> {
        let ports: Vec<PortHandle> = self.ports.load().values().cloned().collect();
        let mut names: Vec<PortName> = ports
            .iter()
            .filter(|port| port.is_registered())
            .map(|port| port.name().clone())
            .collect();
        names.sort();
        names
    }

    /// Number of registered ports.
    pub fn len(&self) -> usize {
        self.ports.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Publish a link between two ports.
    ///
    /// Caller holds both port locks and has checked that neither has a peer.
    /// Both directions become visible in the same store.
    pub(crate) fn link(&self, a: PortId, b: PortId) {
        self.links.rcu(|current| {
            let mut next = LinkTable::clone(current);
            next.insert(a, b);
            next.insert(b, a);
            next
        });
        debug!(a = %a, b = %b, "Link published");
    }

    /// Retract the link between two ports.
    ///
    /// Caller holds both port locks.
    pub(crate) fn unlink(&self, a: PortId, b: PortId) {
        self.links.rcu(|current| {
            let mut next = LinkTable::clone(current);
            next.remove(&a);
            next.remove(&b);
            next
        });
        debug!(a = %a, b = %b, "Link retracted");
    }

    fn names_read(&self) -> RwLockReadGuard<'_, HashMap<PortName, PortHandle>> {
        self.names.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn names_write(&self) -> RwLockWriteGuard<'_, HashMap<PortName, PortHandle>> {
        self.names.write().unwrap_or_else(PoisonError::into_inner)
    }
}
