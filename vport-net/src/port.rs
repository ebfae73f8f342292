//! Port identity and per-port state.
//!
//! A port is identified by its name on the wire and by a [`PortId`] inside the
//! daemon. Peer associations always refer to ports by id so that every access
//! goes back through the registry and can observe whether the port is still
//! alive.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::host::HostDevice;

/// Size of a name buffer on the wire, including the terminating NUL (IFNAMSIZ).
pub const NAME_SIZE: usize = 16;

/// Longest usable port name.
pub const MAX_NAME_LEN: usize = NAME_SIZE - 1;

/// Reasons a string is not a usable port name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("Port name is empty")]
    Empty,

    #[error("Port name is {0} bytes long (max {MAX_NAME_LEN})")]
    TooLong(usize),

    #[error("Port name contains invalid character {0:?}")]
    InvalidChar(char),
}

/// A validated port name.
///
/// Follows the kernel's rules for interface names: 1 to 15 printable ASCII
/// bytes, no `/`, `:` or whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortName(String);

impl PortName {
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong(name.len()));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_graphic() || matches!(c, '/' | ':'))
        {
            return Err(NameError::InvalidChar(c));
        }
        Ok(PortName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// NUL-padded wire representation.
    pub fn to_bytes(&self) -> [u8; NAME_SIZE] {
        let mut buf = [0u8; NAME_SIZE];
        buf[..self.0.len()].copy_from_slice(self.0.as_bytes());
        buf
    }
}

impl FromStr for PortName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PortName::new(s)
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PortName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PortName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Registry-internal identifier of a port.
///
/// Ids are never reused, so a stale id can only ever miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u64);

impl PortId {
    pub fn new(raw: u64) -> Self {
        PortId(raw)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port({})", self.0)
    }
}

/// Monotonic source of port ids.
#[derive(Debug, Default)]
pub(crate) struct PortIdAllocator(AtomicU64);

impl PortIdAllocator {
    pub(crate) fn next(&self) -> PortId {
        PortId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Whether the hosting environment currently knows about a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Unregistered,
    Registered,
}

/// Mutable part of a port, guarded by the port lock.
pub struct PortState {
    registration: Registration,
    device: Option<Arc<dyn HostDevice>>,
}

impl PortState {
    pub fn registration(&self) -> Registration {
        self.registration
    }

    pub fn is_registered(&self) -> bool {
        self.registration == Registration::Registered
    }

    /// The host device, present only while registered.
    pub fn device(&self) -> Option<&Arc<dyn HostDevice>> {
        match self.registration {
            Registration::Registered => self.device.as_ref(),
            Registration::Unregistered => None,
        }
    }

    pub(crate) fn register(&mut self, device: Arc<dyn HostDevice>) {
        self.device = Some(device);
        self.registration = Registration::Registered;
    }

    pub(crate) fn unregister(&mut self) -> Option<Arc<dyn HostDevice>> {
        self.registration = Registration::Unregistered;
        self.device.take()
    }
}

/// A virtual port.
///
/// The lock in a port is the per-port lock: topology changes take it for
/// writing (in id order when two ports are involved), the forwarding path takes
/// it for reading while it delivers into the port.
pub struct Port {
    id: PortId,
    name: PortName,
    state: RwLock<PortState>,
}

impl Port {
    pub(crate) fn new(id: PortId, name: PortName) -> Self {
        Port {
            id,
            name,
            state: RwLock::new(PortState {
                registration: Registration::Unregistered,
                device: None,
            }),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn name(&self) -> &PortName {
        &self.name
    }

    pub fn is_registered(&self) -> bool {
        self.read().is_registered()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PortState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, PortState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("registration", &self.read().registration)
            .finish()
    }
}

/// Shared handle to a live port.
pub type PortHandle = Arc<Port>;

/// Write-lock two distinct ports in id order.
///
/// Guards are returned in argument order.
pub(crate) fn lock_pair<'a>(
    a: &'a Port,
    b: &'a Port,
) -> (
    RwLockWriteGuard<'a, PortState>,
    RwLockWriteGuard<'a, PortState>,
) {
    debug_assert_ne!(a.id, b.id);
    if a.id < b.id {
        let first = a.write();
        let second = b.write();
        (first, second)
    } else {
        let second = b.write();
        let first = a.write();
        (first, second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_name_valid() {
        let name = PortName::new("veth0").unwrap();
        assert_eq!(name.as_str(), "veth0");
        assert_eq!(name.to_string(), "veth0");

        // 15 bytes is the limit
        assert!(PortName::new("abcdefghijklmno").is_ok());
    }

    #[test]
    fn test_port_name_invalid() {
        assert_eq!(PortName::new(""), Err(NameError::Empty));
        assert_eq!(
            PortName::new("abcdefghijklmnop"),
            Err(NameError::TooLong(16))
        );
        assert_eq!(PortName::new("a/b"), Err(NameError::InvalidChar('/')));
        assert_eq!(PortName::new("a:b"), Err(NameError::InvalidChar(':')));
        assert_eq!(PortName::new("a b"), Err(NameError::InvalidChar(' ')));
        assert!(PortName::new("pört").is_err());
    }

    #[test]
    fn test_port_name_wire_bytes() {
        let bytes = PortName::new("tap1").unwrap().to_bytes();
        assert_eq!(&bytes[..4], b"tap1");
        assert!(bytes[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_port_id_allocator_unique() {
        let ids = PortIdAllocator::default();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_lock_pair_any_order() {
        let ids = PortIdAllocator::default();
        let a = Port::new(ids.next(), PortName::new("a").unwrap());
        let b = Port::new(ids.next(), PortName::new("b").unwrap());

        {
            let (ga, gb) = lock_pair(&a, &b);
            assert!(!ga.is_registered());
            assert!(!gb.is_registered());
        }
        // reversed argument order must not deadlock against itself
        let (gb, ga) = lock_pair(&b, &a);
        assert_eq!(gb.registration(), Registration::Unregistered);
        assert_eq!(ga.registration(), Registration::Unregistered);
    }
}
