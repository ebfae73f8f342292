//! In-process hosting environment.
//!
//! Devices live entirely in memory: carrier is a flag, delivered frames land in
//! a bounded inbox, and [`LoopbackDevice::send`] plays the part of a guest
//! transmitting a frame. Needs no privileges, which makes it the backend for
//! tests and for running the daemon unprivileged.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crossbeam_channel::TrySendError;
use tracing::debug;

use super::{HostDevice, HostEnvironment, HostError, Result};
use crate::forward::{Frame, Transmit, TransmitSender};
use crate::port::{PortId, PortName};

/// Default number of frames a device buffers before refusing delivery.
pub const DEFAULT_INBOX_CAPACITY: usize = 4096;

type DeviceMap = Mutex<HashMap<String, Arc<LoopbackDevice>>>;

/// Hosting environment backed by in-memory devices.
pub struct LoopbackHost {
    devices: Arc<DeviceMap>,
    refuse: AtomicBool,
    inbox_capacity: usize,
    transmit: Option<TransmitSender>,
}

impl LoopbackHost {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(Mutex::new(HashMap::new())),
            refuse: AtomicBool::new(false),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            transmit: None,
        }
    }

    /// Submit frames sent on devices to the forwarding engine.
    pub fn with_transmit(mut self, tx: TransmitSender) -> Self {
        self.transmit = Some(tx);
        self
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    /// Make every following registration fail until switched off again.
    pub fn refuse_registrations(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// A currently registered device.
    pub fn device(&self, name: &str) -> Option<Arc<LoopbackDevice>> {
        lock(&self.devices).get(name).cloned()
    }

    /// Number of currently registered devices.
    pub fn device_count(&self) -> usize {
        lock(&self.devices).len()
    }
}

impl Default for LoopbackHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostEnvironment for LoopbackHost {
    fn register(&self, id: PortId, name: &PortName) -> Result<Arc<dyn HostDevice>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(HostError::Refused(name.to_string()));
        }

        let mut devices = lock(&self.devices);
        if devices.contains_key(name.as_str()) {
            return Err(HostError::NameInUse(name.to_string()));
        }

        let device = Arc::new(LoopbackDevice {
            id,
            name: name.clone(),
            carrier: AtomicBool::new(false),
            registered: AtomicBool::new(true),
            inbox: Mutex::new(VecDeque::new()),
            inbox_capacity: self.inbox_capacity,
            transmit: self.transmit.clone(),
            devices: Arc::downgrade(&self.devices),
        });
        devices.insert(name.to_string(), Arc::clone(&device));

        debug!(port = %name, id = %id, "Loopback device registered");
        Ok(device)
    }
}

/// One in-memory device.
pub struct LoopbackDevice {
    id: PortId,
    name: PortName,
    carrier: AtomicBool,
    registered: AtomicBool,
    inbox: Mutex<VecDeque<Frame>>,
    inbox_capacity: usize,
    transmit: Option<TransmitSender>,
    /// The host's device map, which owns this device
    devices: Weak<DeviceMap>,
}

impl LoopbackDevice {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn name(&self) -> &PortName {
        &self.name
    }

    pub fn carrier(&self) -> bool {
        self.carrier.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Drain every frame delivered so far, oldest first.
    pub fn take_received(&self) -> Vec<Frame> {
        lock(&self.inbox).drain(..).collect()
    }

    pub fn received_count(&self) -> usize {
        lock(&self.inbox).len()
    }

    /// Transmit a frame on this device, as a guest would.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_registered() {
            return Err(HostError::NotRegistered(self.name.to_string()));
        }
        let Some(tx) = &self.transmit else {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        };
        tx.try_send(Transmit {
            port: self.id,
            frame,
        })
        .map_err(|e| match e {
            TrySendError::Full(_) => io::Error::from(io::ErrorKind::WouldBlock).into(),
            TrySendError::Disconnected(_) => {
                io::Error::from(io::ErrorKind::BrokenPipe).into()
            }
        })
    }
}

impl HostDevice for LoopbackDevice {
    fn set_carrier(&self, up: bool) -> Result<()> {
        if !self.is_registered() {
            return Err(HostError::NotRegistered(self.name.to_string()));
        }
        self.carrier.store(up, Ordering::SeqCst);
        Ok(())
    }

    fn deliver(&self, frame: Frame) -> Result<()> {
        if !self.is_registered() {
            return Err(HostError::NotRegistered(self.name.to_string()));
        }
        let mut inbox = lock(&self.inbox);
        if inbox.len() >= self.inbox_capacity {
            return Err(io::Error::from(io::ErrorKind::WouldBlock).into());
        }
        inbox.push_back(frame);
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return Err(HostError::NotRegistered(self.name.to_string()));
        }
        self.carrier.store(false, Ordering::SeqCst);
        if let Some(devices) = self.devices.upgrade() {
            lock(&devices).remove(self.name.as_str());
        }
        debug!(port = %self.name, "Loopback device unregistered");
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
