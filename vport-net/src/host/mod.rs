//! Hosting environment for virtual ports.
//!
//! The hosting environment turns a port into something the rest of the system
//! can see: it registers a device for the port, raises and lowers its carrier,
//! and injects frames into its receive path. Frames leaving a port travel the
//! other way, from the host into the [`ForwardingEngine`](crate::forward::ForwardingEngine)
//! via a [`TransmitSender`](crate::forward::TransmitSender).
//!
//! Backends:
//! - `TapHost`: one Linux TAP interface per port
//! - `LoopbackHost`: in-process devices, no privileges required

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::forward::Frame;
use crate::port::{NameError, PortId, PortName};

pub mod loopback;
pub mod tap;

pub use loopback::{LoopbackDevice, LoopbackHost};
pub use tap::{TapDevice, TapHost};

/// Hosting environment errors.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Invalid interface name: {0}")]
    InvalidName(#[from] NameError),

    #[error("Interface name already in use: {0}")]
    NameInUse(String),

    #[error("Registration refused for {0}")]
    Refused(String),

    #[error("Device is not registered: {0}")]
    NotRegistered(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;

/// Creates devices for new ports.
pub trait HostEnvironment: Send + Sync {
    /// Register a device for a port.
    ///
    /// The returned device starts with its carrier down.
    fn register(&self, id: PortId, name: &PortName) -> Result<Arc<dyn HostDevice>>;
}

/// A registered device backing one port.
pub trait HostDevice: Send + Sync {
    /// Raise or lower the carrier.
    fn set_carrier(&self, up: bool) -> Result<()>;

    /// Inject a frame into the device's receive path.
    ///
    /// Takes ownership of the frame.
    fn deliver(&self, frame: Frame) -> Result<()>;

    /// Tear the device down. The device delivers nothing afterwards.
    fn unregister(&self) -> Result<()>;
}
