//! Virtual patch-panel for network interfaces.
//!
//! Named ports are created in a hosting environment, paired two at a time, and
//! every frame sent on a paired port is delivered unchanged to its peer. The
//! topology is driven over a Unix datagram control socket.

pub mod audit;
pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod handler;
pub mod host;
pub mod link;
pub mod port;
pub mod protocol;
pub mod registry;
pub mod server;

pub use error::{PortError, Result};
pub use forward::{ForwardingEngine, Frame};
pub use handler::ControlHandler;
pub use link::LinkManager;
pub use port::{PortId, PortName};
pub use registry::PortRegistry;
