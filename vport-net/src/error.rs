//! Error types for port and link operations.

use thiserror::Error;

use crate::host::HostError;

/// Failures of registry and link manager operations.
///
/// Every variant corresponds to exactly one result code on the wire, see
/// [`crate::protocol::ResultCode`].
#[derive(Debug, Error)]
pub enum PortError {
    #[error("Port already exists: {0}")]
    AlreadyExists(String),

    #[error("Cannot register port {name}: {source}")]
    CannotRegister {
        name: String,
        #[source]
        source: HostError,
    },

    #[error("No such port: {0}")]
    NoSuchDevice(String),

    #[error("Port is busy: {0}")]
    DeviceBusy(String),

    #[error("Out of memory allocating port {0}")]
    NoMemory(String),
}

pub type Result<T> = std::result::Result<T, PortError>;
