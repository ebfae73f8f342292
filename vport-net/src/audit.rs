//! Topology audit logging
//!
//! Records every change to the set of ports and links as a structured event on
//! the `vport::audit` target, so that operators can filter topology history
//! independently of the daemon's diagnostic output. Logging never fails and
//! never blocks the caller.

use std::sync::Arc;

use tracing::info;

use crate::port::PortName;

/// Audit logger with topology-specific methods.
pub struct AuditLogger {
    enabled: bool,
}

impl AuditLogger {
    /// Create an audit logger that emits events
    pub fn new() -> Self {
        Self { enabled: true }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self { enabled: false }
    }

    // === Port Events ===

    pub fn port_added(&self, name: &PortName) {
        if self.enabled {
            info!(target: "vport::audit", port = %name, "Port added");
        }
    }

    pub fn port_removed(&self, name: &PortName) {
        if self.enabled {
            info!(target: "vport::audit", port = %name, "Port removed");
        }
    }

    // === Link Events ===

    pub fn link_up(&self, a: &PortName, b: &PortName) {
        if self.enabled {
            info!(target: "vport::audit", port = %a, peer = %b, "Link up");
        }
    }

    pub fn link_down(&self, a: &PortName, b: &PortName) {
        if self.enabled {
            info!(target: "vport::audit", port = %a, peer = %b, "Link down");
        }
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a shared audit logger
pub fn create_audit_logger() -> Arc<AuditLogger> {
    Arc::new(AuditLogger::new())
}
