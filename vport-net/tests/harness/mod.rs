//! Test harness for control socket integration tests
//!
//! Runs the real registry, link manager, forwarding workers and control server
//! on top of the in-memory hosting environment, in a private temp directory.

#![allow(dead_code)]

pub mod daemon;

use std::sync::Arc;

use vport_net::audit::AuditLogger;
use vport_net::host::{HostEnvironment, LoopbackHost};
use vport_net::registry::DEFAULT_MAX_PORTS;
use vport_net::{ForwardingEngine, LinkManager, PortRegistry};

/// Inbox capacity large enough that stress tests never fill it.
pub const LARGE_INBOX: usize = 1 << 20;

/// Registry, link manager and engine over a fresh loopback host, no socket.
pub fn create_stack() -> (Arc<LoopbackHost>, LinkManager, Arc<ForwardingEngine>) {
    let host = Arc::new(LoopbackHost::new().with_inbox_capacity(LARGE_INBOX));
    let registry = Arc::new(PortRegistry::new(
        Arc::clone(&host) as Arc<dyn HostEnvironment>,
        DEFAULT_MAX_PORTS,
        Arc::new(AuditLogger::new_noop()),
    ));
    let engine = Arc::new(ForwardingEngine::new(Arc::clone(&registry)));
    (host, LinkManager::new(registry), engine)
}
