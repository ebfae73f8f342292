//! Control request dispatch.
//!
//! One request in, one reply out. The handler keeps no state between requests;
//! every data-model failure becomes a result code in the reply.

use tracing::{debug, warn};

use crate::link::LinkManager;
use crate::protocol::{Action, REPLY_LEN, Reply, Request, ResultCode};

/// Dispatches decoded requests to the registry and link manager.
#[derive(Clone)]
pub struct ControlHandler {
    links: LinkManager,
}

impl ControlHandler {
    pub fn new(links: LinkManager) -> Self {
        Self { links }
    }

    pub fn links(&self) -> &LinkManager {
        &self.links
    }

    /// Execute one request.
    pub fn handle(&self, request: &Request) -> Reply {
        let [first, second] = &request.ports;
        let registry = self.links.registry();

        let result = match request.action {
            Action::Add => registry.add(first).map(|_| Reply::ok()),
            Action::Remove => registry.remove(first).map(|()| Reply::ok()),
            Action::Connect => self.links.connect(first, second).map(|()| Reply::ok()),
            Action::Disconnect => self.links.disconnect(first).map(|()| Reply::ok()),
            Action::Dump => self
                .links
                .dump(first)
                .map(|peer| Reply::ok_with_peer(peer.as_ref())),
        };

        match result {
            Ok(reply) => {
                debug!(action = %request.action, port = %first, "Request succeeded");
                reply
            }
            Err(e) => {
                debug!(action = %request.action, port = %first, error = %e, "Request failed");
                Reply::error(&e)
            }
        }
    }

    /// Decode, execute and encode. Anything undecodable is answered with
    /// `UnknownAction`.
    pub fn handle_datagram(&self, datagram: &[u8]) -> [u8; REPLY_LEN] {
        let reply = match Request::decode(datagram) {
            Ok(request) => self.handle(&request),
            Err(e) => {
                warn!(error = %e, len = datagram.len(), "Rejecting malformed request");
                Reply::with_code(ResultCode::UnknownAction)
            }
        };
        reply.encode()
    }
}
