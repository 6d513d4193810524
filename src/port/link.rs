//! Handle through which a transport drives its port.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use tokio_util::sync::CancellationToken;

use super::{Port, Session};
use crate::{
    connection::Connection,
    endpoint::{Endpoint, LinkWriter},
    error::{LinkError, TransportError},
};

/// Capability handed to [`super::PortTransport::open`] for one session.
///
/// Every operation becomes a no-op once the session ends (the port was
/// disabled, disposed, or re-enabled), so transports never need to know
/// about the port lifecycle.
#[derive(Clone)]
pub struct PortLink {
    port: Weak<Port>,
    session: Arc<Session>,
}

impl PortLink {
    pub(super) fn new(port: Weak<Port>, session: Arc<Session>) -> Self { Self { port, session } }

    /// Token cancelled when the session ends.
    #[must_use]
    pub fn session(&self) -> &CancellationToken { &self.session.token }

    /// Returns true while the session is current.
    #[must_use]
    pub fn is_active(&self) -> bool { !self.session.token.is_cancelled() }

    /// Identifier of the owning port, if it still exists.
    #[must_use]
    pub fn port_id(&self) -> Option<String> { self.port.upgrade().map(|port| port.id().to_owned()) }

    /// Create an endpoint for `peer` and attach it to the port.
    ///
    /// Returns `None` if the session already ended.
    pub fn attach(&self, peer: &str, writer: Arc<dyn LinkWriter>) -> Option<Arc<Endpoint>> {
        let port = self.port.upgrade()?;
        if !self.is_active() {
            return None;
        }
        let endpoint = port.build_endpoint(peer, writer, &self.session.token);
        if !port.attach_endpoint(Arc::clone(&endpoint)) {
            return None;
        }
        // The session may have ended between the check and the swap.
        if !self.is_active() {
            port.detach_endpoint(endpoint.id());
            return None;
        }
        Some(endpoint)
    }

    /// Remove `endpoint` from the port.
    pub fn detach(&self, endpoint: &Endpoint) {
        if let Some(port) = self.port.upgrade() {
            port.detach_endpoint(endpoint.id());
        }
    }

    /// Feed bytes read for `endpoint` and deliver what it decodes.
    pub async fn receive(&self, endpoint: &Endpoint, bytes: &[u8]) {
        let Some(port) = self.port.upgrade() else {
            return;
        };
        let received = endpoint.receive(bytes).await;
        for error in received.errors {
            port.publish_error(&Arc::new(LinkError::new(endpoint.id(), error)));
        }
        for message in received.messages {
            port.deliver(message).await;
        }
    }

    /// Report that the link failed after `open` returned.
    ///
    /// Moves the port to `Error` and arms the reconnect timer, unless the
    /// session has already ended.
    pub fn fail(&self, error: TransportError) {
        if let Some(port) = self.port.upgrade() {
            port.fail_session(self.session.id, error);
        }
    }

    /// Run `task` on the port's task tracker.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(port) = self.port.upgrade() {
            port.spawn(task);
        }
    }
}

impl fmt::Debug for PortLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortLink")
            .field("session", &self.session.id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
