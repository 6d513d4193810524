//! The contract shared by endpoints, ports and routers.
//!
//! Every connection owns statistics, three event streams and a dispose
//! token. [`ConnectionCore`] bundles that state so each connection type only
//! implements its own send and receive paths.

use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tokio::{select, sync::broadcast};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ConnectionError, LinkError},
    message::MessageRef,
    statistics::Statistics,
};

/// Capacity of every per-connection event stream.
pub const EVENT_CAPACITY: usize = 1024;

/// Where in the connection tree a connection sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// One physical peer.
    Endpoint,
    /// A managed link owning endpoints.
    Port,
    /// The aggregate of every port.
    Router,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionKind::Endpoint => "endpoint",
            ConnectionKind::Port => "port",
            ConnectionKind::Router => "router",
        })
    }
}

/// A source and sink of protocol messages.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Identifier, unique among siblings.
    fn id(&self) -> &str;

    /// Position in the connection tree.
    fn kind(&self) -> ConnectionKind;

    /// Traffic counters, including every descendant's traffic.
    fn statistics(&self) -> &Arc<Statistics>;

    /// Run the outbound pipeline and transmit `message`.
    ///
    /// Returns `Ok(())` without sending when the connection is disposed or
    /// a feature drops the message.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Cancelled`] if `cancel` fires before the
    /// message was written, and other variants when encoding or the write
    /// fails.
    async fn send(&self, message: MessageRef, cancel: &CancellationToken) -> Result<(), ConnectionError>;

    /// Messages that passed the inbound pipeline.
    fn on_rx(&self) -> broadcast::Receiver<MessageRef>;

    /// Messages that passed the outbound pipeline.
    fn on_tx(&self) -> broadcast::Receiver<MessageRef>;

    /// Errors observed on this connection or its descendants.
    fn on_error(&self) -> broadcast::Receiver<Arc<LinkError>>;

    /// Returns true once the connection has been disposed.
    fn is_disposed(&self) -> bool;
}

/// State every connection carries.
pub(crate) struct ConnectionCore {
    pub(crate) id: Arc<str>,
    pub(crate) statistics: Arc<Statistics>,
    rx: broadcast::Sender<MessageRef>,
    tx: broadcast::Sender<MessageRef>,
    errors: broadcast::Sender<Arc<LinkError>>,
    dispose: CancellationToken,
    disposed: AtomicBool,
}

impl ConnectionCore {
    pub(crate) fn new(id: impl Into<Arc<str>>, statistics: Arc<Statistics>, dispose: CancellationToken) -> Self {
        Self {
            id: id.into(),
            statistics,
            rx: broadcast::channel(EVENT_CAPACITY).0,
            tx: broadcast::channel(EVENT_CAPACITY).0,
            errors: broadcast::channel(EVENT_CAPACITY).0,
            dispose,
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn dispose_token(&self) -> &CancellationToken { &self.dispose }

    /// Mark the connection disposed and cancel its token. Returns false if
    /// it already was.
    pub(crate) fn mark_disposed(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.dispose.cancel();
        true
    }

    pub(crate) fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }

    pub(crate) fn subscribe_rx(&self) -> broadcast::Receiver<MessageRef> { self.rx.subscribe() }

    pub(crate) fn subscribe_tx(&self) -> broadcast::Receiver<MessageRef> { self.tx.subscribe() }

    pub(crate) fn subscribe_errors(&self) -> broadcast::Receiver<Arc<LinkError>> { self.errors.subscribe() }

    // Sending fails only when nobody is subscribed.
    pub(crate) fn publish_rx(&self, message: &MessageRef) { let _ = self.rx.send(Arc::clone(message)); }

    pub(crate) fn publish_tx(&self, message: &MessageRef) { let _ = self.tx.send(Arc::clone(message)); }

    pub(crate) fn publish_error(&self, error: Arc<LinkError>) { let _ = self.errors.send(error); }

    /// Check the preconditions of a send.
    ///
    /// `Ok(false)` means the connection is disposed and the send is a
    /// silent no-op.
    pub(crate) fn begin_send(&self, cancel: &CancellationToken) -> Result<bool, ConnectionError> {
        if self.is_disposed() {
            return Ok(false);
        }
        if cancel.is_cancelled() {
            return Err(ConnectionError::Cancelled);
        }
        Ok(true)
    }

    /// Drive `fut` unless the connection is disposed or `cancel` fires.
    ///
    /// Disposal wins ties and resolves to `Ok(None)`.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub(crate) async fn guarded<F: Future>(
        &self,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<Option<F::Output>, ConnectionError> {
        select! {
            biased;

            () = self.dispose.cancelled() => Ok(None),
            () = cancel.cancelled() => Err(ConnectionError::Cancelled),
            out = fut => Ok(Some(out)),
        }
    }
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn core() -> ConnectionCore { ConnectionCore::new("c", Statistics::root(), CancellationToken::new()) }

    #[tokio::test]
    async fn caller_cancellation_surfaces_as_error() {
        let core = core();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(core.begin_send(&cancel), Err(ConnectionError::Cancelled)));
        let result = core.guarded(&cancel, std::future::pending::<()>()).await;
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
    }

    #[tokio::test]
    async fn disposal_resolves_pending_work_silently() {
        let core = Arc::new(core());
        let waiter = {
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                core.guarded(&CancellationToken::new(), std::future::pending::<()>())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(core.mark_disposed());
        assert!(!core.mark_disposed());
        let result = waiter.await.expect("join");
        assert!(matches!(result, Ok(None)));
        assert!(matches!(core.begin_send(&CancellationToken::new()), Ok(false)));
    }

    #[tokio::test]
    async fn completed_work_is_returned() {
        let core = core();
        let result = core.guarded(&CancellationToken::new(), async { 7 }).await;
        assert!(matches!(result, Ok(Some(7))));
    }
}
