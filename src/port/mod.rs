//! Managed links and their lifecycle.
//!
//! A [`Port`] owns zero or more [`Endpoint`]s and moves through
//! `Disabled -> Connecting -> Connected`, dropping to `Error` whenever its
//! transport fails and returning to `Connecting` when the reconnect timer
//! fires. `enable` and `disable` share one busy flag: a call made while the
//! other is in flight is logged and ignored.
//!
//! The endpoint set is an immutable snapshot swapped with compare-and-swap,
//! so a send always iterates one consistent set while peers come and go.

mod link;

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
pub use link::PortLink;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::{
    select,
    sync::{broadcast, watch},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::PortConfig,
    connection::{Connection, ConnectionCore, ConnectionKind, EVENT_CAPACITY},
    endpoint::{Endpoint, LinkWriter},
    error::{ConnectionError, LinkError, TransportError},
    feature::{FeatureContext, FeaturePipeline},
    message::MessageRef,
    metrics,
    parser::Protocols,
    statistics::Statistics,
    time::{TimeProvider, TokioTime},
};

/// Lifecycle state of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PortStatus {
    /// Not enabled; owns no endpoints.
    Disabled,
    /// The transport is opening.
    Connecting,
    /// The transport is open.
    Connected,
    /// The transport failed; a reconnect is pending.
    Error,
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortStatus::Disabled => "disabled",
            PortStatus::Connecting => "connecting",
            PortStatus::Connected => "connected",
            PortStatus::Error => "error",
        })
    }
}

/// Change notification published by a port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortEvent {
    /// The status moved from `from` to `to`.
    StatusChanged {
        /// Previous status.
        from: PortStatus,
        /// New status.
        to: PortStatus,
    },
    /// The enabled flag changed.
    EnabledChanged(bool),
    /// An endpoint joined the port.
    EndpointAdded(String),
    /// An endpoint left the port.
    EndpointRemoved(String),
}

/// Physical link behind a port.
///
/// `open` runs once per enable. It should return once the link is usable
/// (a client connected, a server listening) and hand long-running work such
/// as readers and accept loops to [`PortLink::spawn`]. Failures after `open`
/// returned are reported through [`PortLink::fail`].
#[async_trait]
pub trait PortTransport: Send + Sync + fmt::Debug {
    /// Open the link for one session.
    ///
    /// # Errors
    ///
    /// Any error moves the port to [`PortStatus::Error`] and arms the
    /// reconnect timer.
    async fn open(&self, link: PortLink) -> Result<(), TransportError>;

    /// Address the transport is bound to, once open.
    fn local_addr(&self) -> Option<SocketAddr> { None }
}

/// Receiver of traffic and state changes from a port, usually its router.
#[async_trait]
pub trait PortUpstream: Send + Sync {
    /// A message passed the port's receive pipeline.
    async fn port_received(&self, port: &Port, message: MessageRef);

    /// An error was published on the port.
    fn port_error(&self, port: &Port, error: &Arc<LinkError>);

    /// The port status changed.
    fn port_status_changed(&self, port: &Port, from: PortStatus, to: PortStatus);
}

/// Services a port is constructed with.
#[derive(Clone)]
pub struct PortContext {
    /// Features applied at port and endpoint scope.
    pub features: Arc<FeaturePipeline>,
    /// Protocols every endpoint parses.
    pub protocols: Protocols,
    /// Time source for the reconnect timer.
    pub time: Arc<dyn TimeProvider>,
    /// Statistics the port's own counters roll up into.
    pub parent_statistics: Option<Arc<Statistics>>,
    /// Receiver of inbound messages and events.
    pub upstream: Option<Weak<dyn PortUpstream>>,
}

impl PortContext {
    /// Context with no features, real time and no upstream.
    #[must_use]
    pub fn new(protocols: Protocols) -> Self {
        Self {
            features: Arc::new(FeaturePipeline::new()),
            protocols,
            time: Arc::new(TokioTime::new()),
            parent_statistics: None,
            upstream: None,
        }
    }

    /// Replace the feature pipeline.
    #[must_use]
    pub fn with_features(mut self, features: Arc<FeaturePipeline>) -> Self {
        self.features = features;
        self
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_time(mut self, time: Arc<dyn TimeProvider>) -> Self {
        self.time = time;
        self
    }
}

impl fmt::Debug for PortContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortContext")
            .field("features", &self.features)
            .field("protocols", &self.protocols)
            .field("time", &self.time)
            .field("has_upstream", &self.upstream.is_some())
            .finish_non_exhaustive()
    }
}

/// One opening of the transport.
pub(crate) struct Session {
    id: u64,
    token: CancellationToken,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) { self.0.store(false, Ordering::Release); }
}

/// A managed link owning endpoints.
pub struct Port {
    core: ConnectionCore,
    config: PortConfig,
    transport: Arc<dyn PortTransport>,
    context: PortContext,
    endpoints: ArcSwap<Vec<Arc<Endpoint>>>,
    status: watch::Sender<PortStatus>,
    enabled: watch::Sender<bool>,
    last_error: watch::Sender<Option<Arc<LinkError>>>,
    events: broadcast::Sender<PortEvent>,
    busy: AtomicBool,
    session: ArcSwapOption<Session>,
    sessions: AtomicU64,
    reconnect: ArcSwapOption<CancellationToken>,
    tracker: TaskTracker,
    this: Weak<Port>,
}

impl Port {
    /// Create a disabled port.
    #[must_use]
    pub fn new(config: PortConfig, transport: Arc<dyn PortTransport>, context: PortContext) -> Arc<Self> {
        let statistics = match &context.parent_statistics {
            Some(parent) => Statistics::child(parent),
            None => Statistics::root(),
        };
        Arc::new_cyclic(|this| Self {
            core: ConnectionCore::new(config.name.as_str(), statistics, CancellationToken::new()),
            config,
            transport,
            context,
            endpoints: ArcSwap::from_pointee(Vec::new()),
            status: watch::Sender::new(PortStatus::Disabled),
            enabled: watch::Sender::new(false),
            last_error: watch::Sender::new(None),
            events: broadcast::channel(EVENT_CAPACITY).0,
            busy: AtomicBool::new(false),
            session: ArcSwapOption::empty(),
            sessions: AtomicU64::new(0),
            reconnect: ArcSwapOption::empty(),
            tracker: TaskTracker::new(),
            this: this.clone(),
        })
    }

    /// Configuration the port was built from.
    #[must_use]
    pub fn config(&self) -> &PortConfig { &self.config }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PortStatus { *self.status.borrow() }

    /// Observe status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<PortStatus> { self.status.subscribe() }

    /// Returns true between `enable` and `disable`.
    #[must_use]
    pub fn is_enabled(&self) -> bool { *self.enabled.borrow() }

    /// Observe the enabled flag.
    #[must_use]
    pub fn watch_enabled(&self) -> watch::Receiver<bool> { self.enabled.subscribe() }

    /// Most recent transport failure.
    #[must_use]
    pub fn last_error(&self) -> Option<Arc<LinkError>> { self.last_error.borrow().clone() }

    /// Observe transport failures.
    #[must_use]
    pub fn watch_error(&self) -> watch::Receiver<Option<Arc<LinkError>>> { self.last_error.subscribe() }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<PortEvent> { self.events.subscribe() }

    /// Current endpoint snapshot.
    #[must_use]
    pub fn endpoints(&self) -> Arc<Vec<Arc<Endpoint>>> { self.endpoints.load_full() }

    /// Number of endpoints in the current snapshot.
    #[must_use]
    pub fn endpoint_count(&self) -> usize { self.endpoints.load().len() }

    /// Address the transport is bound to, if it reports one.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.transport.local_addr() }

    /// Features applied by this port and its endpoints.
    #[must_use]
    pub fn features(&self) -> &Arc<FeaturePipeline> { &self.context.features }

    fn upstream(&self) -> Option<Arc<dyn PortUpstream>> {
        self.context.upstream.as_ref().and_then(Weak::upgrade)
    }

    fn emit(&self, event: PortEvent) { let _ = self.events.send(event); }

    /// Open the transport.
    ///
    /// Ignored while another `enable` or `disable` is running, and after
    /// disposal. On failure the port enters [`PortStatus::Error`] and retries
    /// after the configured reconnect timeout for as long as it stays
    /// enabled.
    pub async fn enable(&self) { self.connect(None).await; }

    /// Open the transport, either for the user or for the reconnect timer
    /// identified by `retry`.
    ///
    /// A retry re-checks its token and the enabled flag once the busy flag is
    /// held, so a `disable` that completed after the timer fired wins.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    async fn connect(&self, retry: Option<&CancellationToken>) {
        if self.core.is_disposed() {
            return;
        }
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            info!("port enable ignored: port={}, reason=busy", self.id());
            return;
        };
        if let Some(token) = retry {
            if token.is_cancelled() || self.core.is_disposed() || !self.is_enabled() {
                debug!("port reconnect dropped: port={}, reason=disabled", self.id());
                return;
            }
            debug!("port reconnecting: port={}", self.id());
        }
        self.set_enabled(true);
        self.cancel_reconnect();
        self.end_session(None);
        self.transition(None, PortStatus::Connecting);

        let session = self.begin_session();
        let link = PortLink::new(self.this.clone(), Arc::clone(&session));
        let opened = select! {
            biased;

            () = session.token.cancelled() => return,
            result = self.transport.open(link) => result,
        };
        match opened {
            Ok(()) => {
                if self.transition(Some(PortStatus::Connecting), PortStatus::Connected) {
                    info!("port connected: port={}", self.id());
                }
            }
            Err(error) => self.fail_session(session.id, error),
        }
    }

    /// Close the transport, drop every endpoint and cancel a pending
    /// reconnect. Idempotent; ignored while `enable` is running.
    pub fn disable(&self) {
        if self.core.is_disposed() {
            return;
        }
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            info!("port disable ignored: port={}, reason=busy", self.id());
            return;
        };
        self.set_enabled(false);
        self.cancel_reconnect();
        self.end_session(None);
        self.clear_endpoints();
        if self.transition(None, PortStatus::Disabled) {
            info!("port disabled: port={}", self.id());
        }
    }

    /// Build an endpoint for `peer` without attaching it.
    #[must_use]
    pub fn create_endpoint(&self, peer: &str, writer: Arc<dyn LinkWriter>) -> Arc<Endpoint> {
        self.build_endpoint(peer, writer, self.core.dispose_token())
    }

    fn build_endpoint(&self, peer: &str, writer: Arc<dyn LinkWriter>, parent: &CancellationToken) -> Arc<Endpoint> {
        Endpoint::new(
            format!("{}/{peer}", self.id()),
            self.context.protocols.parser_set(),
            writer,
            Arc::clone(&self.context.features),
            Statistics::child(&self.core.statistics),
            parent.child_token(),
        )
    }

    /// Add `endpoint` to the set, replacing one with the same id.
    ///
    /// Returns false if the port is disposed.
    pub fn attach_endpoint(&self, endpoint: Arc<Endpoint>) -> bool {
        if self.core.is_disposed() {
            endpoint.dispose();
            return false;
        }
        let previous = self.endpoints.rcu(|current| {
            let mut next: Vec<_> = current
                .iter()
                .filter(|e| e.id() != endpoint.id())
                .cloned()
                .collect();
            next.push(Arc::clone(&endpoint));
            next
        });
        if let Some(replaced) = previous
            .iter()
            .find(|e| e.id() == endpoint.id() && !Arc::ptr_eq(e, &endpoint))
        {
            replaced.dispose();
        }
        debug!("endpoint attached: port={}, endpoint={}", self.id(), endpoint.id());
        self.emit(PortEvent::EndpointAdded(endpoint.id().to_owned()));
        if self.core.is_disposed() {
            self.detach_endpoint(endpoint.id());
            return false;
        }
        true
    }

    /// Remove and dispose the endpoint with `id`.
    pub fn detach_endpoint(&self, id: &str) -> Option<Arc<Endpoint>> {
        let previous = self
            .endpoints
            .rcu(|current| current.iter().filter(|e| e.id() != id).cloned().collect::<Vec<_>>());
        let removed = previous.iter().find(|e| e.id() == id).cloned()?;
        removed.dispose();
        debug!("endpoint detached: port={}, endpoint={id}", self.id());
        self.emit(PortEvent::EndpointRemoved(id.to_owned()));
        Some(removed)
    }

    fn clear_endpoints(&self) {
        let previous = self.endpoints.swap(Arc::new(Vec::new()));
        for endpoint in previous.iter() {
            endpoint.dispose();
            self.emit(PortEvent::EndpointRemoved(endpoint.id().to_owned()));
        }
    }

    /// Dispose the port: cancel every task and drop every endpoint.
    ///
    /// Idempotent, and safe to combine with [`Port::dispose_async`] in any
    /// order.
    pub fn dispose(&self) {
        if !self.core.mark_disposed() {
            return;
        }
        self.set_enabled(false);
        self.cancel_reconnect();
        self.session.store(None);
        self.clear_endpoints();
        self.transition(None, PortStatus::Disabled);
        self.tracker.close();
        info!("port disposed: port={}", self.id());
    }

    /// Dispose the port and wait for its tasks to finish.
    pub async fn dispose_async(&self) {
        self.dispose();
        self.tracker.wait().await;
    }

    fn set_enabled(&self, enabled: bool) {
        if self.enabled.send_if_modified(|current| std::mem::replace(current, enabled) != enabled) {
            self.emit(PortEvent::EnabledChanged(enabled));
        }
    }

    /// Move to `to`, optionally only from `expected`. Returns true if the
    /// status changed.
    fn transition(&self, expected: Option<PortStatus>, to: PortStatus) -> bool {
        self.transition_if(|current| expected.is_none_or(|expected| expected == current), to)
    }

    /// Move to `to` if `allowed` accepts the current status.
    fn transition_if(&self, allowed: impl Fn(PortStatus) -> bool, to: PortStatus) -> bool {
        let mut from = to;
        let changed = self.status.send_if_modified(|status| {
            if *status == to || !allowed(*status) {
                return false;
            }
            from = std::mem::replace(status, to);
            true
        });
        if !changed {
            return false;
        }
        if from == PortStatus::Connected {
            metrics::dec_connected_ports();
        }
        if to == PortStatus::Connected {
            metrics::inc_connected_ports();
        }
        debug!("port status changed: port={}, from={from}, to={to}", self.id());
        self.emit(PortEvent::StatusChanged { from, to });
        if let Some(upstream) = self.upstream() {
            upstream.port_status_changed(self, from, to);
        }
        true
    }

    fn begin_session(&self) -> Arc<Session> {
        let session = Arc::new(Session {
            id: self.sessions.fetch_add(1, Ordering::Relaxed) + 1,
            token: self.core.dispose_token().child_token(),
        });
        if let Some(stale) = self.session.swap(Some(Arc::clone(&session))) {
            stale.token.cancel();
        }
        session
    }

    /// End the session `id`, or whichever is current when `id` is `None`.
    /// Returns false if that session was no longer current.
    fn end_session(&self, id: Option<u64>) -> bool {
        let is_target = |session: &Session| id.is_none_or(|id| session.id == id);
        let previous = self.session.rcu(|current| match current {
            Some(session) if is_target(&**session) => None,
            other => other.clone(),
        });
        let Some(session) = previous.filter(|session| is_target(&**session)) else {
            return false;
        };
        session.token.cancel();
        self.clear_endpoints();
        true
    }

    /// Record a transport failure for session `id` and arm the reconnect
    /// timer. Failures from superseded sessions are ignored.
    pub(crate) fn fail_session(&self, id: u64, error: TransportError) {
        if self.core.is_disposed() || !self.is_enabled() || !self.end_session(Some(id)) {
            debug!("stale transport failure ignored: port={}, error={error}", self.id());
            return;
        }
        // A disable may have completed since the session ended.
        if !self.is_enabled() || !self.transition_if(|current| current != PortStatus::Disabled, PortStatus::Error) {
            debug!("transport failure after disable ignored: port={}, error={error}", self.id());
            return;
        }
        warn!("port failed: port={}, error={error}", self.id());
        let error = Arc::new(LinkError::new(self.id(), error));
        self.last_error.send_replace(Some(Arc::clone(&error)));
        self.publish_error(&error);
        self.arm_reconnect();
        // `disable` clears the enabled flag before cancelling the timer slot.
        if !self.is_enabled() {
            self.cancel_reconnect();
        }
    }

    pub(crate) fn publish_error(&self, error: &Arc<LinkError>) {
        self.core.publish_error(Arc::clone(error));
        if let Some(upstream) = self.upstream() {
            upstream.port_error(self, error);
        }
    }

    /// Deliver a message decoded by one of this port's endpoints.
    pub(crate) async fn deliver(&self, message: MessageRef) {
        let ctx = FeatureContext::new(ConnectionKind::Port, self.id(), self.core.dispose_token());
        let Some(message) = self.context.features.process_rx(message, &ctx).await else {
            return;
        };
        self.core.publish_rx(&message);
        if let Some(upstream) = self.upstream() {
            upstream.port_received(self, message).await;
        }
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    fn arm_reconnect(&self) {
        let token = Arc::new(self.core.dispose_token().child_token());
        if let Some(previous) = self.reconnect.swap(Some(Arc::clone(&token))) {
            previous.cancel();
        }
        let delay = self.config.reconnect_timeout;
        // The deadline is fixed now, before the task first runs.
        let timer = self.context.time.sleep(delay);
        let port = self.this.clone();
        info!(
            "port reconnect scheduled: port={}, delay_ms={}",
            self.id(),
            delay.as_millis()
        );
        self.tracker.spawn(async move {
            select! {
                biased;

                () = token.cancelled() => {}
                () = timer => {
                    if let Some(port) = port.upgrade() {
                        port.reconnect_due(&token).await;
                    }
                }
            }
        });
    }

    async fn reconnect_due(&self, token: &Arc<CancellationToken>) {
        self.reconnect.rcu(|current| match current {
            Some(slot) if Arc::ptr_eq(slot, token) => None,
            other => other.clone(),
        });
        self.connect(Some(token.as_ref())).await;
    }

    fn cancel_reconnect(&self) {
        if let Some(pending) = self.reconnect.swap(None) {
            pending.cancel();
        }
    }

    /// Run the Tx pipeline and write `message` to every endpoint.
    ///
    /// Returns how many endpoints wrote a frame. The Tx stream only sees the
    /// message when that count is non-zero.
    pub(crate) async fn transmit(
        &self,
        message: MessageRef,
        cancel: &CancellationToken,
    ) -> Result<usize, ConnectionError> {
        if !self.core.begin_send(cancel)? {
            return Ok(0);
        }
        let ctx = FeatureContext::new(ConnectionKind::Port, self.id(), cancel);
        let Some(message) = self.context.features.process_tx(message, &ctx).await else {
            return Ok(0);
        };
        let endpoints = self.endpoints.load_full();
        let mut written = 0;
        for endpoint in endpoints.iter() {
            match endpoint.transmit(Arc::clone(&message), cancel).await {
                Ok(sent) => written += usize::from(sent),
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    debug!("endpoint send failed: endpoint={}, error={error}", endpoint.id());
                    self.publish_error(&Arc::new(LinkError::new(endpoint.id(), error)));
                }
            }
        }
        if written > 0 {
            self.core.publish_tx(&message);
        }
        Ok(written)
    }
}

#[async_trait]
impl Connection for Port {
    fn id(&self) -> &str { &self.core.id }

    fn kind(&self) -> ConnectionKind { ConnectionKind::Port }

    fn statistics(&self) -> &Arc<Statistics> { &self.core.statistics }

    async fn send(&self, message: MessageRef, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        self.transmit(message, cancel).await.map(|_| ())
    }

    fn on_rx(&self) -> broadcast::Receiver<MessageRef> { self.core.subscribe_rx() }

    fn on_tx(&self) -> broadcast::Receiver<MessageRef> { self.core.subscribe_tx() }

    fn on_error(&self) -> broadcast::Receiver<Arc<LinkError>> { self.core.subscribe_errors() }

    fn is_disposed(&self) -> bool { self.core.is_disposed() }
}

impl Drop for Port {
    fn drop(&mut self) { self.core.dispose_token().cancel(); }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.core.id)
            .field("status", &self.status())
            .field("enabled", &self.is_enabled())
            .field("endpoints", &self.endpoint_count())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}
