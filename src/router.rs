//! Dynamic set of ports sharing one feature pipeline.
//!
//! The router builds ports from connection strings through a scheme
//! registry, merges their inbound traffic and errors into its own streams
//! and fans outbound messages out to every port. Ports can be added and
//! removed at any time; sends always see one consistent snapshot.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::{ConnectionString, PortConfig},
    connection::{Connection, ConnectionCore, ConnectionKind, EVENT_CAPACITY},
    error::{ConfigError, ConnectionError, LinkError},
    feature::{Feature, FeatureContext, FeaturePipeline},
    message::MessageRef,
    parser::Protocols,
    port::{Port, PortContext, PortStatus, PortTransport, PortUpstream},
    statistics::Statistics,
    time::{TimeProvider, TokioTime},
    transport::{SerialConfig, SerialTransport, TcpClientTransport, TcpServerTransport, UdpTransport},
};

/// Identifier used when none is configured.
pub const DEFAULT_ROUTER_ID: &str = "router";

/// Builds a port for one connection-string scheme.
///
/// Closures of the matching shape implement this trait.
pub trait PortFactory: Send + Sync {
    /// Build a disabled port for `cs` using `context`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for malformed connection strings.
    fn create(&self, cs: &ConnectionString, context: PortContext) -> Result<Arc<Port>, ConfigError>;
}

impl<F> PortFactory for F
where
    F: Fn(&ConnectionString, PortContext) -> Result<Arc<Port>, ConfigError> + Send + Sync,
{
    fn create(&self, cs: &ConnectionString, context: PortContext) -> Result<Arc<Port>, ConfigError> {
        self(cs, context)
    }
}

/// Build a port for `cs` over `transport` with the common settings.
///
/// # Errors
///
/// Fails if the common query keys are malformed.
pub fn port_for(
    cs: &ConnectionString,
    context: PortContext,
    transport: impl PortTransport + 'static,
) -> Result<Arc<Port>, ConfigError> {
    let config = PortConfig::from_connection_string(cs)?;
    Ok(Port::new(config, Arc::new(transport), context))
}

fn tcp_port(cs: &ConnectionString, context: PortContext) -> Result<Arc<Port>, ConfigError> {
    if cs.get_bool("srv", false)? {
        tcp_server_port(cs, context)
    } else {
        port_for(cs, context, TcpClientTransport::from_connection_string(cs)?)
    }
}

fn tcp_server_port(cs: &ConnectionString, context: PortContext) -> Result<Arc<Port>, ConfigError> {
    port_for(cs, context, TcpServerTransport::from_connection_string(cs)?)
}

fn udp_port(cs: &ConnectionString, context: PortContext) -> Result<Arc<Port>, ConfigError> {
    port_for(cs, context, UdpTransport::from_connection_string(cs)?)
}

fn serial_port(cs: &ConnectionString, context: PortContext) -> Result<Arc<Port>, ConfigError> {
    let transport = SerialTransport::new(SerialConfig::from_connection_string(cs)?);
    port_for(cs, context, transport)
}

fn default_factories() -> [(&'static str, Arc<dyn PortFactory>); 5] {
    [
        ("tcp", Arc::new(tcp_port)),
        ("tcps", Arc::new(tcp_server_port)),
        ("tcp_s", Arc::new(tcp_server_port)),
        ("udp", Arc::new(udp_port)),
        ("serial", Arc::new(serial_port)),
    ]
}

/// Change notification published by a router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouterEvent {
    /// A port joined the router.
    PortAdded(String),
    /// A port left the router.
    PortRemoved(String),
    /// A port changed status.
    PortUpdated {
        /// Port identifier.
        port: String,
        /// New status.
        status: PortStatus,
    },
}

/// Configures and builds a [`Router`].
#[must_use]
pub struct RouterBuilder {
    id: String,
    features: Vec<Arc<dyn Feature>>,
    protocols: Protocols,
    time: Arc<dyn TimeProvider>,
    factories: Vec<(String, Arc<dyn PortFactory>)>,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self {
            id: DEFAULT_ROUTER_ID.to_owned(),
            features: Vec::new(),
            protocols: Protocols::new(),
            time: Arc::new(TokioTime::new()),
            factories: Vec::new(),
        }
    }
}

impl RouterBuilder {
    /// Set the router identifier.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add a feature to the shared pipeline.
    pub fn feature(mut self, feature: impl Feature + 'static) -> Self {
        self.features.push(Arc::new(feature));
        self
    }

    /// Protocols every endpoint parses.
    pub fn protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = protocols;
        self
    }

    /// Time source for port reconnect timers.
    pub fn time(mut self, time: Arc<dyn TimeProvider>) -> Self {
        self.time = time;
        self
    }

    /// Register `factory` for `scheme`, replacing a default.
    pub fn factory(mut self, scheme: impl Into<String>, factory: impl PortFactory + 'static) -> Self {
        self.factories.push((scheme.into(), Arc::new(factory)));
        self
    }

    /// Build the router.
    #[must_use]
    pub fn build(self) -> Arc<Router> {
        let factories = DashMap::new();
        for (scheme, factory) in default_factories() {
            factories.insert(scheme.to_owned(), factory);
        }
        for (scheme, factory) in self.factories {
            factories.insert(scheme.to_ascii_lowercase(), factory);
        }
        Arc::new_cyclic(|this| Router {
            core: ConnectionCore::new(self.id, Statistics::root(), CancellationToken::new()),
            ports: ArcSwap::from_pointee(Vec::new()),
            factories,
            features: Arc::new(FeaturePipeline::from_features(self.features)),
            protocols: self.protocols,
            time: self.time,
            events: broadcast::channel(EVENT_CAPACITY).0,
            tracker: TaskTracker::new(),
            this: this.clone(),
        })
    }
}

/// Routes messages between a dynamic set of ports.
pub struct Router {
    core: ConnectionCore,
    ports: ArcSwap<Vec<Arc<Port>>>,
    factories: DashMap<String, Arc<dyn PortFactory>>,
    features: Arc<FeaturePipeline>,
    protocols: Protocols,
    time: Arc<dyn TimeProvider>,
    events: broadcast::Sender<RouterEvent>,
    tracker: TaskTracker,
    this: Weak<Router>,
}

impl Router {
    /// Start configuring a router.
    pub fn builder() -> RouterBuilder { RouterBuilder::default() }

    /// Router with default settings parsing `protocols`.
    #[must_use]
    pub fn new(protocols: Protocols) -> Arc<Self> { Self::builder().protocols(protocols).build() }

    /// Shared feature pipeline, also used by every port and endpoint.
    #[must_use]
    pub fn features(&self) -> &Arc<FeaturePipeline> { &self.features }

    /// Subscribe to router events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<RouterEvent> { self.events.subscribe() }

    /// Current port snapshot.
    #[must_use]
    pub fn ports(&self) -> Arc<Vec<Arc<Port>>> { self.ports.load_full() }

    /// Port with identifier `id`.
    #[must_use]
    pub fn port(&self, id: &str) -> Option<Arc<Port>> { self.ports.load().iter().find(|p| p.id() == id).cloned() }

    /// Register `factory` for `scheme`, replacing any previous one.
    pub fn register_factory(&self, scheme: &str, factory: impl PortFactory + 'static) {
        self.factories.insert(scheme.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Returns true if a factory handles `scheme`.
    #[must_use]
    pub fn has_scheme(&self, scheme: &str) -> bool { self.factories.contains_key(&scheme.to_ascii_lowercase()) }

    fn context(&self) -> PortContext {
        let upstream: Weak<dyn PortUpstream> = self.this.clone();
        PortContext {
            features: Arc::clone(&self.features),
            protocols: self.protocols.clone(),
            time: Arc::clone(&self.time),
            parent_statistics: Some(Arc::clone(&self.core.statistics)),
            upstream: Some(upstream),
        }
    }

    fn emit(&self, event: RouterEvent) { let _ = self.events.send(event); }

    /// Build a port from `uri` and add it.
    ///
    /// When the port config is enabled the port is enabled on a background
    /// task; observe [`Port::watch_status`] for the outcome. Must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownScheme`] when no factory handles the
    /// scheme, [`ConfigError::DuplicatePort`] when the port name is taken,
    /// or the parse error of the connection string.
    pub fn add_port(&self, uri: &str) -> Result<Arc<Port>, ConfigError> {
        let cs = ConnectionString::parse(uri)?;
        let factory = self
            .factories
            .get(cs.scheme())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConfigError::UnknownScheme(cs.scheme().to_owned()))?;
        let port = factory.create(&cs, self.context())?;
        self.insert_port(Arc::clone(&port))?;
        if port.config().enabled {
            let enabling = Arc::clone(&port);
            self.tracker.spawn(async move { enabling.enable().await });
        }
        Ok(port)
    }

    /// Add a port built elsewhere. Its context is not changed, so it only
    /// feeds the router if it was built with [`Router::port_context`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicatePort`] when the id is taken.
    pub fn insert_port(&self, port: Arc<Port>) -> Result<(), ConfigError> {
        if self.core.is_disposed() {
            port.dispose();
            return Ok(());
        }
        let mut duplicate = false;
        self.ports.rcu(|current| {
            duplicate = current.iter().any(|p| p.id() == port.id());
            if duplicate {
                return Arc::clone(current);
            }
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&port));
            Arc::new(next)
        });
        if duplicate {
            port.dispose();
            return Err(ConfigError::DuplicatePort(port.id().to_owned()));
        }
        info!("port added: router={}, port={}", self.id(), port.id());
        self.emit(RouterEvent::PortAdded(port.id().to_owned()));
        Ok(())
    }

    /// Context wiring a hand-built port into this router.
    #[must_use]
    pub fn port_context(&self) -> PortContext { self.context() }

    /// Remove and dispose the port `id`. Returns false if it was not present.
    pub fn remove_port(&self, id: &str) -> bool {
        let previous = self
            .ports
            .rcu(|current| current.iter().filter(|p| p.id() != id).cloned().collect::<Vec<_>>());
        let Some(port) = previous.iter().find(|p| p.id() == id) else {
            return false;
        };
        port.dispose();
        info!("port removed: router={}, port={id}", self.id());
        self.emit(RouterEvent::PortRemoved(id.to_owned()));
        true
    }

    fn take_ports(&self) -> Option<Arc<Vec<Arc<Port>>>> {
        if !self.core.mark_disposed() {
            return None;
        }
        let ports = self.ports.swap(Arc::new(Vec::new()));
        for port in ports.iter() {
            self.emit(RouterEvent::PortRemoved(port.id().to_owned()));
        }
        self.tracker.close();
        Some(ports)
    }

    /// Dispose every port and stop the router. Idempotent.
    pub fn dispose(&self) {
        if let Some(ports) = self.take_ports() {
            for port in ports.iter() {
                port.dispose();
            }
            info!("router disposed: router={}, ports={}", self.id(), ports.len());
        }
    }

    /// Dispose every port, waiting for their tasks, then the router's own.
    pub async fn dispose_async(&self) {
        if let Some(ports) = self.take_ports() {
            for port in ports.iter() {
                port.dispose_async().await;
            }
            info!("router disposed: router={}, ports={}", self.id(), ports.len());
        }
        self.tracker.wait().await;
    }
}

#[async_trait]
impl PortUpstream for Router {
    async fn port_received(&self, port: &Port, message: MessageRef) {
        let cancel = self.core.dispose_token();
        let ctx = FeatureContext::for_router(self, cancel);
        let Some(message) = self.features.process_rx(message, &ctx).await else {
            debug!("router dropped inbound message: router={}, port={}", self.id(), port.id());
            return;
        };
        self.core.publish_rx(&message);
    }

    fn port_error(&self, _port: &Port, error: &Arc<LinkError>) { self.core.publish_error(Arc::clone(error)); }

    fn port_status_changed(&self, port: &Port, _from: PortStatus, to: PortStatus) {
        self.emit(RouterEvent::PortUpdated {
            port: port.id().to_owned(),
            status: to,
        });
    }
}

#[async_trait]
impl Connection for Router {
    fn id(&self) -> &str { &self.core.id }

    fn kind(&self) -> ConnectionKind { ConnectionKind::Router }

    fn statistics(&self) -> &Arc<Statistics> { &self.core.statistics }

    async fn send(&self, message: MessageRef, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        if !self.core.begin_send(cancel)? {
            return Ok(());
        }
        let ctx = FeatureContext::for_router(self, cancel);
        let Some(message) = self.features.process_tx(message, &ctx).await else {
            return Ok(());
        };
        let ports = self.ports.load_full();
        let mut written = 0;
        for port in ports.iter() {
            match port.transmit(Arc::clone(&message), cancel).await {
                Ok(count) => written += count,
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    warn!("port send failed: port={}, error={error}", port.id());
                    self.core.publish_error(Arc::new(LinkError::new(port.id(), error)));
                }
            }
        }
        if written > 0 {
            self.core.publish_tx(&message);
        }
        Ok(())
    }

    fn on_rx(&self) -> broadcast::Receiver<MessageRef> { self.core.subscribe_rx() }

    fn on_tx(&self) -> broadcast::Receiver<MessageRef> { self.core.subscribe_tx() }

    fn on_error(&self) -> broadcast::Receiver<Arc<LinkError>> { self.core.subscribe_errors() }

    fn is_disposed(&self) -> bool { self.core.is_disposed() }
}

impl Drop for Router {
    fn drop(&mut self) { self.core.dispose_token().cancel(); }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.core.id)
            .field("ports", &self.ports.load().len())
            .field("features", &self.features)
            .field("protocols", &self.protocols)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::{
        error::TransportError,
        port::PortLink,
        protocol::example::{self, ExampleMessage1},
    };

    #[derive(Debug)]
    struct IdleTransport;

    #[async_trait]
    impl PortTransport for IdleTransport {
        async fn open(&self, _link: PortLink) -> Result<(), TransportError> { Ok(()) }
    }

    fn idle_port(cs: &ConnectionString, context: PortContext) -> Result<Arc<Port>, ConfigError> {
        port_for(cs, context, IdleTransport)
    }

    #[fixture]
    fn router() -> Arc<Router> {
        Router::builder()
            .protocols(example::protocols())
            .factory("mem", idle_port)
            .build()
    }

    #[rstest]
    #[case("tcp")]
    #[case("tcps")]
    #[case("tcp_s")]
    #[case("udp")]
    #[case("serial")]
    #[case("MEM")]
    fn default_and_custom_schemes(router: Arc<Router>, #[case] scheme: &str) {
        assert!(router.has_scheme(scheme));
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_scheme_is_rejected(router: Arc<Router>) {
        let err = router.add_port("ftp://host:21").expect_err("unknown scheme");
        assert_eq!(err, ConfigError::UnknownScheme("ftp".into()));
        assert!(router.ports().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn malformed_settings_are_returned(router: Arc<Router>) {
        assert_eq!(
            router.add_port("tcp://localhost:1?srv=maybe").expect_err("bad bool"),
            ConfigError::InvalidBool {
                key: "srv".into(),
                value: "maybe".into()
            }
        );
        assert_eq!(
            router.add_port("tcp://localhost").expect_err("no port"),
            ConfigError::MissingPort("tcp://localhost".into())
        );
    }

    #[rstest]
    #[tokio::test]
    async fn add_and_remove_emit_events(router: Arc<Router>) {
        let mut events = router.events();
        let port = router.add_port("mem://a?enabled=false").expect("add");
        assert_eq!(port.id(), "mem://a");
        assert_eq!(router.add_port("mem://a?enabled=false").expect_err("dup"), ConfigError::DuplicatePort("mem://a".into()));
        assert!(router.remove_port("mem://a"));
        assert!(!router.remove_port("mem://a"));
        assert!(port.is_disposed());
        assert_eq!(events.recv().await.expect("event"), RouterEvent::PortAdded("mem://a".into()));
        assert_eq!(events.recv().await.expect("event"), RouterEvent::PortRemoved("mem://a".into()));
    }

    #[rstest]
    #[tokio::test]
    async fn enabled_ports_report_updates(router: Arc<Router>) {
        let mut events = router.events();
        let port = router.add_port("mem://b?name=b").expect("add");
        let mut status = port.watch_status();
        status
            .wait_for(|s| *s == PortStatus::Connected)
            .await
            .expect("port connects");
        let mut updates = Vec::new();
        while let Ok(event) = events.try_recv() {
            updates.push(event);
        }
        assert_eq!(
            updates.last(),
            Some(&RouterEvent::PortUpdated {
                port: "b".into(),
                status: PortStatus::Connected
            })
        );
    }

    #[rstest]
    #[tokio::test]
    async fn custom_factory_replaces_default(router: Arc<Router>) {
        router.register_factory("tcp", idle_port);
        let port = router.add_port("tcp://nowhere?enabled=false").expect("custom factory ignores host/port");
        assert_eq!(port.id(), "tcp://nowhere");
    }

    #[rstest]
    #[tokio::test]
    async fn send_without_endpoints_is_not_published(router: Arc<Router>) {
        let port = router.add_port("mem://quiet").expect("add");
        port.watch_status()
            .wait_for(|s| *s == PortStatus::Connected)
            .await
            .expect("port connects");
        let mut tx = router.on_tx();
        router
            .send(Arc::new(ExampleMessage1::new(4)), &CancellationToken::new())
            .await
            .expect("send");
        assert!(tx.try_recv().is_err());
        assert_eq!(router.statistics().tx_messages(), 0);
    }

    #[rstest]
    #[case::sync_then_async(true)]
    #[case::async_then_sync(false)]
    #[tokio::test]
    async fn dispose_disposes_each_port_once(router: Arc<Router>, #[case] sync_first: bool) {
        let ports: Vec<_> = ["mem://1", "mem://2"]
            .into_iter()
            .map(|uri| router.add_port(uri).expect("add"))
            .collect();
        let mut events = router.events();
        if sync_first {
            router.dispose();
            router.dispose_async().await;
        } else {
            router.dispose_async().await;
            router.dispose();
        }
        assert!(router.is_disposed());
        assert!(router.ports().is_empty());
        assert!(ports.iter().all(|p| p.is_disposed()));
        let mut removed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RouterEvent::PortRemoved(_)) {
                removed += 1;
            }
        }
        assert_eq!(removed, 2);
        router
            .send(Arc::new(ExampleMessage1::new(1)), &CancellationToken::new())
            .await
            .expect("send after dispose is silent");
    }
}
