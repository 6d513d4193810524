//! Two ports joined back to back in memory.
//!
//! A [`VirtualConnection`] exercises the full byte path (serialise, write,
//! read, parse, feature pipelines) without a socket. Each side carries a
//! predicate that decides which of its outbound messages cross the pipe.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::io::{DuplexStream, duplex};

use crate::{
    config::PortConfig,
    connection::ConnectionKind,
    endpoint::StreamWriter,
    error::TransportError,
    feature::{Feature, FeaturePipeline, MessagePredicate, PredicateFilter},
    parser::Protocols,
    port::{Port, PortContext, PortLink, PortTransport},
    transport::{OnClose, pump},
};

/// Bytes buffered in each direction of the pipe.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Port name of the server side.
pub const SERVER_PORT: &str = "server";
/// Port name of the client side.
pub const CLIENT_PORT: &str = "client";

const FILTER_ID: &str = "virtual-link-filter";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Server,
    Client,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Server => 0,
            Side::Client => 1,
        }
    }
}

/// Hands each side its half of the current pipe. A side opening with no
/// half waiting starts a fresh pipe, which closes the peer's stale half and
/// makes it reconnect onto the new one.
#[derive(Debug, Default)]
struct Pipe {
    halves: Mutex<[Option<DuplexStream>; 2]>,
}

impl Pipe {
    fn take(&self, side: Side) -> DuplexStream {
        let mut halves = self.halves.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(own) = halves[side.index()].take() {
            return own;
        }
        let (own, peer) = duplex(PIPE_CAPACITY);
        halves[1 - side.index()] = Some(peer);
        own
    }
}

#[derive(Debug)]
struct PipeTransport {
    pipe: Arc<Pipe>,
    side: Side,
}

#[async_trait]
impl PortTransport for PipeTransport {
    async fn open(&self, link: PortLink) -> Result<(), TransportError> {
        let (reader, writer) = tokio::io::split(self.pipe.take(self.side));
        let Some(endpoint) = link.attach("pipe", Arc::new(StreamWriter::new(writer))) else {
            return Ok(());
        };
        link.spawn(pump(link.clone(), endpoint, reader, OnClose::Fail));
        Ok(())
    }
}

/// In-memory link between a `server` and a `client` port.
pub struct VirtualConnection {
    server: Arc<Port>,
    client: Arc<Port>,
}

impl VirtualConnection {
    /// Standalone connection parsing `protocols` and running `features` on
    /// both sides.
    #[must_use]
    pub fn new(
        protocols: Protocols,
        features: impl IntoIterator<Item = Arc<dyn Feature>>,
        server_filter: MessagePredicate,
        client_filter: MessagePredicate,
    ) -> Self {
        let base = PortContext::new(protocols)
            .with_features(Arc::new(FeaturePipeline::from_features(features)));
        Self::from_context(&base, server_filter, client_filter)
    }

    /// Connection whose ports share `base` (for example a router's
    /// [`crate::router::Router::port_context`]). The features in `base` are
    /// copied into each side's own pipeline next to its filter.
    #[must_use]
    pub fn from_context(base: &PortContext, server_filter: MessagePredicate, client_filter: MessagePredicate) -> Self {
        let pipe = Arc::new(Pipe::default());
        let side = |side: Side, name: &str, filter: MessagePredicate| {
            let features = FeaturePipeline::from_features(base.features.snapshot().iter().cloned());
            features.add(Arc::new(PredicateFilter::new(FILTER_ID, ConnectionKind::Endpoint, filter)));
            let context = base.clone().with_features(Arc::new(features));
            let transport = PipeTransport {
                pipe: Arc::clone(&pipe),
                side,
            };
            Port::new(PortConfig::new(name), Arc::new(transport), context)
        };
        Self {
            server: side(Side::Server, SERVER_PORT, server_filter),
            client: side(Side::Client, CLIENT_PORT, client_filter),
        }
    }

    /// The server side.
    #[must_use]
    pub fn server(&self) -> &Arc<Port> { &self.server }

    /// The client side.
    #[must_use]
    pub fn client(&self) -> &Arc<Port> { &self.client }

    /// Enable the server, then the client.
    pub async fn enable(&self) {
        self.server.enable().await;
        self.client.enable().await;
    }

    /// Disable both sides.
    pub fn disable(&self) {
        self.client.disable();
        self.server.disable();
    }

    /// Dispose both sides.
    pub fn dispose(&self) {
        self.client.dispose();
        self.server.dispose();
    }

    /// Dispose both sides and wait for their tasks.
    pub async fn dispose_async(&self) {
        self.client.dispose_async().await;
        self.server.dispose_async().await;
    }
}

impl fmt::Debug for VirtualConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConnection")
            .field("server", &self.server)
            .field("client", &self.client)
            .finish()
    }
}
