//! A single physical peer reachable through a port.
//!
//! An endpoint owns one parser per protocol and the writer half of its link.
//! Inbound bytes are parsed, passed through the owning port's features at
//! endpoint scope and returned to the port for delivery. Outbound messages
//! take the reverse path and are written only when no feature drops them.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, broadcast, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    connection::{Connection, ConnectionCore, ConnectionKind},
    error::{ConnectionError, FramingError, LinkError, TransportError},
    feature::{FeatureContext, FeaturePipeline},
    message::MessageRef,
    parser::{ParseEvent, ParserSet},
    statistics::{Counter, Statistics},
};

/// Write side of a link.
#[async_trait]
pub trait LinkWriter: Send + Sync {
    /// Write one complete frame.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the link rejects the write.
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// [`LinkWriter`] over any async byte stream.
///
/// Concurrent writers are serialised so frames never interleave.
pub struct StreamWriter<W> {
    inner: AsyncMutex<W>,
}

impl<W> StreamWriter<W> {
    /// Wrap `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner: AsyncMutex::new(inner),
        }
    }
}

#[async_trait]
impl<W> LinkWriter for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        inner.write_all(bytes).await?;
        inner.flush().await?;
        Ok(())
    }
}

/// Outcome of feeding bytes to an endpoint.
#[derive(Debug, Default)]
pub struct Received {
    /// Messages that passed the endpoint pipeline.
    pub messages: Vec<MessageRef>,
    /// Frames the parsers rejected.
    pub errors: Vec<FramingError>,
}

/// One peer of a port.
pub struct Endpoint {
    core: ConnectionCore,
    parsers: Mutex<ParserSet>,
    writer: Arc<dyn LinkWriter>,
    features: Arc<FeaturePipeline>,
    connected: watch::Sender<bool>,
}

impl Endpoint {
    /// Create a connected endpoint.
    ///
    /// `statistics` should be a child of the owning port's statistics and
    /// `dispose` a child of the port session token.
    pub fn new(
        id: impl Into<Arc<str>>,
        parsers: ParserSet,
        writer: Arc<dyn LinkWriter>,
        features: Arc<FeaturePipeline>,
        statistics: Arc<Statistics>,
        dispose: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: ConnectionCore::new(id, statistics, dispose),
            parsers: Mutex::new(parsers),
            writer,
            features,
            connected: watch::Sender::new(true),
        })
    }

    /// Returns true until the endpoint is disposed.
    #[must_use]
    pub fn is_connected(&self) -> bool { *self.connected.borrow() }

    /// Observe connectivity changes.
    #[must_use]
    pub fn watch_connected(&self) -> watch::Receiver<bool> { self.connected.subscribe() }

    /// Token cancelled when the endpoint is disposed.
    #[must_use]
    pub fn cancelled_token(&self) -> &CancellationToken { self.core.dispose_token() }

    /// Feed bytes read from the link.
    ///
    /// Frames are decoded in order; framing errors are counted, published
    /// and returned but never stop the stream.
    pub async fn receive(&self, bytes: &[u8]) -> Received {
        let mut received = Received::default();
        if self.core.is_disposed() || bytes.is_empty() {
            return received;
        }
        let stats = &self.core.statistics;
        stats.add(Counter::RxBytes, bytes.len() as u64);

        let events = self
            .parsers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_slice(bytes);

        let ctx = FeatureContext::new(ConnectionKind::Endpoint, &self.core.id, self.core.dispose_token());
        for event in events {
            match event {
                ParseEvent::Message(message) => {
                    stats.increment(Counter::ParsedMessages);
                    let message = MessageRef::from(message);
                    if let Some(message) = self.features.process_rx(message, &ctx).await {
                        stats.increment(Counter::RxMessages);
                        self.core.publish_rx(&message);
                        received.messages.push(message);
                    }
                }
                ParseEvent::Error(error) => {
                    stats.increment(Counter::RxErrors);
                    debug!(endpoint = %self.core.id, %error, "framing error");
                    self.core
                        .publish_error(Arc::new(LinkError::new(&*self.core.id, error.clone())));
                    received.errors.push(error);
                }
            }
        }
        received
    }

    /// Disconnect the endpoint. Pending sends resolve silently.
    pub fn dispose(&self) {
        if self.core.mark_disposed() {
            self.connected.send_replace(false);
            trace!(endpoint = %self.core.id, "endpoint disposed");
        }
    }

    /// Run the Tx pipeline and write `message` to the peer.
    ///
    /// Returns true only if a frame was written; a disposed endpoint or a
    /// message dropped by a feature yields `Ok(false)`.
    pub(crate) async fn transmit(
        &self,
        message: MessageRef,
        cancel: &CancellationToken,
    ) -> Result<bool, ConnectionError> {
        if !self.core.begin_send(cancel)? {
            return Ok(false);
        }
        let ctx = FeatureContext::new(ConnectionKind::Endpoint, &self.core.id, cancel);
        let Some(message) = self.features.process_tx(message, &ctx).await else {
            return Ok(false);
        };
        let stats = &self.core.statistics;
        let mut frame = BytesMut::with_capacity(message.byte_size());
        if let Err(error) = message.serialize(&mut frame) {
            stats.increment(Counter::TxErrors);
            return Err(error.into());
        }
        match self.core.guarded(cancel, self.writer.write(&frame)).await? {
            None => Ok(false),
            Some(Ok(())) => {
                stats.add(Counter::TxBytes, frame.len() as u64);
                stats.increment(Counter::TxMessages);
                self.core.publish_tx(&message);
                Ok(true)
            }
            Some(Err(error)) => {
                stats.increment(Counter::TxErrors);
                Err(error.into())
            }
        }
    }
}

#[async_trait]
impl Connection for Endpoint {
    fn id(&self) -> &str { &self.core.id }

    fn kind(&self) -> ConnectionKind { ConnectionKind::Endpoint }

    fn statistics(&self) -> &Arc<Statistics> { &self.core.statistics }

    async fn send(&self, message: MessageRef, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        self.transmit(message, cancel).await.map(|_| ())
    }

    fn on_rx(&self) -> broadcast::Receiver<MessageRef> { self.core.subscribe_rx() }

    fn on_tx(&self) -> broadcast::Receiver<MessageRef> { self.core.subscribe_tx() }

    fn on_error(&self) -> broadcast::Receiver<Arc<LinkError>> { self.core.subscribe_errors() }

    fn is_disposed(&self) -> bool { self.core.is_disposed() }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.core.id)
            .field("connected", &self.is_connected())
            .field("statistics", &self.core.statistics)
            .finish_non_exhaustive()
    }
}
