//! TCP client and server transports.
//!
//! The client port owns a single endpoint and fails (then reconnects) when
//! the stream closes. The server port owns one endpoint per accepted peer;
//! a peer hanging up only removes its endpoint.

use std::{fmt, io, net::SocketAddr, sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use log::{info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use super::{BackoffConfig, OnClose, pump};
use crate::{
    config::ConnectionString,
    endpoint::StreamWriter,
    error::{ConfigError, TransportError},
    port::{PortLink, PortTransport},
};

/// Dials `addr` and exchanges frames over the resulting stream.
#[derive(Clone, Debug)]
pub struct TcpClientTransport {
    addr: String,
}

impl TcpClientTransport {
    /// Client for `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self { Self { addr: addr.into() } }

    /// Client for the authority of `cs`.
    ///
    /// # Errors
    ///
    /// Fails when host or port are missing.
    pub fn from_connection_string(cs: &ConnectionString) -> Result<Self, ConfigError> {
        Ok(Self::new(cs.socket_addr()?))
    }
}

#[async_trait]
impl PortTransport for TcpClientTransport {
    async fn open(&self, link: PortLink) -> Result<(), TransportError> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map_or_else(|_| self.addr.clone(), |addr| addr.to_string());
        let (reader, writer) = stream.into_split();
        let Some(endpoint) = link.attach(&peer, Arc::new(StreamWriter::new(writer))) else {
            return Ok(());
        };
        link.spawn(pump(link.clone(), endpoint, reader, OnClose::Fail));
        Ok(())
    }
}

/// Listens on `addr` and adds an endpoint per accepted peer.
pub struct TcpServerTransport {
    addr: String,
    backoff: BackoffConfig,
    bound: Arc<ArcSwapOption<SocketAddr>>,
}

impl TcpServerTransport {
    /// Server bound to `addr` (`host:port`; port 0 picks a free one).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            backoff: BackoffConfig::default(),
            bound: Arc::default(),
        }
    }

    /// Server for the authority of `cs`, with the accept back-off read from
    /// `backoff_ms` and `backoff_max_ms`.
    ///
    /// # Errors
    ///
    /// Fails when host or port are missing or a back-off value is not an
    /// integer.
    pub fn from_connection_string(cs: &ConnectionString) -> Result<Self, ConfigError> {
        Ok(Self::new(cs.socket_addr()?).with_backoff(BackoffConfig::from_connection_string(cs)?))
    }

    /// Replace the accept back-off.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

impl fmt::Debug for TcpServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServerTransport")
            .field("addr", &self.addr)
            .field("bound", &self.local_addr())
            .field("backoff", &self.backoff)
            .finish()
    }
}

#[async_trait]
impl PortTransport for TcpServerTransport {
    async fn open(&self, link: PortLink) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local = listener.local_addr()?;
        self.bound.store(Some(Arc::new(local)));
        info!(
            "tcp server listening: port={}, addr={local}",
            link.port_id().unwrap_or_default()
        );

        let bound = Arc::clone(&self.bound);
        let peers = link.clone();
        let shutdown = link.session().clone();
        let backoff = self.backoff;
        link.spawn(async move {
            accept_loop(
                Arc::new(listener),
                move |stream, addr| serve_peer(&peers, stream, addr),
                shutdown,
                backoff,
            )
            .await;
            bound.store(None);
        });
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> { self.bound.load().as_deref().copied() }
}

fn serve_peer(link: &PortLink, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("set_nodelay failed: peer={addr}, error={e}");
    }
    let (reader, writer) = stream.into_split();
    if let Some(endpoint) = link.attach(&addr.to_string(), Arc::new(StreamWriter::new(writer))) {
        link.spawn(pump(link.clone(), endpoint, reader, OnClose::Detach));
    }
}

/// Source of incoming connections consumed by the accept loop.
///
/// Implementations must be cancellation-safe: dropping a pending `accept()`
/// future must not leak resources.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub(crate) trait AcceptListener: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl AcceptListener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> { TcpListener::accept(self).await }

    fn local_addr(&self) -> io::Result<SocketAddr> { TcpListener::local_addr(self) }
}

/// Accept connections from `listener` until `shutdown` fires, handing each
/// to `on_accept`.
///
/// Accept failures are logged and retried after an exponential back-off;
/// they never end the loop.
pub(crate) async fn accept_loop<L, F>(
    listener: Arc<L>,
    on_accept: F,
    shutdown: CancellationToken,
    backoff: BackoffConfig,
) where
    L: AcceptListener + 'static,
    F: Fn(TcpStream, SocketAddr) + Send + Sync,
{
    let backoff = backoff.normalized();
    debug_assert!(
        backoff.initial_delay <= backoff.max_delay,
        "BackoffConfig invariant violated: initial_delay > max_delay"
    );
    let mut delay = backoff.initial_delay;
    while let Some(next) = accept_iteration(&*listener, &on_accept, &shutdown, &backoff, delay).await {
        delay = next;
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn accept_iteration<L, F>(
    listener: &L,
    on_accept: &F,
    shutdown: &CancellationToken,
    backoff: &BackoffConfig,
    delay: Duration,
) -> Option<Duration>
where
    L: AcceptListener,
    F: Fn(TcpStream, SocketAddr),
{
    select! {
        biased;

        () = shutdown.cancelled() => None,
        res = listener.accept() => Some(match res {
            Ok((stream, addr)) => {
                on_accept(stream, addr);
                backoff.initial_delay
            }
            Err(e) => {
                let local_addr = listener.local_addr().ok();
                warn!("accept error: error={e:?}, local_addr={local_addr:?}");
                select! {
                    biased;

                    () = shutdown.cancelled() => return None,
                    () = sleep(delay) => {}
                }
                backoff.next_delay(delay)
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rstest::rstest;
    use tokio::{
        task::yield_now,
        time::{Instant, advance, timeout},
    };
    use tokio_util::task::TaskTracker;

    use super::*;

    fn failing_listener(calls: &Arc<Mutex<Vec<Instant>>>, times: usize) -> MockAcceptListener {
        let mut listener = MockAcceptListener::new();
        let log = Arc::clone(calls);
        listener
            .expect_accept()
            .returning(move || {
                let log = Arc::clone(&log);
                Box::pin(async move {
                    log.lock().expect("lock").push(Instant::now());
                    Err(io::Error::other("mock error"))
                })
            })
            .times(times);
        listener
            .expect_local_addr()
            .returning(|| Ok("127.0.0.1:0".parse().expect("addr parse")))
            .times(times);
        listener
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn accept_failures_back_off_exponentially() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let listener = Arc::new(failing_listener(&calls, 4));
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let backoff = BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        };
        tracker.spawn(accept_loop(listener, |_, _| {}, token.clone(), backoff));
        yield_now().await;
        assert_eq!(calls.lock().expect("lock").len(), 1);

        for ms in [5, 10, 20] {
            advance(Duration::from_millis(ms)).await;
            yield_now().await;
        }
        token.cancel();
        tracker.close();
        tracker.wait().await;

        let calls = calls.lock().expect("lock");
        let intervals: Vec<_> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            intervals,
            [5, 10, 20].map(Duration::from_millis),
            "delay doubles and caps at max_delay"
        );
    }

    #[tokio::test]
    async fn accept_loop_stops_on_shutdown() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.expect("bind"));
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(accept_loop(listener, |_, _| {}, token.clone(), BackoffConfig::default()));
        token.cancel();
        tracker.close();
        assert!(timeout(Duration::from_millis(100), tracker.wait()).await.is_ok());
    }

    #[tokio::test]
    async fn accepted_streams_reach_the_callback() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.expect("bind"));
        let addr = listener.local_addr().expect("local addr");
        let token = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let task = tokio::spawn(accept_loop(
            listener,
            move |_, peer| {
                let _ = tx.send(peer);
            },
            token.clone(),
            BackoffConfig::default(),
        ));
        let client = TcpStream::connect(addr).await.expect("connect");
        let peer = rx.recv().await.expect("accepted");
        assert_eq!(peer, client.local_addr().expect("client addr"));
        token.cancel();
        task.await.expect("accept loop");
    }

    #[test]
    fn backoff_is_normalised() {
        let cfg = BackoffConfig {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_millis(100),
        }
        .normalized();
        assert_eq!(cfg.initial_delay, Duration::from_millis(100));
        assert_eq!(cfg.next_delay(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(cfg.next_delay(Duration::from_secs(2)), Duration::from_secs(2));
    }
}
