//! UDP transport.
//!
//! The port binds a local socket and owns a single endpoint. Outbound frames
//! go to the configured remote (`rhost`/`rport`) or, without one, to the
//! last peer a datagram arrived from.

use std::{io, net::SocketAddr, sync::Arc};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use log::info;
use tokio::{
    net::{UdpSocket, lookup_host},
    select,
};
use tracing::trace;

use crate::{
    config::ConnectionString,
    endpoint::{Endpoint, LinkWriter},
    error::{ConfigError, TransportError},
    port::{PortLink, PortTransport},
};

/// Largest datagram the reader accepts.
const MAX_DATAGRAM: usize = 65_507;

/// Datagram link between a local socket and one remote peer.
#[derive(Debug)]
pub struct UdpTransport {
    local: String,
    remote: Option<String>,
    bound: Arc<ArcSwapOption<SocketAddr>>,
}

impl UdpTransport {
    /// Bind `local`; send to `remote` when given, else to the last sender.
    pub fn new(local: impl Into<String>, remote: Option<String>) -> Self {
        Self {
            local: local.into(),
            remote,
            bound: Arc::default(),
        }
    }

    /// Transport for `udp://host:port[?rhost=..&rport=..]`.
    ///
    /// `rhost` defaults to `127.0.0.1` when only `rport` is given.
    ///
    /// # Errors
    ///
    /// Fails when host or port are missing, `rport` is not a port number,
    /// or `rhost` is given without `rport`.
    pub fn from_connection_string(cs: &ConnectionString) -> Result<Self, ConfigError> {
        let local = cs.socket_addr()?;
        let rport = cs.get_int::<u16>("rport", 0)?;
        let remote = match (cs.get_str("rhost"), rport) {
            (None, 0) => None,
            (Some(_), 0) => return Err(ConfigError::MissingPort(cs.as_str().to_owned())),
            (Some(host), port) if host.contains(':') => Some(format!("[{host}]:{port}")),
            (host, port) => Some(format!("{}:{port}", host.unwrap_or("127.0.0.1"))),
        };
        Ok(Self::new(local, remote))
    }
}

struct DatagramWriter {
    socket: Arc<UdpSocket>,
    peer: ArcSwapOption<SocketAddr>,
}

#[async_trait]
impl LinkWriter for DatagramWriter {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let Some(peer) = self.peer.load_full() else {
            return Err(TransportError::Unavailable("udp remote peer not known yet".into()));
        };
        self.socket.send_to(bytes, *peer).await?;
        Ok(())
    }
}

#[async_trait]
impl PortTransport for UdpTransport {
    async fn open(&self, link: PortLink) -> Result<(), TransportError> {
        let remote = match &self.remote {
            Some(remote) => Some(lookup_host(remote.as_str()).await?.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {remote}"))
            })?),
            None => None,
        };
        let socket = Arc::new(UdpSocket::bind(&self.local).await?);
        let local = socket.local_addr()?;
        self.bound.store(Some(Arc::new(local)));
        info!(
            "udp socket bound: port={}, addr={local}, remote={remote:?}",
            link.port_id().unwrap_or_default()
        );

        let writer = Arc::new(DatagramWriter {
            socket: Arc::clone(&socket),
            peer: ArcSwapOption::new(remote.map(Arc::new)),
        });
        let Some(endpoint) = link.attach("udp", Arc::clone(&writer) as Arc<dyn LinkWriter>) else {
            return Ok(());
        };
        let bound = Arc::clone(&self.bound);
        let learn_peer = remote.is_none();
        link.spawn({
            let link = link.clone();
            async move {
                read_datagrams(&link, &endpoint, &socket, &writer, learn_peer).await;
                bound.store(None);
            }
        });
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> { self.bound.load().as_deref().copied() }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn read_datagrams(
    link: &PortLink,
    endpoint: &Endpoint,
    socket: &UdpSocket,
    writer: &DatagramWriter,
    learn_peer: bool,
) {
    let mut buf = vec![0_u8; MAX_DATAGRAM];
    loop {
        let received = select! {
            biased;

            () = link.session().cancelled() => return,
            () = endpoint.cancelled_token().cancelled() => return,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((n, from)) => {
                trace!(%from, bytes = n, "datagram received");
                if learn_peer && writer.peer.load().as_deref() != Some(&from) {
                    writer.peer.store(Some(Arc::new(from)));
                }
                link.receive(endpoint, &buf[..n]).await;
            }
            Err(e) => {
                link.detach(endpoint);
                link.fail(e.into());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("udp://0.0.0.0:14550", None)]
    #[case("udp://0.0.0.0:14550?rport=14551", Some("127.0.0.1:14551"))]
    #[case("udp://0.0.0.0:14550?rhost=10.1.1.2&rport=14551", Some("10.1.1.2:14551"))]
    #[case("udp://0.0.0.0:14550?rhost=::1&rport=9", Some("[::1]:9"))]
    fn remote_from_query(#[case] raw: &str, #[case] remote: Option<&str>) {
        let cs = ConnectionString::parse(raw).expect("parse");
        let transport = UdpTransport::from_connection_string(&cs).expect("transport");
        assert_eq!(transport.local, "0.0.0.0:14550");
        assert_eq!(transport.remote.as_deref(), remote);
    }

    #[rstest]
    #[case("udp://0.0.0.0:14550?rhost=10.1.1.2", ConfigError::MissingPort("udp://0.0.0.0:14550?rhost=10.1.1.2".into()))]
    #[case("udp://0.0.0.0:1?rport=x", ConfigError::InvalidInteger { key: "rport".into(), value: "x".into() })]
    #[case("udp://0.0.0.0", ConfigError::MissingPort("udp://0.0.0.0".into()))]
    fn rejects_incomplete_addresses(#[case] raw: &str, #[case] expected: ConfigError) {
        let cs = ConnectionString::parse(raw).expect("parse");
        assert_eq!(UdpTransport::from_connection_string(&cs).expect_err("invalid"), expected);
    }
}
