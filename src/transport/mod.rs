//! Built-in [`PortTransport`](crate::port::PortTransport) implementations.
//!
//! Every transport follows the same shape: `open` establishes the link,
//! attaches endpoints through the [`PortLink`] it was handed and spawns a
//! reader per endpoint on the port's task tracker. Readers stop when the
//! session or the endpoint is cancelled.

mod backoff;
pub mod serial;
pub mod tcp;
pub mod udp;

use std::sync::Arc;

pub use backoff::BackoffConfig;
use log::info;
pub use serial::{DataBits, Parity, SerialConfig, SerialTransport, StopBits};
pub use tcp::{TcpClientTransport, TcpServerTransport};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    select,
};
pub use udp::UdpTransport;

use crate::{
    connection::Connection,
    endpoint::Endpoint,
    error::TransportError,
    port::PortLink,
};

/// Size of the buffer each stream reader fills per read.
pub const READ_BUFFER_SIZE: usize = 4096;

/// What a stream reader reports when its peer goes away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OnClose {
    /// The link is the port itself: fail the session and reconnect.
    Fail,
    /// The link is one of many peers: drop the endpoint only.
    Detach,
}

/// Read `reader` into `endpoint` until the link closes or the session ends.
#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
pub(crate) async fn pump<R>(link: PortLink, endpoint: Arc<Endpoint>, mut reader: R, on_close: OnClose)
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0_u8; READ_BUFFER_SIZE];
    let error = loop {
        let read = select! {
            biased;

            () = link.session().cancelled() => return,
            () = endpoint.cancelled_token().cancelled() => return,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break TransportError::Closed,
            Ok(n) => link.receive(&endpoint, &buf[..n]).await,
            Err(e) => break TransportError::Io(e),
        }
    };
    link.detach(&endpoint);
    match on_close {
        OnClose::Fail => link.fail(error),
        OnClose::Detach => info!("endpoint closed: endpoint={}, reason={error}", endpoint.id()),
    }
}
