#![doc(html_root_url = "https://docs.rs/linkroute/latest")]
//! Public API for the `linkroute` library.
//!
//! The crate routes framed protocol messages between links of any kind.
//! A [`Router`] owns [`Port`]s built from connection strings; each port owns
//! the [`Endpoint`]s its transport produces (one per TCP client, one per
//! accepted peer, one per UDP socket or serial device). Inbound bytes are
//! parsed per endpoint, pass through the shared [`FeaturePipeline`] at
//! endpoint, port and router scope, and surface on the `on_rx` streams of
//! every [`Connection`] on the way.
//!
//! ```rust,no_run
//! use linkroute::{BroadcastFeature, Router, protocol::example};
//!
//! # async fn run() -> Result<(), linkroute::ConfigError> {
//! let router = Router::builder()
//!     .protocols(example::protocols())
//!     .feature(BroadcastFeature::new())
//!     .build();
//! router.add_port("tcp://0.0.0.0:5760?srv=true&name=hub")?;
//! router.add_port("udp://0.0.0.0:14550?rport=14551")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod feature;
pub mod frame;
pub mod message;
pub mod metrics;
pub mod parser;
pub mod port;
pub mod prelude;
pub mod protocol;
pub mod router;
pub mod statistics;
pub mod time;
pub mod transport;
pub mod virtual_link;

pub use config::{ConnectionString, PortConfig};
pub use connection::{Connection, ConnectionKind};
pub use endpoint::{Endpoint, LinkWriter, StreamWriter};
pub use error::{ConfigError, ConnectionError, FramingError, LinkError, LinkErrorKind, TransportError};
pub use feature::{BroadcastFeature, Feature, FeatureAction, FeatureContext, FeaturePipeline, PredicateFilter};
pub use message::{Message, MessageRef, MessageRegistry, ProtocolInfo, Tags};
pub use parser::{ParserFactory, ProtocolParser, Protocols};
pub use port::{Port, PortContext, PortEvent, PortLink, PortStatus, PortTransport};
pub use router::{PortFactory, Router, RouterBuilder, RouterEvent};
pub use statistics::{Counter, Statistics, StatisticsSnapshot};
pub use time::{ManualTime, TimeProvider, TokioTime};
pub use virtual_link::VirtualConnection;
