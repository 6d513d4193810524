//! Convenience imports for building a router.
//!
//! Kept to the handful of types almost every caller touches. Import
//! transports and testing helpers from their own modules.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use linkroute::prelude::*;
//!
//! fn build() -> Arc<Router> { Router::new(linkroute::protocol::example::protocols()) }
//! ```

pub use crate::{
    connection::Connection,
    error::{ConfigError, ConnectionError},
    feature::{BroadcastFeature, Feature, FeatureAction, FeatureContext},
    message::{Message, MessageRef},
    port::{Port, PortStatus},
    router::Router,
};
