//! Metric helpers for `linkroute`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Without the `metrics` cargo
//! feature every helper compiles to a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking ports in the `Connected` state.
pub const PORTS_CONNECTED: &str = "linkroute_ports_connected";
/// Name of the counter tracking bytes moved over links.
pub const BYTES_TOTAL: &str = "linkroute_bytes_total";
/// Name of the counter tracking messages moved over links.
pub const MESSAGES_TOTAL: &str = "linkroute_messages_total";
/// Name of the counter tracking framing and transport errors.
pub const ERRORS_TOTAL: &str = "linkroute_errors_total";
/// Name of the counter tracking frames decoded by parsers.
pub const PARSED_TOTAL: &str = "linkroute_parsed_messages_total";

/// Direction of traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Received from a peer.
    Inbound,
    /// Sent to a peer.
    Outbound,
}

impl Direction {
    /// Label value used for the `direction` label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the connected ports gauge.
pub fn inc_connected_ports() {
    #[cfg(feature = "metrics")]
    {
        gauge!(PORTS_CONNECTED).increment(1.0);
    }
}

/// Decrement the connected ports gauge.
pub fn dec_connected_ports() {
    #[cfg(feature = "metrics")]
    {
        gauge!(PORTS_CONNECTED).decrement(1.0);
    }
}

/// Record `bytes` moved in `direction`.
pub fn add_bytes(direction: Direction, bytes: u64) {
    #[cfg(feature = "metrics")]
    {
        counter!(BYTES_TOTAL, "direction" => direction.as_str()).increment(bytes);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (direction, bytes);
}

/// Record messages moved in `direction`.
pub fn add_messages(direction: Direction, count: u64) {
    #[cfg(feature = "metrics")]
    {
        counter!(MESSAGES_TOTAL, "direction" => direction.as_str()).increment(count);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (direction, count);
}

/// Record errors observed in `direction`.
pub fn add_errors(direction: Direction, count: u64) {
    #[cfg(feature = "metrics")]
    {
        counter!(ERRORS_TOTAL, "direction" => direction.as_str()).increment(count);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (direction, count);
}

/// Record decoded frames.
pub fn add_parsed(count: u64) {
    #[cfg(feature = "metrics")]
    {
        counter!(PARSED_TOTAL).increment(count);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}
