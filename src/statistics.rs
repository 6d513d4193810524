//! Traffic counters attached to every connection.
//!
//! Counters form a tree mirroring ownership: an endpoint's statistics are a
//! child of its port's, and a port's a child of its router's. Every increment
//! is applied to the object it was made on and to each ancestor, so a parent
//! always reads the sum of its children. Counters only grow and are read
//! without locking; no snapshot is atomic across fields.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::Serialize;

use crate::metrics::{self, Direction};

/// Individual counter in a [`Statistics`] set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Bytes read from the link.
    RxBytes,
    /// Bytes written to the link.
    TxBytes,
    /// Messages that passed the receive pipeline.
    RxMessages,
    /// Messages confirmed written to the link.
    TxMessages,
    /// Framing and receive-side transport errors.
    RxErrors,
    /// Failed writes.
    TxErrors,
    /// Frames decoded by a parser, before any feature ran.
    ParsedMessages,
}

impl Counter {
    /// Every counter, in storage order.
    pub const ALL: [Counter; 7] = [
        Counter::RxBytes,
        Counter::TxBytes,
        Counter::RxMessages,
        Counter::TxMessages,
        Counter::RxErrors,
        Counter::TxErrors,
        Counter::ParsedMessages,
    ];

    fn index(self) -> usize {
        match self {
            Counter::RxBytes => 0,
            Counter::TxBytes => 1,
            Counter::RxMessages => 2,
            Counter::TxMessages => 3,
            Counter::RxErrors => 4,
            Counter::TxErrors => 5,
            Counter::ParsedMessages => 6,
        }
    }

    fn record_metric(self, amount: u64) {
        match self {
            Counter::RxBytes => metrics::add_bytes(Direction::Inbound, amount),
            Counter::TxBytes => metrics::add_bytes(Direction::Outbound, amount),
            Counter::RxMessages => metrics::add_messages(Direction::Inbound, amount),
            Counter::TxMessages => metrics::add_messages(Direction::Outbound, amount),
            Counter::RxErrors => metrics::add_errors(Direction::Inbound, amount),
            Counter::TxErrors => metrics::add_errors(Direction::Outbound, amount),
            Counter::ParsedMessages => metrics::add_parsed(amount),
        }
    }
}

/// Atomic counters for one connection.
#[derive(Default)]
pub struct Statistics {
    counters: [AtomicU64; 7],
    parent: Option<Arc<Statistics>>,
}

impl Statistics {
    /// Create a statistics set with no parent.
    #[must_use]
    pub fn root() -> Arc<Self> { Arc::new(Self::default()) }

    /// Create a statistics set whose increments also apply to `parent`.
    #[must_use]
    pub fn child(parent: &Arc<Statistics>) -> Arc<Self> {
        Arc::new(Self {
            counters: Default::default(),
            parent: Some(Arc::clone(parent)),
        })
    }

    /// Parent set, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Statistics>> { self.parent.as_ref() }

    /// Add `amount` to `counter` here and on every ancestor.
    ///
    /// The global metric is recorded once, for the set the increment
    /// originated on.
    pub fn add(&self, counter: Counter, amount: u64) {
        if amount == 0 {
            return;
        }
        counter.record_metric(amount);
        let mut current = Some(self);
        while let Some(stats) = current {
            stats.counters[counter.index()].fetch_add(amount, Ordering::Relaxed);
            current = stats.parent.as_deref();
        }
    }

    /// Add one to `counter`.
    pub fn increment(&self, counter: Counter) { self.add(counter, 1); }

    /// Current value of `counter`.
    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 { self.counters[counter.index()].load(Ordering::Relaxed) }

    /// Bytes read from the transport.
    #[must_use]
    pub fn rx_bytes(&self) -> u64 { self.get(Counter::RxBytes) }

    /// Bytes of frames written to the transport.
    #[must_use]
    pub fn tx_bytes(&self) -> u64 { self.get(Counter::TxBytes) }

    /// Messages decoded and delivered.
    #[must_use]
    pub fn rx_messages(&self) -> u64 { self.get(Counter::RxMessages) }

    /// Messages written after the Tx pipeline.
    #[must_use]
    pub fn tx_messages(&self) -> u64 { self.get(Counter::TxMessages) }

    /// Framing errors raised while parsing.
    #[must_use]
    pub fn rx_errors(&self) -> u64 { self.get(Counter::RxErrors) }

    /// Failed serialisations or writes.
    #[must_use]
    pub fn tx_errors(&self) -> u64 { self.get(Counter::TxErrors) }

    /// Messages produced by any parser, before the Rx pipeline.
    #[must_use]
    pub fn parsed_messages(&self) -> u64 { self.get(Counter::ParsedMessages) }

    /// Field-by-field copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            rx_bytes: self.rx_bytes(),
            tx_bytes: self.tx_bytes(),
            rx_messages: self.rx_messages(),
            tx_messages: self.tx_messages(),
            rx_errors: self.rx_errors(),
            tx_errors: self.tx_errors(),
            parsed_messages: self.parsed_messages(),
        }
    }
}

impl fmt::Debug for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statistics")
            .field("counters", &self.snapshot())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

/// Plain copy of a [`Statistics`] set for logging and assertions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_messages: u64,
    pub tx_messages: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub parsed_messages: u64,
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx_bytes={} tx_bytes={} rx_messages={} tx_messages={} rx_errors={} tx_errors={} \
             parsed={}",
            self.rx_bytes,
            self.tx_bytes,
            self.rx_messages,
            self.tx_messages,
            self.rx_errors,
            self.tx_errors,
            self.parsed_messages
        )
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use rstest::rstest;

    use super::*;

    #[test]
    fn increments_propagate_to_every_ancestor() {
        let router = Statistics::root();
        let port = Statistics::child(&router);
        let endpoint_a = Statistics::child(&port);
        let endpoint_b = Statistics::child(&port);

        endpoint_a.add(Counter::RxBytes, 10);
        endpoint_b.add(Counter::RxBytes, 5);
        endpoint_b.increment(Counter::RxMessages);

        assert_eq!(endpoint_a.rx_bytes(), 10);
        assert_eq!(port.rx_bytes(), 15);
        assert_eq!(router.rx_bytes(), 15);
        assert_eq!(router.rx_messages(), 1);
        assert_eq!(endpoint_a.rx_messages(), 0);
    }

    #[test]
    fn parent_increments_do_not_reach_children() {
        let port = Statistics::root();
        let endpoint = Statistics::child(&port);
        port.increment(Counter::TxErrors);
        assert_eq!(endpoint.tx_errors(), 0);
        assert_eq!(port.tx_errors(), 1);
    }

    #[rstest]
    #[case(Counter::RxBytes)]
    #[case(Counter::TxBytes)]
    #[case(Counter::RxMessages)]
    #[case(Counter::TxMessages)]
    #[case(Counter::RxErrors)]
    #[case(Counter::TxErrors)]
    #[case(Counter::ParsedMessages)]
    fn counters_are_independent(#[case] counter: Counter) {
        let stats = Statistics::root();
        stats.add(counter, 3);
        for other in Counter::ALL {
            let expected = if other == counter { 3 } else { 0 };
            assert_eq!(stats.get(other), expected, "{other:?}");
        }
    }

    #[test]
    fn concurrent_increments_sum_exactly() {
        let root = Statistics::root();
        let children: Vec<_> = (0..4).map(|_| Statistics::child(&root)).collect();
        thread::scope(|scope| {
            for child in &children {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        child.increment(Counter::TxMessages);
                    }
                });
            }
        });
        assert_eq!(root.tx_messages(), 4000);
    }

    #[test]
    fn snapshot_copies_all_fields() {
        let stats = Statistics::root();
        stats.add(Counter::TxBytes, 7);
        stats.increment(Counter::ParsedMessages);
        let snapshot = stats.snapshot();
        assert_eq!(
            snapshot,
            StatisticsSnapshot {
                tx_bytes: 7,
                parsed_messages: 1,
                ..StatisticsSnapshot::default()
            }
        );
        assert!(snapshot.to_string().contains("tx_bytes=7"));
    }
}
