//! Reconnect timing driven by a virtual clock.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use linkroute::{
    ManualTime,
    Port,
    PortConfig,
    PortContext,
    PortEvent,
    PortLink,
    PortStatus,
    PortTransport,
    TransportError,
    protocol::example,
};
use linkroute_testing::{WAIT_LIMIT, wait_until};
use rstest::{fixture, rstest};
use tokio::sync::broadcast;

const TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct FlakyTransport {
    healthy: AtomicBool,
    opens: AtomicUsize,
}

#[async_trait]
impl PortTransport for FlakyTransport {
    async fn open(&self, _link: PortLink) -> Result<(), TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused).into())
        }
    }
}

struct Harness {
    clock: ManualTime,
    transport: Arc<FlakyTransport>,
    port: Arc<Port>,
}

impl Harness {
    fn opens(&self) -> usize { self.transport.opens.load(Ordering::SeqCst) }

    async fn settle(&self, opens: usize) -> bool {
        wait_until(WAIT_LIMIT, || {
            self.opens() == opens && self.port.status() != PortStatus::Connecting && self.clock.pending_timers() <= 1
        })
        .await
    }
}

#[fixture]
fn harness() -> Harness {
    let clock = ManualTime::new();
    let transport = Arc::new(FlakyTransport::default());
    let context = PortContext::new(example::protocols()).with_time(Arc::new(clock.clone()));
    let port = Port::new(
        PortConfig::new("flaky").with_reconnect_timeout(TIMEOUT),
        Arc::clone(&transport) as Arc<dyn PortTransport>,
        context,
    );
    Harness { clock, transport, port }
}

fn statuses(events: &mut broadcast::Receiver<PortEvent>) -> Vec<PortStatus> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PortEvent::StatusChanged { to, .. } = event {
            seen.push(to);
        }
    }
    seen
}

#[rstest]
#[tokio::test]
async fn failed_open_retries_once_per_timeout(harness: Harness) {
    let mut events = harness.port.events();
    harness.port.enable().await;
    assert_eq!(statuses(&mut events), [PortStatus::Connecting, PortStatus::Error]);
    assert_eq!(harness.clock.pending_timers(), 1);

    assert_eq!(harness.clock.advance(TIMEOUT - Duration::from_millis(1)), 0);
    tokio::task::yield_now().await;
    assert_eq!(harness.opens(), 1);
    assert!(statuses(&mut events).is_empty());

    assert_eq!(harness.clock.advance(Duration::from_millis(1)), 1);
    assert!(harness.settle(2).await, "exactly one retry expected");
    assert_eq!(statuses(&mut events), [PortStatus::Connecting, PortStatus::Error]);
    assert_eq!(harness.clock.pending_timers(), 1);

    harness.port.dispose_async().await;
}

#[rstest]
#[tokio::test]
async fn retry_succeeds_once_the_link_recovers(harness: Harness) {
    harness.port.enable().await;
    harness.transport.healthy.store(true, Ordering::SeqCst);

    harness.clock.advance(TIMEOUT);
    assert!(harness.settle(2).await);
    assert_eq!(harness.port.status(), PortStatus::Connected);
    assert_eq!(harness.clock.pending_timers(), 0);

    harness.port.dispose_async().await;
}

#[rstest]
#[tokio::test]
async fn disable_cancels_the_pending_retry(harness: Harness) {
    harness.port.enable().await;
    harness.port.disable();
    assert!(wait_until(WAIT_LIMIT, || harness.clock.pending_timers() == 0).await);

    assert_eq!(harness.clock.advance(TIMEOUT * 4), 0);
    tokio::task::yield_now().await;
    assert_eq!(harness.opens(), 1);
    assert_eq!(harness.port.status(), PortStatus::Disabled);
}

#[rstest]
#[tokio::test]
async fn manual_enable_replaces_the_pending_retry(harness: Harness) {
    harness.port.enable().await;
    harness.port.enable().await;
    assert!(harness.settle(2).await);
    assert_eq!(harness.clock.pending_timers(), 1, "one outstanding timer at most");

    assert_eq!(harness.clock.advance(TIMEOUT), 1);
    assert!(harness.settle(3).await);
    harness.port.dispose_async().await;
}
