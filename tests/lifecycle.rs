//! Port and router lifecycle under contention.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use linkroute::{
    ConfigError,
    Connection,
    ConnectionString,
    LinkWriter,
    Port,
    PortContext,
    PortLink,
    PortStatus,
    PortTransport,
    Router,
    TransportError,
    protocol::example,
    router::port_for,
};
use linkroute_testing::{LoggerHandle, RecordingWriter, WAIT_LIMIT, logger, wait_for_status, wait_until};
use rstest::rstest;
use serial_test::serial;
use tokio::sync::Notify;

/// Transport whose `open` blocks until released.
#[derive(Debug, Default)]
struct GatedTransport {
    gate: Arc<Notify>,
    opens: Arc<AtomicUsize>,
}

#[async_trait]
impl PortTransport for GatedTransport {
    async fn open(&self, _link: PortLink) -> Result<(), TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        Ok(())
    }
}

#[derive(Debug)]
struct IdleTransport;

#[async_trait]
impl PortTransport for IdleTransport {
    async fn open(&self, _link: PortLink) -> Result<(), TransportError> { Ok(()) }
}

fn idle_port(cs: &ConnectionString, context: PortContext) -> Result<Arc<Port>, ConfigError> {
    port_for(cs, context, IdleTransport)
}

fn router() -> Arc<Router> {
    Router::builder()
        .protocols(example::protocols())
        .factory("mem", idle_port)
        .build()
}

#[rstest]
#[serial(port_logs)]
#[tokio::test]
async fn contended_calls_are_logged_and_ignored(mut logger: LoggerHandle) {
    let transport = GatedTransport::default();
    let (gate, opens) = (Arc::clone(&transport.gate), Arc::clone(&transport.opens));
    let gated = move |cs: &ConnectionString, context: PortContext| {
        port_for(
            cs,
            context,
            GatedTransport {
                gate: Arc::clone(&transport.gate),
                opens: Arc::clone(&transport.opens),
            },
        )
    };
    let router = Router::builder()
        .protocols(example::protocols())
        .factory("gated", gated)
        .build();
    let port = router.add_port("gated://slow?name=slow").expect("add");
    assert!(wait_until(WAIT_LIMIT, || opens.load(Ordering::SeqCst) == 1).await);
    logger.clear();

    port.disable();
    port.enable().await;

    let ignored = logger.matching(&["port=slow", "reason=busy"]);
    assert_eq!(ignored.len(), 2, "captured: {ignored:?}");
    assert!(ignored.iter().any(|m| m.starts_with("port disable ignored")));
    assert!(ignored.iter().any(|m| m.starts_with("port enable ignored")));
    assert!(port.is_enabled());
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    gate.notify_one();
    assert!(wait_for_status(&port, PortStatus::Connected).await);
    router.dispose_async().await;
}

#[rstest]
#[case(4, 50)]
#[case(16, 25)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn endpoint_churn_across_tasks_ends_empty(#[case] tasks: usize, #[case] rounds: usize) {
    let router = router();
    let port = router.add_port("mem://churn").expect("add");
    assert!(wait_for_status(&port, PortStatus::Connected).await);

    let handles: Vec<_> = (0..tasks)
        .map(|task| {
            let port = Arc::clone(&port);
            tokio::spawn(async move {
                for round in 0..rounds {
                    let writer: Arc<dyn LinkWriter> = RecordingWriter::new();
                    let endpoint = port.create_endpoint(&format!("{task}-{round}"), writer);
                    assert!(port.attach_endpoint(Arc::clone(&endpoint)));
                    tokio::task::yield_now().await;
                    assert!(port.detach_endpoint(endpoint.id()).is_some());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.expect("churn task");
    }

    assert_eq!(port.endpoint_count(), 0);
    router.dispose_async().await;
}

#[rstest]
#[tokio::test]
async fn disposing_router_twice_is_harmless() {
    let router = router();
    let ports: Vec<_> = (0..3)
        .map(|i| router.add_port(&format!("mem://p{i}")).expect("add"))
        .collect();
    router.dispose();
    router.dispose();
    router.dispose_async().await;

    assert!(ports.iter().all(|p| p.status() == PortStatus::Disabled));
    assert!(router.ports().is_empty());
    assert!(router.add_port("mem://late").is_ok_and(|p| p.is_disposed()));
}
