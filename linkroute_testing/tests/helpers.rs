//! Checks for the shared test helpers.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use linkroute::{LinkWriter, TransportError};
use linkroute_testing::{LoggerHandle, RecordingWriter, logger, wait_until};
use rstest::rstest;

#[tokio::test]
async fn recording_writer_keeps_frames_in_order() {
    let writer = RecordingWriter::new();
    writer.write(&[1, 2]).await.expect("write");
    writer.write(&[3]).await.expect("write");
    assert_eq!(writer.frames(), [vec![1, 2], vec![3]]);
}

#[tokio::test]
async fn failing_writer_reports_closed() {
    let writer = RecordingWriter::failing();
    assert!(matches!(writer.write(&[1]).await, Err(TransportError::Closed)));
    assert!(writer.frames().is_empty());
}

#[tokio::test]
async fn wait_until_gives_up_after_the_limit() {
    let polls = AtomicUsize::new(0);
    let held = wait_until(Duration::from_millis(20), || {
        polls.fetch_add(1, Ordering::Relaxed);
        false
    })
    .await;
    assert!(!held);
    assert!(polls.load(Ordering::Relaxed) > 1);
}

#[rstest]
fn logger_filters_by_fragment(mut logger: LoggerHandle) {
    log::info!("port enabled: port=a");
    log::info!("port enabled: port=b");
    assert_eq!(logger.matching(&["port=b"]), ["port enabled: port=b"]);
    assert!(logger.pop().is_none());
}
