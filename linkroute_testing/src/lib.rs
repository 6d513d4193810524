//! Test helpers for `linkroute`.
//!
//! Log capture, a recording [`LinkWriter`], frame builders and small async
//! waiting utilities shared by the integration tests.
//!
//! ```rust
//! use linkroute::protocol::example::ExampleMessage1;
//! use linkroute_testing::frame_bytes;
//!
//! assert_eq!(frame_bytes(&ExampleMessage1::new(1)).len(), 5);
//! ```

pub mod logging;

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::BytesMut;
use linkroute::{LinkWriter, Message, Port, PortStatus, TransportError};
pub use logging::{LoggerHandle, logger};
use tokio::time::{sleep, timeout};

/// Result type for tests that propagate errors with `?`.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Default bound for the waiting helpers.
pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Serialise `message` into one frame.
///
/// # Panics
///
/// Panics if the message cannot be encoded.
#[must_use]
pub fn frame_bytes(message: &dyn Message) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(message.byte_size());
    message
        .serialize(&mut buf)
        .unwrap_or_else(|e| panic!("failed to encode {}: {e}", message.name()));
    buf.to_vec()
}

/// [`LinkWriter`] remembering every frame written to it.
#[derive(Debug, Default)]
pub struct RecordingWriter {
    frames: Mutex<Vec<Vec<u8>>>,
    fail: bool,
}

impl RecordingWriter {
    /// Writer whose writes succeed.
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::default() }

    /// Writer whose writes fail with [`TransportError::Closed`].
    #[must_use]
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    /// Frames written so far.
    #[must_use]
    pub fn frames(&self) -> Vec<Vec<u8>> { self.frames.lock().unwrap_or_else(PoisonError::into_inner).clone() }
}

#[async_trait]
impl LinkWriter for RecordingWriter {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::Closed);
        }
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes.to_vec());
        Ok(())
    }
}

/// Poll `condition` every millisecond until it holds or `limit` passes.
/// Returns whether it held.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    timeout(limit, async {
        while !condition() {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .is_ok()
}

/// Wait until `port` reports `status`, up to [`WAIT_LIMIT`].
pub async fn wait_for_status(port: &Port, status: PortStatus) -> bool {
    let mut watch = port.watch_status();
    timeout(WAIT_LIMIT, watch.wait_for(|current| *current == status))
        .await
        .is_ok_and(|changed| changed.is_ok())
}
