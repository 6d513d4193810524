//! Byte-at-a-time parser for the reference framing.

use std::sync::Arc;

use tracing::trace;

use super::{HEADER_SIZE, MAX_PAYLOAD_SIZE, frame_size};
use crate::{
    error::FramingError,
    message::{Message, MessageRegistry, ProtocolInfo},
    parser::ProtocolParser,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Hunting for the sync byte; other bytes are skipped.
    Sync,
    Id,
    Len,
    Payload { remaining: usize },
    Crc,
}

/// [`ProtocolParser`] for `SYNC | ID | LEN | PAYLOAD | CRC` frames.
///
/// Identifiers are checked against the protocol's [`MessageRegistry`] as soon
/// as they are read, so an unknown id is reported immediately instead of
/// after the payload has been buffered.
pub struct SyncFrameParser {
    sync: u8,
    registry: Arc<MessageRegistry<u8>>,
    buf: Vec<u8>,
    state: State,
}

impl SyncFrameParser {
    /// Create a parser that recognises frames starting with `sync`.
    #[must_use]
    pub fn new(sync: u8, registry: Arc<MessageRegistry<u8>>) -> Self {
        Self {
            sync,
            registry,
            buf: Vec::with_capacity(frame_size(MAX_PAYLOAD_SIZE)),
            state: State::Sync,
        }
    }

    fn complete(&mut self) -> Result<Option<Box<dyn Message>>, FramingError> {
        let result = self.registry.create(&self.buf[1]).and_then(|mut message| {
            message.deserialize(&self.buf)?;
            Ok(message)
        });
        self.reset();
        result.map(Some)
    }

    fn fail(&mut self, error: FramingError) -> Result<Option<Box<dyn Message>>, FramingError> {
        trace!(protocol = %self.registry.protocol(), %error, "frame rejected");
        self.reset();
        Err(error)
    }
}

impl ProtocolParser for SyncFrameParser {
    fn protocol(&self) -> &ProtocolInfo { self.registry.protocol() }

    fn push(&mut self, byte: u8) -> Result<Option<Box<dyn Message>>, FramingError> {
        match self.state {
            State::Sync => {
                if byte == self.sync {
                    self.buf.clear();
                    self.buf.push(byte);
                    self.state = State::Id;
                }
            }
            State::Id => {
                if !self.registry.contains(&byte) {
                    let error = FramingError::UnsupportedId {
                        protocol: self.registry.protocol().id().to_owned(),
                        id: byte.to_string(),
                    };
                    let result = self.fail(error);
                    // The rejected byte may itself open the next frame.
                    if byte == self.sync {
                        self.buf.push(byte);
                        self.state = State::Id;
                    }
                    return result;
                }
                self.buf.push(byte);
                self.state = State::Len;
            }
            State::Len => {
                self.buf.push(byte);
                self.state = match usize::from(byte) {
                    0 => State::Crc,
                    remaining => State::Payload { remaining },
                };
            }
            State::Payload { remaining } => {
                self.buf.push(byte);
                self.state = if remaining == 1 {
                    State::Crc
                } else {
                    State::Payload {
                        remaining: remaining - 1,
                    }
                };
            }
            State::Crc => {
                self.buf.push(byte);
                debug_assert!(self.buf.len() > HEADER_SIZE, "crc read before header");
                return self.complete();
            }
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.state = State::Sync;
    }
}
