//! Byte-level protocol parsers and the per-endpoint parser set.
//!
//! A [`ProtocolParser`] consumes one byte at a time and yields a message once
//! a complete, checksum-valid frame has been assembled. An endpoint owns one
//! parser per registered protocol in a [`ParserSet`]; only one protocol may
//! own a given stretch of bytes, so the whole set is reset as soon as any
//! parser completes a frame.

use std::{fmt, sync::Arc};

use crate::{
    error::FramingError,
    message::{Message, ProtocolInfo},
};

/// Framing state machine for one protocol family.
pub trait ProtocolParser: Send {
    /// Protocol decoded by this parser.
    fn protocol(&self) -> &ProtocolInfo;

    /// Feed one byte.
    ///
    /// Returns `Ok(Some(message))` when a frame completed; the parser has
    /// already reset. Returns `Ok(None)` while accumulating.
    ///
    /// # Errors
    ///
    /// Returns a [`FramingError`] on desync. The parser resets and is ready
    /// for the next byte.
    fn push(&mut self, byte: u8) -> Result<Option<Box<dyn Message>>, FramingError>;

    /// Discard any partially assembled frame.
    fn reset(&mut self);
}

/// Constructor producing a fresh parser for each endpoint.
pub type ParserFactory = Arc<dyn Fn() -> Box<dyn ProtocolParser> + Send + Sync>;

/// Protocols a connection understands, in registration order.
#[derive(Clone, Default)]
pub struct Protocols {
    entries: Vec<(ProtocolInfo, ParserFactory)>,
}

impl Protocols {
    /// Create an empty protocol set.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Add a protocol, builder style.
    #[must_use]
    pub fn with(mut self, info: ProtocolInfo, factory: ParserFactory) -> Self {
        self.register(info, factory);
        self
    }

    /// Add a protocol. A protocol with the same info replaces the earlier
    /// registration in place.
    pub fn register(&mut self, info: ProtocolInfo, factory: ParserFactory) {
        if let Some(slot) = self.entries.iter_mut().find(|(known, _)| *known == info) {
            slot.1 = factory;
        } else {
            self.entries.push((info, factory));
        }
    }

    /// Returns true if a protocol with `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool { self.entries.iter().any(|(info, _)| info.id() == id) }

    /// Registered protocol identities.
    pub fn iter(&self) -> impl Iterator<Item = &ProtocolInfo> { self.entries.iter().map(|(info, _)| info) }

    /// Number of protocols.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Returns true if no protocol is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Build one parser per protocol for a new endpoint.
    #[must_use]
    pub fn parser_set(&self) -> ParserSet {
        ParserSet {
            parsers: self.entries.iter().map(|(_, factory)| factory()).collect(),
        }
    }
}

impl fmt::Debug for Protocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Outcome of feeding bytes to a [`ParserSet`].
#[derive(Debug)]
pub enum ParseEvent {
    /// A complete message was decoded.
    Message(Box<dyn Message>),
    /// A parser rejected a frame.
    Error(FramingError),
}

/// Parsers owned by a single endpoint.
pub struct ParserSet {
    parsers: Vec<Box<dyn ProtocolParser>>,
}

impl ParserSet {
    /// Number of parsers in the set.
    #[must_use]
    pub fn len(&self) -> usize { self.parsers.len() }

    /// Returns true if the set holds no parsers.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.parsers.is_empty() }

    /// Offer `byte` to every parser in registration order.
    ///
    /// Decoded messages and framing errors are appended to `out`. Returns
    /// true if any parser completed a frame, in which case every parser in
    /// the set has been reset.
    pub fn push(&mut self, byte: u8, out: &mut Vec<ParseEvent>) -> bool {
        let mut completed = false;
        for parser in &mut self.parsers {
            match parser.push(byte) {
                Ok(Some(message)) => {
                    completed = true;
                    out.push(ParseEvent::Message(message));
                }
                Ok(None) => {}
                Err(error) => out.push(ParseEvent::Error(error)),
            }
        }
        if completed {
            self.reset();
        }
        completed
    }

    /// Feed a whole buffer, collecting every event.
    pub fn push_slice(&mut self, bytes: &[u8]) -> Vec<ParseEvent> {
        let mut out = Vec::new();
        for &byte in bytes {
            self.push(byte, &mut out);
        }
        out
    }

    /// Reset every parser.
    pub fn reset(&mut self) {
        for parser in &mut self.parsers {
            parser.reset();
        }
    }
}

impl fmt::Debug for ParserSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.parsers.iter().map(|parser| parser.protocol()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        any::Any,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use bytes::BytesMut;

    use super::*;
    use crate::message::Tags;

    #[derive(Debug, Default)]
    struct Marker {
        tags: Tags,
    }

    impl Message for Marker {
        fn protocol(&self) -> &ProtocolInfo { unreachable!("not used by parser tests") }

        fn name(&self) -> &'static str { "Marker" }

        fn byte_size(&self) -> usize { 0 }

        fn serialize(&self, _dst: &mut BytesMut) -> Result<(), FramingError> { Ok(()) }

        fn deserialize(&mut self, _src: &[u8]) -> Result<usize, FramingError> { Ok(0) }

        fn tags(&self) -> &Tags { &self.tags }

        fn as_any(&self) -> &dyn Any { self }
    }

    /// Completes a frame every time it sees `trigger`; counts resets.
    struct TriggerParser {
        info: ProtocolInfo,
        trigger: u8,
        resets: Arc<AtomicUsize>,
    }

    impl ProtocolParser for TriggerParser {
        fn protocol(&self) -> &ProtocolInfo { &self.info }

        fn push(&mut self, byte: u8) -> Result<Option<Box<dyn Message>>, FramingError> {
            if byte == self.trigger {
                return Ok(Some(Box::new(Marker::default())));
            }
            if byte == 0xFF {
                return Err(FramingError::TooShort { have: 0, need: 1 });
            }
            Ok(None)
        }

        fn reset(&mut self) { self.resets.fetch_add(1, Ordering::SeqCst); }
    }

    fn trigger_factory(id: &'static str, trigger: u8, resets: &Arc<AtomicUsize>) -> ParserFactory {
        let resets = Arc::clone(resets);
        Arc::new(move || -> Box<dyn ProtocolParser> {
            Box::new(TriggerParser {
                info: ProtocolInfo::new(id, id),
                trigger,
                resets: Arc::clone(&resets),
            })
        })
    }

    #[test]
    fn sibling_parsers_reset_when_one_completes() {
        let a_resets = Arc::new(AtomicUsize::new(0));
        let b_resets = Arc::new(AtomicUsize::new(0));
        let protocols = Protocols::new()
            .with(ProtocolInfo::new("a", "a"), trigger_factory("a", 1, &a_resets))
            .with(ProtocolInfo::new("b", "b"), trigger_factory("b", 2, &b_resets));
        let mut set = protocols.parser_set();

        let events = set.push_slice(&[0, 0, 1]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ParseEvent::Message(_)));
        assert_eq!(a_resets.load(Ordering::SeqCst), 1);
        assert_eq!(b_resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn errors_do_not_reset_siblings() {
        let resets = Arc::new(AtomicUsize::new(0));
        let protocols =
            Protocols::new().with(ProtocolInfo::new("a", "a"), trigger_factory("a", 1, &resets));
        let mut set = protocols.parser_set();
        let events = set.push_slice(&[0xFF]);
        assert!(matches!(events.as_slice(), [ParseEvent::Error(_)]));
        assert_eq!(resets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn registering_same_protocol_replaces_entry() {
        let resets = Arc::new(AtomicUsize::new(0));
        let info = ProtocolInfo::new("a", "a");
        let mut protocols = Protocols::new().with(info.clone(), trigger_factory("a", 1, &resets));
        protocols.register(info, trigger_factory("a", 2, &resets));
        assert_eq!(protocols.len(), 1);
        assert!(protocols.contains("a"));
        let mut set = protocols.parser_set();
        assert!(set.push_slice(&[1]).is_empty());
        assert_eq!(set.push_slice(&[2]).len(), 1);
    }
}
