//! The `example` protocol used by tests, the demo binary and the virtual
//! connection.
//!
//! Frames follow the reference layout from [`crate::frame`] with sync byte
//! [`SYNC`]. Three message types are defined; further ones can be added by
//! implementing [`ExampleMessage`] and registering them in a custom
//! [`MessageRegistry`].

use std::{
    any::Any,
    fmt,
    sync::{Arc, LazyLock},
};

use bytes::{BufMut, BytesMut};

use crate::{
    error::FramingError,
    frame::{self, SyncFrameParser},
    message::{Message, MessageRegistry, ProtocolInfo, Tags},
    parser::{ParserFactory, ProtocolParser, Protocols},
};

/// Sync byte opening every example frame.
pub const SYNC: u8 = 0xA5;

static INFO: LazyLock<ProtocolInfo> =
    LazyLock::new(|| ProtocolInfo::new("example", "Example protocol"));

static REGISTRY: LazyLock<Arc<MessageRegistry<u8>>> = LazyLock::new(|| {
    Arc::new(
        MessageRegistry::new(INFO.clone())
            .with(ExampleMessage1::ID, || Box::new(ExampleMessage1::default()))
            .with(ExampleMessage2::ID, || Box::new(ExampleMessage2::default()))
            .with(ExampleMessage3::ID, || Box::new(ExampleMessage3::default())),
    )
});

/// Identity of the example protocol.
#[must_use]
pub fn info() -> &'static ProtocolInfo { &INFO }

/// Registry of the built-in example messages.
#[must_use]
pub fn registry() -> Arc<MessageRegistry<u8>> { Arc::clone(&REGISTRY) }

/// Parser factory for the built-in example messages.
#[must_use]
pub fn parser_factory() -> ParserFactory { parser_factory_with(registry()) }

/// Parser factory for a custom registry sharing the example framing.
#[must_use]
pub fn parser_factory_with(registry: Arc<MessageRegistry<u8>>) -> ParserFactory {
    Arc::new(move || -> Box<dyn ProtocolParser> {
        Box::new(SyncFrameParser::new(SYNC, Arc::clone(&registry)))
    })
}

/// A protocol set containing only the example protocol.
#[must_use]
pub fn protocols() -> Protocols { Protocols::new().with(info().clone(), parser_factory()) }

/// Body of an example protocol message.
///
/// Implementors get [`Message`] for free: the blanket implementation wraps
/// the payload in an example frame.
pub trait ExampleMessage: fmt::Debug + Send + Sync + 'static {
    /// Frame identifier.
    const ID: u8;
    /// Message name.
    const NAME: &'static str;

    /// Bytes written by [`ExampleMessage::write_payload`].
    fn payload_size(&self) -> usize;

    /// Append the payload.
    fn write_payload(&self, dst: &mut BytesMut);

    /// Read the payload.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::InvalidPayload`] if `src` is not a valid body.
    fn read_payload(&mut self, src: &[u8]) -> Result<(), FramingError>;

    /// Tags attached to this instance.
    fn message_tags(&self) -> &Tags;
}

impl<T: ExampleMessage> Message for T {
    fn protocol(&self) -> &ProtocolInfo { info() }

    fn name(&self) -> &'static str { T::NAME }

    fn byte_size(&self) -> usize { frame::frame_size(self.payload_size()) }

    fn serialize(&self, dst: &mut BytesMut) -> Result<(), FramingError> {
        frame::encode_frame(SYNC, T::ID, dst, |buf| self.write_payload(buf)).map(|_| ())
    }

    fn deserialize(&mut self, src: &[u8]) -> Result<usize, FramingError> {
        let view = frame::decode_frame(SYNC, src)?;
        if view.id != T::ID {
            return Err(FramingError::IdMismatch {
                expected: T::ID,
                actual: view.id,
            });
        }
        self.read_payload(view.payload)?;
        Ok(view.wire_len())
    }

    fn tags(&self) -> &Tags { self.message_tags() }

    fn as_any(&self) -> &dyn Any { self }
}

fn invalid(message: &'static str, reason: impl Into<String>) -> FramingError {
    FramingError::InvalidPayload {
        message,
        reason: reason.into(),
    }
}

/// Single byte value.
#[derive(Debug, Default, Clone)]
pub struct ExampleMessage1 {
    /// Carried value.
    pub value: u8,
    tags: Tags,
}

impl ExampleMessage1 {
    /// Create a message carrying `value`.
    #[must_use]
    pub fn new(value: u8) -> Self {
        Self {
            value,
            tags: Tags::new(),
        }
    }
}

impl PartialEq for ExampleMessage1 {
    fn eq(&self, other: &Self) -> bool { self.value == other.value }
}

impl ExampleMessage for ExampleMessage1 {
    const ID: u8 = 1;
    const NAME: &'static str = "ExampleMessage1";

    fn payload_size(&self) -> usize { 1 }

    fn write_payload(&self, dst: &mut BytesMut) { dst.put_u8(self.value); }

    fn read_payload(&mut self, src: &[u8]) -> Result<(), FramingError> {
        let [value] = src else {
            return Err(invalid(Self::NAME, format!("expected 1 byte, got {}", src.len())));
        };
        self.value = *value;
        Ok(())
    }

    fn message_tags(&self) -> &Tags { &self.tags }
}

/// Little-endian `u16` plus a boolean flag.
#[derive(Debug, Default, Clone)]
pub struct ExampleMessage2 {
    /// Carried value.
    pub value: u16,
    /// Carried flag.
    pub flag: bool,
    tags: Tags,
}

impl ExampleMessage2 {
    /// Create a message carrying `value` and `flag`.
    #[must_use]
    pub fn new(value: u16, flag: bool) -> Self {
        Self {
            value,
            flag,
            tags: Tags::new(),
        }
    }
}

impl PartialEq for ExampleMessage2 {
    fn eq(&self, other: &Self) -> bool { self.value == other.value && self.flag == other.flag }
}

impl ExampleMessage for ExampleMessage2 {
    const ID: u8 = 2;
    const NAME: &'static str = "ExampleMessage2";

    fn payload_size(&self) -> usize { 3 }

    fn write_payload(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.value);
        dst.put_u8(u8::from(self.flag));
    }

    fn read_payload(&mut self, src: &[u8]) -> Result<(), FramingError> {
        let [lo, hi, flag] = src else {
            return Err(invalid(Self::NAME, format!("expected 3 bytes, got {}", src.len())));
        };
        self.value = u16::from_le_bytes([*lo, *hi]);
        self.flag = match flag {
            0 => false,
            1 => true,
            other => return Err(invalid(Self::NAME, format!("flag byte {other:#04x}"))),
        };
        Ok(())
    }

    fn message_tags(&self) -> &Tags { &self.tags }
}

/// Variable length byte string of at most 255 bytes.
#[derive(Debug, Default, Clone)]
pub struct ExampleMessage3 {
    /// Carried bytes.
    pub data: Vec<u8>,
    tags: Tags,
}

impl ExampleMessage3 {
    /// Create a message carrying `data`.
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            tags: Tags::new(),
        }
    }
}

impl PartialEq for ExampleMessage3 {
    fn eq(&self, other: &Self) -> bool { self.data == other.data }
}

impl ExampleMessage for ExampleMessage3 {
    const ID: u8 = 3;
    const NAME: &'static str = "ExampleMessage3";

    fn payload_size(&self) -> usize { self.data.len() }

    fn write_payload(&self, dst: &mut BytesMut) { dst.put_slice(&self.data); }

    fn read_payload(&mut self, src: &[u8]) -> Result<(), FramingError> {
        self.data = src.to_vec();
        Ok(())
    }

    fn message_tags(&self) -> &Tags { &self.tags }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::parser::ParseEvent;

    fn encode(message: &dyn Message) -> BytesMut {
        let mut buf = BytesMut::new();
        message.serialize(&mut buf).expect("serialize");
        buf
    }

    #[test]
    fn message1_has_reference_layout() {
        let bytes = encode(&ExampleMessage1::new(0x42));
        assert_eq!(&bytes[..], &[SYNC, 1, 1, 0x42, 1 ^ 1 ^ 0x42]);
    }

    #[rstest]
    #[case(Box::new(ExampleMessage1::new(7)) as Box<dyn Message>)]
    #[case(Box::new(ExampleMessage2::new(0xBEEF, true)) as Box<dyn Message>)]
    #[case(Box::new(ExampleMessage3::new(*b"hello")) as Box<dyn Message>)]
    #[case(Box::new(ExampleMessage3::new(Vec::new())) as Box<dyn Message>)]
    fn serialized_length_matches_byte_size(#[case] message: Box<dyn Message>) {
        assert_eq!(encode(message.as_ref()).len(), message.byte_size());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let message = ExampleMessage3::new(vec![0; 256]);
        let mut buf = BytesMut::from(&b"keep"[..]);
        let err = message.serialize(&mut buf).expect_err("256 bytes cannot be framed");
        assert!(matches!(err, FramingError::PayloadTooLarge { size: 256, .. }));
        assert_eq!(&buf[..], b"keep");
    }

    #[test]
    fn deserialize_rejects_foreign_id() {
        let bytes = encode(&ExampleMessage1::new(1));
        let mut target = ExampleMessage2::default();
        let err = target.deserialize(&bytes).expect_err("wrong id");
        assert_eq!(err, FramingError::IdMismatch { expected: 2, actual: 1 });
    }

    #[test]
    fn invalid_flag_is_reported() {
        let mut buf = BytesMut::new();
        frame::encode_frame(SYNC, ExampleMessage2::ID, &mut buf, |b| b.put_slice(&[0, 0, 9]))
            .expect("encode");
        let mut target = ExampleMessage2::default();
        assert!(matches!(
            target.deserialize(&buf),
            Err(FramingError::InvalidPayload { message: "ExampleMessage2", .. })
        ));
    }

    #[test]
    fn parser_decodes_back_to_back_frames_among_noise() {
        let mut stream = BytesMut::from(&[0x00, 0x13][..]);
        ExampleMessage1::new(9).serialize(&mut stream).expect("serialize");
        stream.put_u8(0x77);
        ExampleMessage2::new(513, false).serialize(&mut stream).expect("serialize");

        let mut set = protocols().parser_set();
        let messages: Vec<_> = set
            .push_slice(&stream)
            .into_iter()
            .map(|event| match event {
                ParseEvent::Message(message) => message,
                ParseEvent::Error(error) => panic!("unexpected framing error: {error}"),
            })
            .collect();

        assert_eq!(messages.len(), 2);
        let first = messages[0].as_ref() as &dyn Message;
        assert_eq!(first.downcast_ref::<ExampleMessage1>(), Some(&ExampleMessage1::new(9)));
        let second = messages[1].as_ref() as &dyn Message;
        assert_eq!(
            second.downcast_ref::<ExampleMessage2>(),
            Some(&ExampleMessage2::new(513, false))
        );
    }

    #[test]
    fn parser_reports_unknown_id_and_resynchronises() {
        let mut stream = BytesMut::from(&[SYNC, 0x63][..]);
        ExampleMessage1::new(3).serialize(&mut stream).expect("serialize");
        let events = protocols().parser_set().push_slice(&stream);
        assert!(matches!(
            &events[0],
            ParseEvent::Error(FramingError::UnsupportedId { id, .. }) if id == "99"
        ));
        assert!(matches!(&events[1], ParseEvent::Message(m) if m.name() == "ExampleMessage1"));
    }

    fn arb_message() -> impl Strategy<Value = Box<dyn Message>> {
        prop_oneof![
            any::<u8>().prop_map(|v| Box::new(ExampleMessage1::new(v)) as Box<dyn Message>),
            (any::<u16>(), any::<bool>())
                .prop_map(|(v, f)| Box::new(ExampleMessage2::new(v, f)) as Box<dyn Message>),
            proptest::collection::vec(any::<u8>(), 0..=255)
                .prop_map(|d| Box::new(ExampleMessage3::new(d)) as Box<dyn Message>),
        ]
    }

    fn same_fields(a: &dyn Message, b: &dyn Message) -> bool {
        if let (Some(x), Some(y)) = (a.downcast_ref::<ExampleMessage1>(), b.downcast_ref::<ExampleMessage1>()) {
            return x == y;
        }
        if let (Some(x), Some(y)) = (a.downcast_ref::<ExampleMessage2>(), b.downcast_ref::<ExampleMessage2>()) {
            return x == y;
        }
        if let (Some(x), Some(y)) = (a.downcast_ref::<ExampleMessage3>(), b.downcast_ref::<ExampleMessage3>()) {
            return x == y;
        }
        false
    }

    proptest! {
        #[test]
        fn parsed_frames_equal_their_source(message in arb_message()) {
            let bytes = encode(message.as_ref());
            prop_assert_eq!(bytes.len(), message.byte_size());
            let events = protocols().parser_set().push_slice(&bytes);
            prop_assert_eq!(events.len(), 1);
            let ParseEvent::Message(decoded) = &events[0] else {
                return Err(TestCaseError::fail("expected a message"));
            };
            prop_assert!(same_fields(message.as_ref(), decoded.as_ref()));
        }

        #[test]
        fn corrupted_payload_byte_is_rejected(
            data in proptest::collection::vec(any::<u8>(), 1..=64),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut bytes = encode(&ExampleMessage3::new(data.clone()));
            let offset = frame::HEADER_SIZE + index.index(data.len());
            bytes[offset] ^= flip;
            let mut target = ExampleMessage3::default();
            let result = target.deserialize(&bytes);
            prop_assert!(
                matches!(result, Err(FramingError::ChecksumMismatch { .. })),
                "corruption accepted: {:?}",
                result
            );
        }
    }
}
