//! Serial transport.
//!
//! [`SerialConfig`] is always available so connection strings validate the
//! same way on every build. Opening the device needs the `serial` cargo
//! feature; without it `open` fails with [`TransportError::Unavailable`] and
//! the port retries like any other failed link.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::ConnectionString,
    error::{ConfigError, TransportError},
    port::{PortLink, PortTransport},
};

/// Default line speed.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Parity checking mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of data bits per character.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    /// Five bits.
    Five,
    /// Six bits.
    Six,
    /// Seven bits.
    Seven,
    /// Eight bits.
    #[default]
    Eight,
}

/// Number of stop bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    /// One stop bit.
    #[default]
    One,
    /// Two stop bits.
    Two,
}

/// Device and line settings read from `serial://<device>?br=..&parity=..`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub path: String,
    /// Line speed in baud.
    pub baud_rate: u32,
    /// Parity mode.
    pub parity: Parity,
    /// Data bits per character.
    pub data_bits: DataBits,
    /// Stop bits.
    pub stop_bits: StopBits,
}

impl SerialConfig {
    /// 8N1 at the default baud rate.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::default(),
            data_bits: DataBits::default(),
            stop_bits: StopBits::default(),
        }
    }

    /// Read the device from the authority and path of `cs` and the line
    /// settings from `br`, `parity`, `data_bits` and `stop_bits`.
    ///
    /// # Errors
    ///
    /// Fails with [`ConfigError::MissingHost`] when no device is named and
    /// with the matching typed error for a malformed setting.
    pub fn from_connection_string(cs: &ConnectionString) -> Result<Self, ConfigError> {
        let path = format!("{}{}", cs.host().unwrap_or_default(), cs.path());
        if path.is_empty() {
            return Err(ConfigError::MissingHost(cs.as_str().to_owned()));
        }
        Ok(Self {
            path,
            baud_rate: cs.get_int("br", DEFAULT_BAUD_RATE)?,
            parity: cs.get_enum(
                "parity",
                Parity::None,
                &[("none", Parity::None), ("odd", Parity::Odd), ("even", Parity::Even)],
                "none, odd, even",
            )?,
            data_bits: cs.get_enum(
                "data_bits",
                DataBits::Eight,
                &[
                    ("5", DataBits::Five),
                    ("6", DataBits::Six),
                    ("7", DataBits::Seven),
                    ("8", DataBits::Eight),
                ],
                "5, 6, 7, 8",
            )?,
            stop_bits: cs.get_enum(
                "stop_bits",
                StopBits::One,
                &[("one", StopBits::One), ("1", StopBits::One), ("two", StopBits::Two), ("2", StopBits::Two)],
                "one, two",
            )?,
        })
    }
}

/// Opens a serial device as a single-endpoint port.
#[derive(Clone, Debug)]
pub struct SerialTransport {
    config: SerialConfig,
}

impl SerialTransport {
    /// Transport for `config`.
    #[must_use]
    pub fn new(config: SerialConfig) -> Self { Self { config } }

    /// Line settings in use.
    #[must_use]
    pub fn config(&self) -> &SerialConfig { &self.config }
}

#[cfg(feature = "serial")]
mod driver {
    use std::{io, sync::Arc};

    use tokio_serial::SerialPortBuilderExt;

    use super::{DataBits, Parity, SerialConfig, StopBits};
    use crate::{
        endpoint::StreamWriter,
        error::TransportError,
        port::PortLink,
        transport::{OnClose, pump},
    };

    impl From<Parity> for tokio_serial::Parity {
        fn from(value: Parity) -> Self {
            match value {
                Parity::None => Self::None,
                Parity::Odd => Self::Odd,
                Parity::Even => Self::Even,
            }
        }
    }

    impl From<DataBits> for tokio_serial::DataBits {
        fn from(value: DataBits) -> Self {
            match value {
                DataBits::Five => Self::Five,
                DataBits::Six => Self::Six,
                DataBits::Seven => Self::Seven,
                DataBits::Eight => Self::Eight,
            }
        }
    }

    impl From<StopBits> for tokio_serial::StopBits {
        fn from(value: StopBits) -> Self {
            match value {
                StopBits::One => Self::One,
                StopBits::Two => Self::Two,
            }
        }
    }

    pub(super) fn open(config: &SerialConfig, link: &PortLink) -> Result<(), TransportError> {
        let stream = tokio_serial::new(config.path.as_str(), config.baud_rate)
            .parity(config.parity.into())
            .data_bits(config.data_bits.into())
            .stop_bits(config.stop_bits.into())
            .open_native_async()
            .map_err(io::Error::from)?;
        let (reader, writer) = tokio::io::split(stream);
        let Some(endpoint) = link.attach(&config.path, Arc::new(StreamWriter::new(writer))) else {
            return Ok(());
        };
        link.spawn(pump(link.clone(), endpoint, reader, OnClose::Fail));
        Ok(())
    }
}

#[async_trait]
impl PortTransport for SerialTransport {
    #[cfg(feature = "serial")]
    async fn open(&self, link: PortLink) -> Result<(), TransportError> { driver::open(&self.config, &link) }

    #[cfg(not(feature = "serial"))]
    async fn open(&self, link: PortLink) -> Result<(), TransportError> {
        let _ = link;
        Err(TransportError::Unavailable(format!(
            "serial device {} needs the `serial` feature",
            self.config.path
        )))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("serial:///dev/ttyUSB0", "/dev/ttyUSB0")]
    #[case("serial://COM3", "COM3")]
    fn device_from_authority_or_path(#[case] raw: &str, #[case] path: &str) {
        let cs = ConnectionString::parse(raw).expect("parse");
        let config = SerialConfig::from_connection_string(&cs).expect("config");
        assert_eq!(config, SerialConfig::new(path));
    }

    #[test]
    fn reads_line_settings() {
        let cs = ConnectionString::parse("serial:///dev/ttyS1?br=57600&parity=EVEN&data_bits=7&stop_bits=two")
            .expect("parse");
        let config = SerialConfig::from_connection_string(&cs).expect("config");
        assert_eq!(config.baud_rate, 57_600);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.data_bits, DataBits::Seven);
        assert_eq!(config.stop_bits, StopBits::Two);
    }

    #[rstest]
    #[case("serial:///dev/ttyS1?parity=mark", "parity")]
    #[case("serial:///dev/ttyS1?data_bits=9", "data_bits")]
    #[case("serial:///dev/ttyS1?stop_bits=1.5", "stop_bits")]
    fn rejects_unknown_settings(#[case] raw: &str, #[case] key: &str) {
        let cs = ConnectionString::parse(raw).expect("parse");
        let err = SerialConfig::from_connection_string(&cs).expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidEnum { key: k, .. } if k == key));
    }

    #[test]
    fn bad_baud_rate() {
        let cs = ConnectionString::parse("serial:///dev/ttyS1?br=fast").expect("parse");
        assert_eq!(
            SerialConfig::from_connection_string(&cs).expect_err("invalid"),
            ConfigError::InvalidInteger {
                key: "br".into(),
                value: "fast".into()
            }
        );
    }
}
