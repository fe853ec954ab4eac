//! Transport abstraction
//!
//! A [`Transport`] moves bytes to and from one physical printer link. It has no
//! protocol knowledge: it writes bytes in order and reads newline-delimited
//! lines with a bounded wait. Retry policy lives in the command channel.

use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio_util::codec::Decoder;

use super::{DeviceDescriptor, ProtocolError, TransportError};

/// Byte-level access to an opened printer link
#[async_trait]
pub trait Transport: Send {
    /// Write all bytes to the link
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read one line (without its terminator), waiting at most `timeout`
    async fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError>;

    /// Drop any input that arrived before the next command
    async fn discard_input(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Name of the underlying device, for diagnostics
    fn name(&self) -> &str;
}

/// Enumerates candidate printers and opens links to them
///
/// The physical interface can re-enumerate after a mode switch, so the engine
/// always goes back through discovery instead of reopening a cached handle.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// List attached devices that look like a supported printer
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ProtocolError>;

    /// Open a link to the given device
    async fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn Transport>, ProtocolError>;
}

/// Default cap on a single line before it is force-split
pub const MAX_LINE_LENGTH: usize = 1024;

/// Splits the serial byte stream into text lines
///
/// Invalid UTF-8 is replaced rather than rejected so a single garbled line
/// reaches the channel as text it can classify, instead of killing the link.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self {
            max_length: MAX_LINE_LENGTH,
        }
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(pos) = src.iter().position(|b| *b == b'\n') {
            let line = src.split_to(pos + 1);
            return Ok(Some(decode_line(&line)));
        }
        if src.len() > self.max_length {
            let line = src.split_to(self.max_length);
            return Ok(Some(decode_line(&line)));
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                let rest = src.split_to(src.len());
                Ok(Some(decode_line(&rest)))
            }
        }
    }
}
