//! Printer Protocol Communication
//!
//! Line-oriented G-code protocol over a USB serial link: the transport, the
//! serialized command channel, the command vocabulary and the per-firmware
//! capability tables.

pub mod capabilities;
pub mod channel;
pub mod commands;
mod error;
mod response;
pub mod serial;
mod transport;

pub use capabilities::{FirmwareProfile, FirmwareVariant, LineKind, ResponseClassifier, StartPrint};
pub use channel::CommandChannel;
pub use commands::{check_temperature, Command, CommandKind, HomeAxes, RelativeMove, TimeoutClass};
pub use error::{ProtocolError, TransportError};
pub use response::Response;
pub use serial::{list_ports, DeviceDescriptor, SerialDiscovery, SerialTransport};
pub use transport::{DeviceDiscovery, LineCodec, Transport};

/// Default baud rate for the printer's CDC interface
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for a plain command round-trip in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Default timeout for macros and motion commands in milliseconds
pub const LONG_TIMEOUT_MS: u64 = 120_000;

/// USB vendor ID of BEEVERYCREATIVE printers
pub const BEEVERYCREATIVE_VID: u16 = 0x29c9;

/// USB product IDs of the supported printer models
pub const SUPPORTED_PRODUCT_IDS: [u16; 5] = [0x0001, 0x0002, 0x0003, 0x0004, 0x0005];
