//! Serial port handling
//!
//! Device discovery by USB identity and the tokio-serial backed transport.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serialport::{SerialPortInfo, SerialPortType};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use super::{DeviceDiscovery, LineCodec, ProtocolError, Transport, TransportError};

/// Information about an attached printer link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl DeviceDescriptor {
    /// Whether this device carries the given USB identity
    pub fn matches(&self, vendor_id: u16, product_ids: &[u16]) -> bool {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => vid == vendor_id && product_ids.contains(&pid),
            _ => false,
        }
    }
}

impl From<SerialPortInfo> for DeviceDescriptor {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Sort key so that ttyACM* ports come first, then ttyUSB*, then the rest
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// Keep only devices with the given USB identity, in deterministic order
pub fn filter_devices(
    devices: impl IntoIterator<Item = DeviceDescriptor>,
    vendor_id: u16,
    product_ids: &[u16],
) -> Vec<DeviceDescriptor> {
    let mut matching: Vec<DeviceDescriptor> = devices
        .into_iter()
        .filter(|d| d.matches(vendor_id, product_ids))
        .collect();
    matching.sort_by_key(|d| port_sort_key(&d.name));
    matching.dedup_by(|a, b| a.name == b.name);
    matching
}

/// List all serial ports known to the OS
pub fn list_ports() -> Result<Vec<DeviceDescriptor>, ProtocolError> {
    let ports = serialport::available_ports().map_err(|e| ProtocolError::Io(e.to_string()))?;
    Ok(ports.into_iter().map(DeviceDescriptor::from).collect())
}

/// Transport over a USB CDC serial port
pub struct SerialTransport {
    name: String,
    reader: FramedRead<SerialStream, LineCodec>,
}

impl SerialTransport {
    /// Open the port 8N1 without flow control
    pub fn open(device: &DeviceDescriptor, baud_rate: u32) -> Result<Self, ProtocolError> {
        let mut stream = tokio_serial::new(&device.name, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ProtocolError::Io(format!("{}: {}", device.name, e)))?;

        // Some boards reset when DTR drops; keep it asserted
        if let Err(e) = stream.write_data_terminal_ready(true) {
            warn!(port = %device.name, error = %e, "failed to assert DTR (continuing)");
        }

        debug!(port = %device.name, baud_rate, "serial port opened");

        Ok(Self {
            name: device.name.clone(),
            reader: FramedRead::new(stream, LineCodec::new()),
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.reader.get_mut();
        port.write_all(bytes).await?;
        port.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        match tokio::time::timeout(timeout, self.reader.next()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(None) => Err(TransportError::Closed),
            Ok(Some(Err(e))) => Err(TransportError::Io(e)),
            Ok(Some(Ok(line))) => Ok(line),
        }
    }

    async fn discard_input(&mut self) -> Result<(), TransportError> {
        self.reader.read_buffer_mut().clear();
        self.reader
            .get_mut()
            .clear(tokio_serial::ClearBuffer::Input)
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Discovers printers among the OS serial ports by USB identity
#[derive(Debug, Clone)]
pub struct SerialDiscovery {
    vendor_id: u16,
    product_ids: Vec<u16>,
    baud_rate: u32,
}

impl SerialDiscovery {
    pub fn new(vendor_id: u16, product_ids: Vec<u16>, baud_rate: u32) -> Self {
        Self {
            vendor_id,
            product_ids,
            baud_rate,
        }
    }
}

#[async_trait]
impl DeviceDiscovery for SerialDiscovery {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ProtocolError> {
        let ports = list_ports()?;
        Ok(filter_devices(ports, self.vendor_id, &self.product_ids))
    }

    async fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn Transport>, ProtocolError> {
        let transport = SerialTransport::open(device, self.baud_rate)?;
        Ok(Box::new(transport))
    }
}
