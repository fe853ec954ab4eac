//! # BeePrint Core Library
//!
//! Control engine for BEETHEFIRST-family 3D printers over USB serial.

#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Device discovery and the serialized command channel over the serial link
//! - Bootloader / firmware mode negotiation with re-enumeration after resets
//! - File transfer into printer storage with progress and cancellation
//! - Stored prints and host-streamed prints sent line by line
//! - Heating waits and a polling status monitor
//! - A cached, versioned printer state snapshot
//!
//! ## Supported firmware
//!
//! - BEETHEFIRST / BEETHEFIRST+ (BEEVC firmware)
//! - Marlin-style firmware (reduced command set)
//!
//! ## Example
//!
//! ```rust,ignore
//! use beeprint_core::prelude::*;
//!
//! let printer = Printer::new(PrinterConfig::default())?;
//! printer.connect(ModeRequirement::Firmware).await?;
//!
//! printer.print_file(Path::new("cube.gcode"), PrintOptions::default()).await?;
//! printer.start_monitor(None).await?;
//!
//! let snapshot = printer.snapshot();
//! println!("nozzle: {:?}", snapshot.state.nozzle_temperature);
//! ```

pub mod config;
pub mod context;
pub mod gcode;
pub mod printer;
pub mod protocol;
pub mod workers;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::PrinterConfig;
    pub use crate::printer::{
        ActivityFlags, ConnectionState, DeviceFileName, ModeRequirement, PrintOptions,
        PrintProgress, Printer, PrinterMode, PrinterSnapshot, PrinterState, PrinterStatus,
        TemperatureReport,
    };
    pub use crate::protocol::{
        DeviceDescriptor, DeviceDiscovery, FirmwareProfile, FirmwareVariant, HomeAxes,
        ProtocolError, RelativeMove, Response, Transport,
    };
    pub use crate::workers::{
        DirectPrintHandle, DirectPrintSession, HeatingHandle, MonitorHandle, TransferHandle,
        TransferSession,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
