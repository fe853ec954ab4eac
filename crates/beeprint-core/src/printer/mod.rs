//! Printer model and operations
//!
//! The cached printer state and its single writer, the connection and mode
//! lifecycle, and the [`Printer`] facade that composes the command channel
//! and the background workers into the public operations.

pub mod calibration;
pub mod connection;
mod facade;
pub mod filename;
pub mod report;
mod state;
mod state_machine;

pub use calibration::{CalibrationSession, CALIBRATION_POINTS};
pub use connection::{ConnectionState, ModeRequirement};
pub use facade::{PrintOptions, Printer};
pub use filename::{DeviceFileName, DEFAULT_DEVICE_FILE_NAME};
pub use report::TemperatureReport;
pub use state::{
    ActivityFlags, PrintProgress, PrinterMode, PrinterSnapshot, PrinterState, PrinterStatus,
};
pub use state_machine::PrinterStateMachine;
