//! Printer state model
//!
//! The engine never receives events from the firmware; everything here is
//! the best known picture as of the last successful poll or acknowledgment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating mode of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrinterMode {
    /// Accepts firmware-flash commands only
    Bootloader,
    /// Accepts normal print and control commands
    Firmware,
    #[default]
    Unknown,
}

impl fmt::Display for PrinterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootloader => write!(f, "Bootloader"),
            Self::Firmware => write!(f, "Firmware"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Status code reported by the firmware's status query (`S:<n>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrinterStatus {
    Ready,
    Moving,
    SdPrint,
    Transfer,
    Paused,
    Shutdown,
    Other(u8),
}

impl PrinterStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            3 => Self::Ready,
            4 => Self::Moving,
            5 => Self::SdPrint,
            6 => Self::Transfer,
            7 => Self::Paused,
            9 => Self::Shutdown,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for PrinterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Moving => write!(f, "Moving"),
            Self::SdPrint => write!(f, "SD_Print"),
            Self::Transfer => write!(f, "Transfer"),
            Self::Paused => write!(f, "Pause"),
            Self::Shutdown => write!(f, "Shutdown"),
            Self::Other(code) => write!(f, "Status {}", code),
        }
    }
}

/// Activity flags.
///
/// These overlap in practice (the nozzle heats while a file is still being
/// transferred), so each is tracked on its own rather than as one enum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFlags {
    pub heating: bool,
    pub transferring: bool,
    pub printing: bool,
    /// The print is streamed line by line from the host
    pub streaming: bool,
    pub paused: bool,
    pub shutdown: bool,
}

/// Print-session variables reported by the firmware
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintProgress {
    /// Estimated print time as reported
    pub estimated_time: Option<u64>,
    /// Elapsed print time in milliseconds
    pub elapsed_time: Option<u64>,
    pub total_lines: Option<u64>,
    pub current_line: Option<u64>,
}

impl PrintProgress {
    /// Completion percentage derived from the line counters
    pub fn percent(&self) -> Option<f64> {
        match (self.current_line, self.total_lines) {
            (Some(current), Some(total)) if total > 0 => {
                Some((current as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
            }
            _ => None,
        }
    }

    pub fn elapsed_seconds(&self) -> Option<f64> {
        self.elapsed_time.map(|ms| ms as f64 / 1000.0)
    }
}

/// Cached logical state of the printer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterState {
    pub mode: PrinterMode,
    /// Last status code seen from the firmware
    pub status: Option<PrinterStatus>,
    pub nozzle_temperature: Option<f64>,
    /// Absent on printer families without a heated bed
    pub bed_temperature: Option<f64>,
    pub electronics_temperature: Option<f64>,
    pub target_temperature: Option<f64>,
    pub flags: ActivityFlags,
    /// Device file of the current or last print
    pub current_file: Option<String>,
    /// Transfer progress in percent while a transfer runs
    pub transfer_progress: Option<f64>,
    pub print_progress: PrintProgress,
    /// The firmware has reported an active print since the last start
    pub print_observed: bool,
}

impl PrinterState {
    pub fn is_busy(&self) -> bool {
        let f = self.flags;
        f.heating
            || f.transferring
            || f.printing
            || matches!(self.status, Some(PrinterStatus::Moving))
    }
}

/// A versioned, timestamped copy of [`PrinterState`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterSnapshot {
    pub state: PrinterState,
    /// Incremented on every merge
    pub version: u64,
    /// Time of the last merge
    pub updated_at: Option<DateTime<Utc>>,
    /// Consecutive poll cycles that failed
    pub failed_polls: u32,
}

impl PrinterSnapshot {
    /// Age of this snapshot relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.updated_at.map(|t| now - t)
    }
}
