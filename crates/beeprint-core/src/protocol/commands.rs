//! Protocol commands
//!
//! The engine's command vocabulary. Each [`Command`] is rendered into G-code
//! text by a [`FirmwareProfile`](super::FirmwareProfile), which owns the
//! mapping from command kind to the firmware's code.

use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Axes selectable for homing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HomeAxes {
    All,
    XY,
    Z,
}

/// A relative move; unset axes are left out of the command
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RelativeMove {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub e: Option<f64>,
    /// Feed rate in mm/min
    pub feedrate: Option<f64>,
}

impl RelativeMove {
    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.z.is_none() && self.e.is_none()
    }
}

/// Commands understood by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    QueryMode,
    QueryStatus,
    QueryTemperatures,
    QueryPrintVariables,
    QueryFirmwareString,
    SetFirmwareString(String),
    EnterFirmware,
    EnterBootloader,
    SetNozzleTemperature(f64),
    StartHeating(f64),
    CancelHeating,
    LoadFilament,
    UnloadFilament,
    QueryFilamentString,
    SetFilamentString(String),
    InitStorage,
    ListFiles,
    CreateFile(String),
    /// Header for one transfer chunk covering bytes `first..=last`
    WriteBlock { first: u64, last: u64 },
    CloseFile,
    SelectFile(String),
    /// Select a stored file and start printing it in one step
    SelectAndStart(String),
    /// Standard start of the selected file
    StartSelectedPrint,
    /// Vendor start of the stored print file
    StartStoredPrint,
    PausePrint,
    ResumePrint,
    CancelPrint,
    /// Release the firmware from a blocking wait
    BreakWait,
    Home(HomeAxes),
    RelativePositioning,
    AbsolutePositioning,
    Move(RelativeMove),
    StartCalibration,
    NextCalibrationPoint,
    CancelCalibration,
    JogZ(f64),
    QuerySerialNumber,
    SetSerialNumber(String),
    QueryExtruderSteps,
    SetExtruderSteps(f64),
    FactoryReset,
    EnterShutdown,
    ClearShutdown,
    /// Announce a firmware image of the given size
    BeginFlash(u64),
}

/// Parameterless identity of a [`Command`], used as the capability table key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    QueryMode,
    QueryStatus,
    QueryTemperatures,
    QueryPrintVariables,
    QueryFirmwareString,
    SetFirmwareString,
    EnterFirmware,
    EnterBootloader,
    SetNozzleTemperature,
    StartHeating,
    CancelHeating,
    LoadFilament,
    UnloadFilament,
    QueryFilamentString,
    SetFilamentString,
    InitStorage,
    ListFiles,
    CreateFile,
    WriteBlock,
    CloseFile,
    SelectFile,
    SelectAndStart,
    StartSelectedPrint,
    StartStoredPrint,
    PausePrint,
    ResumePrint,
    CancelPrint,
    BreakWait,
    Home,
    RelativePositioning,
    AbsolutePositioning,
    Move,
    StartCalibration,
    NextCalibrationPoint,
    CancelCalibration,
    JogZ,
    QuerySerialNumber,
    SetSerialNumber,
    QueryExtruderSteps,
    SetExtruderSteps,
    FactoryReset,
    EnterShutdown,
    ClearShutdown,
    BeginFlash,
}

/// How long a command may take before the channel gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Plain query/acknowledge round-trip
    Normal,
    /// Firmware macros and motion that acknowledge only when done
    Long,
}

/// Format a number the way G-code expects: no trailing ".0" on integers
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let s = format!("{:.4}", value);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Accept a nozzle temperature only if it is finite and not below zero
pub fn check_temperature(value: f64) -> Result<f64, ProtocolError> {
    check_non_negative("temperature", value)?;
    Ok(value)
}

fn check_finite(name: &str, value: f64) -> Result<(), ProtocolError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ProtocolError::InvalidArgument(format!("{} must be finite, got {}", name, value)))
    }
}

fn check_non_negative(name: &str, value: f64) -> Result<(), ProtocolError> {
    check_finite(name, value)?;
    if value < 0.0 {
        return Err(ProtocolError::InvalidArgument(format!(
            "{} must not be negative, got {}",
            name, value
        )));
    }
    Ok(())
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::QueryMode => CommandKind::QueryMode,
            Command::QueryStatus => CommandKind::QueryStatus,
            Command::QueryTemperatures => CommandKind::QueryTemperatures,
            Command::QueryPrintVariables => CommandKind::QueryPrintVariables,
            Command::QueryFirmwareString => CommandKind::QueryFirmwareString,
            Command::SetFirmwareString(_) => CommandKind::SetFirmwareString,
            Command::EnterFirmware => CommandKind::EnterFirmware,
            Command::EnterBootloader => CommandKind::EnterBootloader,
            Command::SetNozzleTemperature(_) => CommandKind::SetNozzleTemperature,
            Command::StartHeating(_) => CommandKind::StartHeating,
            Command::CancelHeating => CommandKind::CancelHeating,
            Command::LoadFilament => CommandKind::LoadFilament,
            Command::UnloadFilament => CommandKind::UnloadFilament,
            Command::QueryFilamentString => CommandKind::QueryFilamentString,
            Command::SetFilamentString(_) => CommandKind::SetFilamentString,
            Command::InitStorage => CommandKind::InitStorage,
            Command::ListFiles => CommandKind::ListFiles,
            Command::CreateFile(_) => CommandKind::CreateFile,
            Command::WriteBlock { .. } => CommandKind::WriteBlock,
            Command::CloseFile => CommandKind::CloseFile,
            Command::SelectFile(_) => CommandKind::SelectFile,
            Command::SelectAndStart(_) => CommandKind::SelectAndStart,
            Command::StartSelectedPrint => CommandKind::StartSelectedPrint,
            Command::StartStoredPrint => CommandKind::StartStoredPrint,
            Command::PausePrint => CommandKind::PausePrint,
            Command::ResumePrint => CommandKind::ResumePrint,
            Command::CancelPrint => CommandKind::CancelPrint,
            Command::BreakWait => CommandKind::BreakWait,
            Command::Home(_) => CommandKind::Home,
            Command::RelativePositioning => CommandKind::RelativePositioning,
            Command::AbsolutePositioning => CommandKind::AbsolutePositioning,
            Command::Move(_) => CommandKind::Move,
            Command::StartCalibration => CommandKind::StartCalibration,
            Command::NextCalibrationPoint => CommandKind::NextCalibrationPoint,
            Command::CancelCalibration => CommandKind::CancelCalibration,
            Command::JogZ(_) => CommandKind::JogZ,
            Command::QuerySerialNumber => CommandKind::QuerySerialNumber,
            Command::SetSerialNumber(_) => CommandKind::SetSerialNumber,
            Command::QueryExtruderSteps => CommandKind::QueryExtruderSteps,
            Command::SetExtruderSteps(_) => CommandKind::SetExtruderSteps,
            Command::FactoryReset => CommandKind::FactoryReset,
            Command::EnterShutdown => CommandKind::EnterShutdown,
            Command::ClearShutdown => CommandKind::ClearShutdown,
            Command::BeginFlash(_) => CommandKind::BeginFlash,
        }
    }

    /// Parameter text appended after the command code, if any
    pub fn parameters(&self) -> Option<String> {
        match self {
            Command::SetNozzleTemperature(t) | Command::StartHeating(t) => {
                Some(format!("S{}", format_number(*t)))
            }
            Command::SetFirmwareString(s) => Some(format!("A{}", s)),
            Command::SetSerialNumber(s) => Some(format!("T{}", s)),
            Command::SetExtruderSteps(v) => Some(format!("P{}", format_number(*v))),
            Command::SetFilamentString(s) => Some(s.clone()),
            Command::CreateFile(name) | Command::SelectFile(name) => Some(name.clone()),
            Command::SelectAndStart(name) => Some(format!("!{}", name)),
            Command::WriteBlock { first, last } => Some(format!("A{} D{}", first, last)),
            Command::BeginFlash(size) => Some(format!("A{}", size)),
            Command::Home(HomeAxes::All) => None,
            Command::Home(HomeAxes::XY) => Some("X0 Y0".to_string()),
            Command::Home(HomeAxes::Z) => Some("Z0".to_string()),
            Command::JogZ(delta) => Some(format!("Z{}", format_number(*delta))),
            Command::Move(m) => {
                let parts: Vec<String> = [
                    ('X', m.x),
                    ('Y', m.y),
                    ('Z', m.z),
                    ('E', m.e),
                    ('F', m.feedrate),
                ]
                .iter()
                .filter_map(|(axis, v)| v.map(|v| format!("{}{}", axis, format_number(v))))
                .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(" "))
                }
            }
            _ => None,
        }
    }

    /// Reject numeric arguments that would render into nonsense G-code.
    ///
    /// Every number must be finite; temperatures and extruder steps must
    /// also be non-negative.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Command::SetNozzleTemperature(t) | Command::StartHeating(t) => {
                check_temperature(*t).map(|_| ())
            }
            Command::SetExtruderSteps(v) => check_non_negative("extruder steps", *v),
            Command::JogZ(delta) => check_finite("Z jog distance", *delta),
            Command::Move(m) => {
                for (name, value) in [
                    ("X distance", m.x),
                    ("Y distance", m.y),
                    ("Z distance", m.z),
                    ("E distance", m.e),
                ] {
                    if let Some(v) = value {
                        check_finite(name, v)?;
                    }
                }
                match m.feedrate {
                    Some(f) => check_non_negative("feed rate", f),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Check if this command is acknowledged by the firmware
    ///
    /// Mode switches reboot the device; the old link disappears before any
    /// acknowledgment could arrive.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Command::EnterFirmware | Command::EnterBootloader)
    }

    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            Command::Home(_)
            | Command::Move(_)
            | Command::LoadFilament
            | Command::UnloadFilament
            | Command::StartCalibration
            | Command::NextCalibrationPoint
            | Command::CancelCalibration
            | Command::FactoryReset
            | Command::InitStorage
            | Command::CreateFile(_)
            | Command::CloseFile => TimeoutClass::Long,
            _ => TimeoutClass::Normal,
        }
    }
}
