//! Firmware capability table
//!
//! Printer variants disagree on which G-codes exist and what they mean. Each
//! variant is described by a [`FirmwareProfile`]: a table from
//! [`CommandKind`] to the variant's code plus a handful of behaviour switches.
//! Adding a variant means adding a table, not new control flow.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::{Command, CommandKind, ProtocolError};

/// Known firmware families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FirmwareVariant {
    /// BEEVERYCREATIVE BEETHEFIRST family
    #[default]
    BeeTheFirst,
    /// Generic Marlin-compatible firmware
    Marlin,
}

impl fmt::Display for FirmwareVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeeTheFirst => write!(f, "BEETHEFIRST"),
            Self::Marlin => write!(f, "Marlin"),
        }
    }
}

/// How a print of the selected storage file is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartPrint {
    /// `M23 <file>` then the standard start (`M24`)
    Standard,
    /// Vendor start command that prints the stored file on its own
    Custom,
}

/// What a single response line means to the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Terminal acknowledgment
    Ack,
    /// Terminal explicit rejection
    Rejected,
    /// Informational line preceding the terminal token
    Info,
}

/// Recognizes terminal tokens in response lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseClassifier {
    ack_prefixes: Vec<String>,
    error_markers: Vec<String>,
}

impl ResponseClassifier {
    pub fn new(ack_prefixes: &[&str], error_markers: &[&str]) -> Self {
        Self {
            ack_prefixes: ack_prefixes.iter().map(|s| s.to_ascii_lowercase()).collect(),
            error_markers: error_markers.iter().map(|s| s.to_ascii_lowercase()).collect(),
        }
    }

    /// Classify one response line.
    ///
    /// Both kinds of terminal token are anchored at the start of the line and
    /// must end at a word boundary, so payload lines such as a stored file
    /// named `OKAY` or a filament called "Terror Red" stay informational.
    pub fn classify(&self, line: &str) -> LineKind {
        let lower = line.trim().to_ascii_lowercase();
        if self.error_markers.iter().any(|m| starts_with_token(&lower, m)) {
            return LineKind::Rejected;
        }
        if self.ack_prefixes.iter().any(|p| starts_with_token(&lower, p)) {
            return LineKind::Ack;
        }
        LineKind::Info
    }
}

/// `line` begins with `token` followed by nothing, whitespace or `:`
fn starts_with_token(line: &str, token: &str) -> bool {
    match line.strip_prefix(token) {
        Some(rest) => rest
            .chars()
            .next()
            .map_or(true, |c| c.is_whitespace() || c == ':'),
        None => false,
    }
}

impl Default for ResponseClassifier {
    fn default() -> Self {
        FirmwareProfile::bee_the_first().classifier()
    }
}

/// Capabilities and command dialect of one firmware variant
#[derive(Debug, Clone)]
pub struct FirmwareProfile {
    /// Variant this table describes
    pub variant: FirmwareVariant,
    /// Code for each supported command kind
    commands: HashMap<CommandKind, &'static str>,
    /// Preferred way of starting a stored print
    pub start_print: StartPrint,
    /// Firmware folds names on selection, so `SELECT` must be sent lower-case
    pub lowercase_select: bool,
    /// Issue a homing move before starting a print
    pub home_before_print: bool,
    /// Close the open file when a transfer is cancelled
    pub close_on_abort: bool,
    /// Text in the mode-query rejection that identifies the bootloader
    pub bootloader_marker: &'static str,
    /// Size of one raw block during firmware flashing
    pub flash_block_size: usize,
    ack_tokens: &'static [&'static str],
    error_tokens: &'static [&'static str],
}

impl FirmwareProfile {
    /// BEETHEFIRST family: vendor macros and a storage dialect of its own.
    ///
    /// A print is started with the standard `M24`; revisions that answer it
    /// with "Bad M-code" fall back to the vendor `M33`. If selection itself
    /// fails, `M32 !<file>` selects and starts in one step.
    pub fn bee_the_first() -> Self {
        let table: &[(CommandKind, &'static str)] = &[
            (CommandKind::QueryMode, "M625"),
            (CommandKind::QueryStatus, "M625"),
            (CommandKind::QueryTemperatures, "M105"),
            (CommandKind::QueryPrintVariables, "M32"),
            (CommandKind::QueryFirmwareString, "M115"),
            (CommandKind::SetFirmwareString, "M114"),
            (CommandKind::EnterFirmware, "M630"),
            (CommandKind::EnterBootloader, "M609"),
            (CommandKind::SetNozzleTemperature, "M104"),
            (CommandKind::StartHeating, "M703"),
            (CommandKind::CancelHeating, "M704"),
            (CommandKind::LoadFilament, "M701"),
            (CommandKind::UnloadFilament, "M702"),
            (CommandKind::QueryFilamentString, "M1001"),
            (CommandKind::SetFilamentString, "M1000"),
            (CommandKind::InitStorage, "M21"),
            (CommandKind::ListFiles, "M20"),
            (CommandKind::CreateFile, "M30"),
            (CommandKind::WriteBlock, "M28"),
            (CommandKind::CloseFile, "M29"),
            (CommandKind::SelectFile, "M23"),
            (CommandKind::SelectAndStart, "M32"),
            (CommandKind::StartSelectedPrint, "M24"),
            (CommandKind::StartStoredPrint, "M33"),
            (CommandKind::PausePrint, "M640"),
            (CommandKind::ResumePrint, "M643"),
            (CommandKind::CancelPrint, "M112"),
            (CommandKind::BreakWait, "M108"),
            (CommandKind::Home, "G28"),
            (CommandKind::RelativePositioning, "G91"),
            (CommandKind::AbsolutePositioning, "G90"),
            (CommandKind::Move, "G1"),
            (CommandKind::StartCalibration, "G131 S0"),
            (CommandKind::NextCalibrationPoint, "G132"),
            (CommandKind::CancelCalibration, "G28"),
            (CommandKind::JogZ, "G0"),
            (CommandKind::QuerySerialNumber, "M117"),
            (CommandKind::SetSerialNumber, "M118"),
            (CommandKind::QueryExtruderSteps, "M200"),
            (CommandKind::SetExtruderSteps, "M200"),
            (CommandKind::FactoryReset, "M607"),
            (CommandKind::EnterShutdown, "M36"),
            (CommandKind::ClearShutdown, "M505"),
            (CommandKind::BeginFlash, "M650"),
        ];

        Self {
            variant: FirmwareVariant::BeeTheFirst,
            commands: table.iter().copied().collect(),
            start_print: StartPrint::Standard,
            lowercase_select: true,
            home_before_print: false,
            close_on_abort: true,
            bootloader_marker: "bad m-code 625",
            flash_block_size: 64,
            ack_tokens: &["ok", "tog"],
            error_tokens: &["bad m-code", "bad g-code", "error", "unknown command"],
        }
    }

    /// Marlin-style firmware: standard SD commands, no vendor macros, no
    /// bootloader mode reachable over the link and no chunked upload.
    pub fn marlin() -> Self {
        let table: &[(CommandKind, &'static str)] = &[
            (CommandKind::QueryTemperatures, "M105"),
            (CommandKind::QueryFirmwareString, "M115"),
            (CommandKind::SetNozzleTemperature, "M104"),
            (CommandKind::StartHeating, "M104"),
            (CommandKind::CancelHeating, "M104 S0"),
            (CommandKind::LoadFilament, "M701"),
            (CommandKind::UnloadFilament, "M702"),
            (CommandKind::InitStorage, "M21"),
            (CommandKind::ListFiles, "M20"),
            (CommandKind::SelectFile, "M23"),
            (CommandKind::StartSelectedPrint, "M24"),
            (CommandKind::PausePrint, "M25"),
            (CommandKind::ResumePrint, "M24"),
            (CommandKind::CancelPrint, "M524"),
            (CommandKind::BreakWait, "M108"),
            (CommandKind::Home, "G28"),
            (CommandKind::RelativePositioning, "G91"),
            (CommandKind::AbsolutePositioning, "G90"),
            (CommandKind::Move, "G1"),
            (CommandKind::JogZ, "G0"),
            (CommandKind::QueryExtruderSteps, "M92"),
            (CommandKind::FactoryReset, "M502"),
        ];

        Self {
            variant: FirmwareVariant::Marlin,
            commands: table.iter().copied().collect(),
            start_print: StartPrint::Standard,
            lowercase_select: false,
            home_before_print: true,
            close_on_abort: false,
            bootloader_marker: "",
            flash_block_size: 0,
            ack_tokens: &["ok"],
            error_tokens: &["error", "unknown command"],
        }
    }

    pub fn for_variant(variant: FirmwareVariant) -> Self {
        match variant {
            FirmwareVariant::BeeTheFirst => Self::bee_the_first(),
            FirmwareVariant::Marlin => Self::marlin(),
        }
    }

    /// Pick a profile from the firmware identity string (`M115`).
    ///
    /// BEEVC firmware before revision 10 needs an explicit home before a
    /// stored print; later revisions home from the G-code itself.
    pub fn detect(identity: &str, fallback: FirmwareVariant) -> Self {
        let upper = identity.to_ascii_uppercase();
        if upper.contains("BEEVC") || upper.contains("BEETHEFIRST") {
            let mut profile = Self::bee_the_first();
            if let Some(major) = firmware_major_version(identity) {
                profile.home_before_print = major < 10;
            }
            profile
        } else if upper.contains("MARLIN") {
            Self::marlin()
        } else {
            Self::for_variant(fallback)
        }
    }

    pub fn supports(&self, kind: CommandKind) -> bool {
        self.commands.contains_key(&kind)
    }

    /// Render a command into its wire text (without the line terminator)
    pub fn render(&self, command: &Command) -> Result<String, ProtocolError> {
        let code = self
            .commands
            .get(&command.kind())
            .ok_or_else(|| ProtocolError::Unsupported(unsupported_name(command.kind())))?;
        Ok(match command.parameters() {
            Some(params) => format!("{} {}", code, params),
            None => code.to_string(),
        })
    }

    pub fn classifier(&self) -> ResponseClassifier {
        ResponseClassifier::new(self.ack_tokens, self.error_tokens)
    }

    /// Whether a rejected mode query means the device sits in its bootloader
    pub fn is_bootloader_rejection(&self, text: &str) -> bool {
        !self.bootloader_marker.is_empty()
            && text.to_ascii_lowercase().contains(self.bootloader_marker)
    }
}

impl Default for FirmwareProfile {
    fn default() -> Self {
        Self::bee_the_first()
    }
}

/// Extract the major revision from identities like "BEEVC-BEETHEFIRST-10.4.8"
fn firmware_major_version(identity: &str) -> Option<u32> {
    identity
        .split(|c: char| c == '-' || c.is_whitespace())
        .rev()
        .find(|part| part.contains('.') && part.starts_with(|c: char| c.is_ascii_digit()))
        .and_then(|version| version.split('.').next())
        .and_then(|major| major.parse().ok())
}

fn unsupported_name(kind: CommandKind) -> &'static str {
    match kind {
        CommandKind::QueryMode => "mode query",
        CommandKind::QueryStatus => "status query",
        CommandKind::QueryTemperatures => "temperature query",
        CommandKind::QueryPrintVariables => "print variables query",
        CommandKind::QueryFirmwareString => "firmware identity query",
        CommandKind::SetFirmwareString => "setting the firmware identity",
        CommandKind::EnterFirmware => "switching to firmware mode",
        CommandKind::EnterBootloader => "switching to bootloader mode",
        CommandKind::SetNozzleTemperature => "setting the nozzle temperature",
        CommandKind::StartHeating => "heating",
        CommandKind::CancelHeating => "cancelling heating",
        CommandKind::LoadFilament => "filament load",
        CommandKind::UnloadFilament => "filament unload",
        CommandKind::QueryFilamentString => "filament identifier query",
        CommandKind::SetFilamentString => "setting the filament identifier",
        CommandKind::InitStorage => "storage initialisation",
        CommandKind::ListFiles => "file listing",
        CommandKind::CreateFile => "file creation",
        CommandKind::WriteBlock => "block transfer",
        CommandKind::CloseFile => "closing files",
        CommandKind::SelectFile => "file selection",
        CommandKind::SelectAndStart => "select-and-start",
        CommandKind::StartSelectedPrint => "standard print start",
        CommandKind::StartStoredPrint => "stored print start",
        CommandKind::PausePrint => "pausing",
        CommandKind::ResumePrint => "resuming",
        CommandKind::CancelPrint => "cancelling prints",
        CommandKind::BreakWait => "breaking a firmware wait",
        CommandKind::Home => "homing",
        CommandKind::RelativePositioning => "relative positioning",
        CommandKind::AbsolutePositioning => "absolute positioning",
        CommandKind::Move => "moves",
        CommandKind::StartCalibration => "calibration",
        CommandKind::NextCalibrationPoint => "calibration",
        CommandKind::CancelCalibration => "calibration",
        CommandKind::JogZ => "Z jog",
        CommandKind::QuerySerialNumber => "serial number query",
        CommandKind::SetSerialNumber => "setting the serial number",
        CommandKind::QueryExtruderSteps => "extruder steps query",
        CommandKind::SetExtruderSteps => "setting extruder steps",
        CommandKind::FactoryReset => "factory reset",
        CommandKind::EnterShutdown => "shutdown",
        CommandKind::ClearShutdown => "shutdown",
        CommandKind::BeginFlash => "firmware flashing",
    }
}
