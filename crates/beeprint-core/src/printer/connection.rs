//! Connection lifecycle and mode negotiation
//!
//! ```text
//! Disconnected -> Connecting -> { Bootloader, Firmware } -> Disconnected
//! ```
//!
//! A mode switch reboots the device and the USB interface re-enumerates, so
//! the old link is dropped and the device is discovered and opened again.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::PrinterMode;
use crate::config::PrinterConfig;
use crate::context::EngineContext;
use crate::protocol::{
    Command, CommandKind, DeviceDescriptor, DeviceDiscovery, FirmwareProfile, ProtocolError,
    Transport,
};

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Discovery, open or mode negotiation in progress
    Connecting,
    /// Connected, device in bootloader mode
    Bootloader,
    /// Connected, device running firmware
    Firmware,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Bootloader | Self::Firmware)
    }

    pub fn mode(&self) -> PrinterMode {
        match self {
            Self::Bootloader => PrinterMode::Bootloader,
            Self::Firmware => PrinterMode::Firmware,
            Self::Disconnected | Self::Connecting => PrinterMode::Unknown,
        }
    }
}

impl From<PrinterMode> for ConnectionState {
    fn from(mode: PrinterMode) -> Self {
        match mode {
            PrinterMode::Bootloader => Self::Bootloader,
            PrinterMode::Firmware => Self::Firmware,
            PrinterMode::Unknown => Self::Connecting,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Bootloader => write!(f, "Bootloader"),
            Self::Firmware => write!(f, "Firmware"),
        }
    }
}

/// Mode the caller needs once `connect` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModeRequirement {
    /// Whatever mode the device is in
    #[default]
    Any,
    Firmware,
    Bootloader,
}

impl ModeRequirement {
    /// Mode to switch into, if the current one does not satisfy the requirement
    pub fn switch_target(&self, current: PrinterMode) -> Option<PrinterMode> {
        match (self, current) {
            (Self::Firmware, PrinterMode::Bootloader) => Some(PrinterMode::Firmware),
            (Self::Bootloader, PrinterMode::Firmware) => Some(PrinterMode::Bootloader),
            _ => None,
        }
    }
}

/// Ask the device which mode it is in.
///
/// The bootloader answers the firmware's status query with a rejection,
/// which is how the two modes are told apart. A successful answer is also
/// merged as a status report.
pub async fn query_mode(ctx: &EngineContext) -> Result<PrinterMode, ProtocolError> {
    if !ctx.profile.supports(CommandKind::QueryMode) {
        // Dialects without a bootloader over the link are always in firmware
        return Ok(PrinterMode::Firmware);
    }
    match ctx.execute(&Command::QueryMode).await {
        Ok(response) => {
            ctx.state.merge_status(&response);
            Ok(PrinterMode::Firmware)
        }
        Err(ProtocolError::DeviceError(text)) if ctx.profile.is_bootloader_rejection(&text) => {
            Ok(PrinterMode::Bootloader)
        }
        Err(e) => Err(e),
    }
}

/// Pick the firmware dialect for a freshly connected device
pub async fn identify_profile(ctx: &EngineContext, config: &PrinterConfig) -> FirmwareProfile {
    let mut profile = match config.firmware {
        Some(variant) => FirmwareProfile::for_variant(variant),
        None => match ctx.execute(&Command::QueryFirmwareString).await {
            Ok(response) => {
                let identity = response.text();
                debug!(identity = %identity, "firmware identity");
                FirmwareProfile::detect(&identity, ctx.profile.variant)
            }
            Err(e) => {
                warn!(error = %e, "could not read firmware identity, keeping {}", ctx.profile.variant);
                (*ctx.profile).clone()
            }
        },
    };
    if let Some(home) = config.home_before_print {
        profile.home_before_print = home;
    }
    profile
}

/// Finds and opens the printer's serial device
pub struct Connector {
    discovery: Arc<dyn DeviceDiscovery>,
    config: Arc<PrinterConfig>,
}

impl Connector {
    pub fn new(discovery: Arc<dyn DeviceDiscovery>, config: Arc<PrinterConfig>) -> Self {
        Self { discovery, config }
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ProtocolError> {
        self.discovery.list_devices().await
    }

    /// Open the first matching device
    pub async fn open(&self) -> Result<(DeviceDescriptor, Box<dyn Transport>), ProtocolError> {
        let device = self
            .discovery
            .list_devices()
            .await?
            .into_iter()
            .next()
            .ok_or(ProtocolError::DeviceNotFound)?;
        let transport = self.discovery.open(&device).await?;
        info!(port = %device.name, "opened printer link");
        Ok((device, transport))
    }

    /// Open the device again after it rebooted into another mode
    pub async fn reopen_after_reset(
        &self,
    ) -> Result<(DeviceDescriptor, Box<dyn Transport>), ProtocolError> {
        tokio::time::sleep(self.config.reset_delay()).await;

        let attempts = self.config.reconnect_attempts.max(1);
        let mut last_error = ProtocolError::DeviceNotFound;
        for attempt in 1..=attempts {
            match self.open().await {
                Ok(opened) => return Ok(opened),
                Err(e) => {
                    debug!(attempt, attempts, error = %e, "device not back yet");
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.reconnect_interval()).await;
            }
        }
        warn!(attempts, "device did not re-enumerate after mode switch");
        Err(last_error)
    }
}

/// Reboot the device into `target` and attach to the re-enumerated link
pub async fn switch_mode(
    ctx: &EngineContext,
    connector: &Connector,
    target: PrinterMode,
) -> Result<PrinterMode, ProtocolError> {
    let command = match target {
        PrinterMode::Firmware => Command::EnterFirmware,
        PrinterMode::Bootloader => Command::EnterBootloader,
        PrinterMode::Unknown => return Err(ProtocolError::Unsupported("switch to unknown mode")),
    };
    info!(requested = %target, "switching printer mode");

    ctx.execute(&command).await?;
    ctx.channel.detach().await;
    ctx.state.reset_connection();

    let (_device, transport) = connector.reopen_after_reset().await?;
    ctx.channel
        .attach(transport, ctx.profile.classifier())
        .await?;

    let mode = query_mode(ctx).await?;
    ctx.state.set_mode(mode);
    if mode != target {
        return Err(ProtocolError::WrongMode {
            expected: target,
            actual: mode,
        });
    }
    info!(%mode, "printer mode switched");
    Ok(mode)
}
