//! Printer facade
//!
//! The public operation surface. Every operation is a short sequence of
//! single-command channel transactions, so background workers and the
//! status monitor can interleave with it.

use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{self, ConnectionState, Connector, ModeRequirement};
use super::report::{self, TemperatureReport};
use super::{
    CalibrationSession, DeviceFileName, PrintProgress, PrinterMode, PrinterSnapshot,
    PrinterStateMachine, PrinterStatus,
};
use crate::config::PrinterConfig;
use crate::context::{EngineContext, Timeouts};
use crate::gcode;
use crate::protocol::{
    check_temperature, Command, CommandChannel, CommandKind, DeviceDescriptor, DeviceDiscovery,
    FirmwareProfile, HomeAxes, ProtocolError, RelativeMove, Response, SerialDiscovery, StartPrint,
};
use crate::workers::direct::{self, DirectPrintHandle, DirectPrintRequest};
use crate::workers::heating::{self, HeatingHandle, HeatingRequest};
use crate::workers::transfer::{self, TransferHandle, TransferSlot};
use crate::workers::{MonitorHandle, StatusMonitor};

/// Options for [`Printer::print_file`] and [`Printer::print_direct`]
#[derive(Debug, Clone, PartialEq)]
pub struct PrintOptions {
    /// Nozzle temperature; scanned from the G-code when absent
    pub temperature: Option<f64>,
    /// Heat and wait for the target before starting
    pub heat: bool,
    /// Storage name; the configured fixed name when absent. Streamed prints
    /// store nothing and ignore it.
    pub device_file: Option<DeviceFileName>,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            temperature: None,
            heat: true,
            device_file: None,
        }
    }
}

/// A connected (or connectable) printer
pub struct Printer {
    config: Arc<PrinterConfig>,
    connector: Connector,
    channel: Arc<CommandChannel>,
    state: Arc<PrinterStateMachine>,
    profile: watch::Sender<Arc<FirmwareProfile>>,
    connection: watch::Sender<ConnectionState>,
    /// Serializes connect, disconnect and mode switches
    lifecycle: Mutex<()>,
    transfer_slot: TransferSlot,
    transfer_cancel: Mutex<Option<CancellationToken>>,
    direct_cancel: Mutex<Option<CancellationToken>>,
    heating_cancel: Mutex<Option<CancellationToken>>,
    monitor: Mutex<Option<MonitorHandle>>,
    calibration: Mutex<CalibrationSession>,
    last_print: Mutex<Option<DeviceFileName>>,
}

impl Printer {
    /// Printer discovered over USB serial
    pub fn new(config: PrinterConfig) -> Result<Self, ProtocolError> {
        let discovery = SerialDiscovery::new(
            config.vendor_id,
            config.product_ids.clone(),
            config.baud_rate,
        );
        Self::with_discovery(config, Arc::new(discovery))
    }

    /// Printer found through a custom discovery (simulators, other links)
    pub fn with_discovery(
        config: PrinterConfig,
        discovery: Arc<dyn DeviceDiscovery>,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        let config = Arc::new(config);
        let (profile, _) = watch::channel(Arc::new(initial_profile(&config)));
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            connector: Connector::new(discovery, config.clone()),
            config,
            channel: Arc::new(CommandChannel::new()),
            state: Arc::new(PrinterStateMachine::new()),
            profile,
            connection,
            lifecycle: Mutex::new(()),
            transfer_slot: TransferSlot::new(),
            transfer_cancel: Mutex::new(None),
            direct_cancel: Mutex::new(None),
            heating_cancel: Mutex::new(None),
            monitor: Mutex::new(None),
            calibration: Mutex::new(CalibrationSession::default()),
            last_print: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PrinterConfig {
        &self.config
    }

    /// Firmware dialect in use
    pub fn profile(&self) -> Arc<FirmwareProfile> {
        self.profile.borrow().clone()
    }

    fn build_context(&self) -> EngineContext {
        EngineContext {
            channel: self.channel.clone(),
            state: self.state.clone(),
            profile: self.profile(),
            timeouts: Timeouts {
                normal: self.config.timeout(),
                long: self.config.long_timeout(),
            },
        }
    }

    /// Context for an operation; fails if no link is attached
    fn context(&self) -> Result<EngineContext, ProtocolError> {
        if !self.connection_state().is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        Ok(self.build_context())
    }

    fn context_in(&self, mode: PrinterMode) -> Result<EngineContext, ProtocolError> {
        let ctx = self.context()?;
        let actual = self.mode();
        if actual != mode {
            return Err(ProtocolError::WrongMode {
                expected: mode,
                actual,
            });
        }
        Ok(ctx)
    }

    fn mark_disconnected(&self) {
        self.connection.send_replace(ConnectionState::Disconnected);
        self.state.reset_connection();
    }

    // ----- connection -----

    /// Matching devices, ttyACM ports first
    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ProtocolError> {
        self.connector.list_devices().await
    }

    /// Discover, open and negotiate the mode the caller needs
    pub async fn connect(&self, requirement: ModeRequirement) -> Result<PrinterMode, ProtocolError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.channel.is_attached() {
            return Err(ProtocolError::AlreadyConnected);
        }
        self.connection.send_replace(ConnectionState::Connecting);

        match self.establish(requirement).await {
            Ok(mode) => {
                self.connection.send_replace(mode.into());
                Ok(mode)
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.channel.detach().await;
                self.mark_disconnected();
                Err(e)
            }
        }
    }

    async fn establish(&self, requirement: ModeRequirement) -> Result<PrinterMode, ProtocolError> {
        let (device, transport) = self.connector.open().await?;
        let profile = Arc::new(initial_profile(&self.config));
        self.profile.send_replace(profile.clone());
        self.channel.attach(transport, profile.classifier()).await?;

        let ctx = self.build_context();
        let mut mode = connection::query_mode(&ctx).await?;
        self.state.set_mode(mode);
        if let Some(target) = requirement.switch_target(mode) {
            mode = connection::switch_mode(&ctx, &self.connector, target).await?;
        }
        if mode == PrinterMode::Firmware {
            self.identify().await;
        }
        info!(port = %device.name, %mode, "printer connected");
        Ok(mode)
    }

    async fn identify(&self) {
        let ctx = self.build_context();
        let profile = connection::identify_profile(&ctx, &self.config).await;
        info!(
            variant = %profile.variant,
            home_before_print = profile.home_before_print,
            "firmware profile selected"
        );
        self.channel.set_classifier(profile.classifier()).await;
        self.profile.send_replace(Arc::new(profile));
    }

    /// Stop workers and close the link
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_monitor().await;
        if let Some(token) = self.transfer_cancel.lock().await.take() {
            token.cancel();
        }
        if let Some(token) = self.direct_cancel.lock().await.take() {
            token.cancel();
        }
        if let Some(token) = self.heating_cancel.lock().await.take() {
            token.cancel();
        }
        *self.calibration.lock().await = CalibrationSession::default();
        if self.channel.detach().await {
            info!("printer disconnected");
        }
        self.mark_disconnected();
    }

    /// Current lifecycle state; a link dropped after an I/O error reads as
    /// `Disconnected`
    pub fn connection_state(&self) -> ConnectionState {
        let state = *self.connection.borrow();
        if state.is_connected() && !self.channel.is_attached() {
            debug!("link was discarded, marking disconnected");
            self.mark_disconnected();
            return ConnectionState::Disconnected;
        }
        state
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    pub fn mode(&self) -> PrinterMode {
        self.connection_state().mode()
    }

    pub async fn go_to_firmware(&self) -> Result<PrinterMode, ProtocolError> {
        self.switch_to(PrinterMode::Firmware).await
    }

    pub async fn go_to_bootloader(&self) -> Result<PrinterMode, ProtocolError> {
        self.switch_to(PrinterMode::Bootloader).await
    }

    async fn switch_to(&self, target: PrinterMode) -> Result<PrinterMode, ProtocolError> {
        let _lifecycle = self.lifecycle.lock().await;
        let ctx = self.context()?;
        if self.mode() == target {
            return Ok(target);
        }
        self.connection.send_replace(ConnectionState::Connecting);

        let result = connection::switch_mode(&ctx, &self.connector, target).await;
        if self.channel.is_attached() {
            let mode = self.state.state().mode;
            if mode == PrinterMode::Firmware {
                self.identify().await;
            }
            self.connection.send_replace(mode.into());
        } else {
            self.mark_disconnected();
        }
        result
    }

    // ----- state -----

    /// Latest cached state; never touches the link
    pub fn snapshot(&self) -> PrinterSnapshot {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<PrinterSnapshot> {
        self.state.subscribe()
    }

    /// Run one poll cycle now and return the merged snapshot
    pub async fn refresh(&self) -> Result<PrinterSnapshot, ProtocolError> {
        let ctx = self.context()?;
        StatusMonitor::poll_once(&ctx).await?;
        Ok(self.state.snapshot())
    }

    pub async fn status(&self) -> Result<PrinterStatus, ProtocolError> {
        let ctx = self.context()?;
        let response = ctx.execute(&Command::QueryStatus).await?;
        ctx.state
            .merge_status(&response)
            .ok_or_else(|| ProtocolError::InvalidResponse(response.text()))
    }

    pub async fn temperatures(&self) -> Result<TemperatureReport, ProtocolError> {
        let ctx = self.context()?;
        let response = ctx.execute(&Command::QueryTemperatures).await?;
        let report = ctx.state.merge_temperatures(&response);
        if report.is_empty() {
            return Err(ProtocolError::InvalidResponse(response.text()));
        }
        Ok(report)
    }

    pub async fn nozzle_temperature(&self) -> Result<f64, ProtocolError> {
        self.temperatures()
            .await?
            .nozzle
            .ok_or_else(|| ProtocolError::InvalidResponse("no nozzle temperature".into()))
    }

    /// Query print-session variables; returns the merged values
    pub async fn print_progress(&self) -> Result<PrintProgress, ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        let response = ctx.execute(&Command::QueryPrintVariables).await?;
        ctx.state.merge_print_variables(&response);
        Ok(ctx.state.state().print_progress)
    }

    // ----- temperature -----

    /// Set the nozzle target without waiting
    pub async fn set_temperature(&self, target: f64) -> Result<(), ProtocolError> {
        check_temperature(target)?;
        let ctx = self.context_in(PrinterMode::Firmware)?;
        ctx.execute(&Command::SetNozzleTemperature(target)).await?;
        ctx.state.set_target_temperature(target);
        Ok(())
    }

    /// Issue the heating command and wait for the target in the background
    pub async fn start_heating(&self, target: f64) -> Result<HeatingHandle, ProtocolError> {
        let ctx = self.begin_heating(target).await?;
        let handle = HeatingHandle::spawn(ctx, self.heating_request(target));
        self.register_heating(handle.cancellation_token()).await;
        Ok(handle)
    }

    /// Issue the heating command and wait for the target on this task
    pub async fn heat_and_wait(&self, target: f64) -> Result<f64, ProtocolError> {
        let ctx = self.begin_heating(target).await?;
        self.wait_heated(ctx, target).await
    }

    async fn begin_heating(&self, target: f64) -> Result<EngineContext, ProtocolError> {
        check_temperature(target)?;
        let ctx = self.context_in(PrinterMode::Firmware)?;
        let command = if ctx.profile.supports(CommandKind::StartHeating) {
            Command::StartHeating(target)
        } else {
            Command::SetNozzleTemperature(target)
        };
        ctx.execute(&command).await?;
        ctx.state.set_target_temperature(target);
        ctx.state.set_heating(true);
        Ok(ctx)
    }

    async fn wait_heated(&self, ctx: EngineContext, target: f64) -> Result<f64, ProtocolError> {
        let token = CancellationToken::new();
        self.register_heating(token.clone()).await;
        heating::wait_for_temperature(&ctx, self.heating_request(target), &token).await
    }

    fn heating_request(&self, target: f64) -> HeatingRequest {
        HeatingRequest {
            target,
            tolerance: self.config.heating_tolerance,
            poll_interval: self.config.heating_poll_interval(),
            ceiling: self.config.heating_timeout(),
        }
    }

    async fn register_heating(&self, token: CancellationToken) {
        if let Some(previous) = self.heating_cancel.lock().await.replace(token) {
            previous.cancel();
        }
    }

    /// Stop any heating wait and tell the firmware to stop heating
    pub async fn cancel_heating(&self) -> Result<(), ProtocolError> {
        if let Some(token) = self.heating_cancel.lock().await.take() {
            token.cancel();
        }
        let ctx = self.context_in(PrinterMode::Firmware)?;
        ctx.execute(&Command::CancelHeating).await?;
        ctx.state.set_heating(false);
        info!("heating cancelled");
        Ok(())
    }

    // ----- transfer and print -----

    /// Stream bytes into device storage on a background task
    pub async fn transfer_bytes(
        &self,
        data: Bytes,
        file: Option<DeviceFileName>,
    ) -> Result<TransferHandle, ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        let file = match file {
            Some(file) => file,
            None => self.config.device_file()?,
        };
        let handle =
            transfer::begin_transfer(ctx, &self.transfer_slot, data, file, self.config.chunk_size)?;
        *self.transfer_cancel.lock().await = Some(handle.cancellation_token());
        Ok(handle)
    }

    /// Read a host file and stream it into device storage
    pub async fn transfer_file(
        &self,
        path: &Path,
        file: Option<DeviceFileName>,
    ) -> Result<TransferHandle, ProtocolError> {
        let data = read_source(path).await?;
        self.transfer_bytes(data, file).await
    }

    /// Cancel the running transfer; returns whether one was running
    pub async fn cancel_transfer(&self) -> bool {
        match self.transfer_cancel.lock().await.take() {
            Some(token) if self.is_transferring() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_transferring(&self) -> bool {
        self.transfer_slot.holder() == Some(transfer::FILE_TRANSFER)
    }

    /// Transfer a host G-code file and print it
    pub async fn print_file(
        &self,
        path: &Path,
        options: PrintOptions,
    ) -> Result<DeviceFileName, ProtocolError> {
        let data = read_source(path).await?;
        self.print_gcode(data, options).await
    }

    /// Transfer G-code, heat, and start printing it from storage.
    ///
    /// Stops at the first failing step; a partial file stays on the device.
    pub async fn print_gcode(
        &self,
        gcode: Bytes,
        options: PrintOptions,
    ) -> Result<DeviceFileName, ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;

        if ctx.state.state().flags.shutdown && ctx.profile.supports(CommandKind::ClearShutdown) {
            info!("clearing pending shutdown before print");
            self.clear_shutdown().await?;
        }

        let file = match options.device_file {
            Some(file) => file,
            None => self.config.device_file()?,
        };
        let target = options
            .temperature
            .or_else(|| gcode::target_temperature(&String::from_utf8_lossy(&gcode)))
            .unwrap_or(self.config.default_temperature);
        let target = check_temperature(target)?;
        info!(file = %file, bytes = gcode.len(), target, "print requested");

        let handle = self.transfer_bytes(gcode, Some(file.clone())).await?;
        handle.wait().await?;

        if options.heat {
            ctx.execute(&Command::SetNozzleTemperature(target)).await?;
            ctx.state.set_target_temperature(target);
            ctx.state.set_heating(true);
            self.wait_heated(ctx.clone(), target).await?;
        }

        self.start_stored(&ctx, &file).await?;
        Ok(file)
    }

    /// Home, heat, and stream G-code to the firmware line by line.
    ///
    /// Nothing is stored on the device. The stream runs on a background
    /// task and shares the transfer slot, so it cannot overlap a transfer.
    /// Rejected lines are counted in the session and skipped.
    pub async fn print_direct(
        &self,
        gcode: Bytes,
        options: PrintOptions,
    ) -> Result<DirectPrintHandle, ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        let text = String::from_utf8_lossy(&gcode);
        let heating = if options.heat {
            let target = options
                .temperature
                .or_else(|| gcode::target_temperature(&text))
                .unwrap_or(self.config.default_temperature);
            Some(self.heating_request(check_temperature(target)?))
        } else {
            None
        };
        let request = DirectPrintRequest {
            lines: gcode::program_lines(&text),
            home: true,
            heating,
        };
        let handle = direct::begin_direct_print(ctx, &self.transfer_slot, request)?;
        *self.direct_cancel.lock().await = Some(handle.cancellation_token());
        Ok(handle)
    }

    /// Read a host file and stream it with [`Printer::print_direct`]
    pub async fn print_direct_file(
        &self,
        path: &Path,
        options: PrintOptions,
    ) -> Result<DirectPrintHandle, ProtocolError> {
        let data = read_source(path).await?;
        self.print_direct(data, options).await
    }

    /// Cancel the running streamed print; returns whether one was running
    pub async fn cancel_direct_print(&self) -> bool {
        match self.direct_cancel.lock().await.take() {
            Some(token) if self.transfer_slot.holder() == Some(direct::STREAMED_PRINT) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Start printing a file already in device storage
    pub async fn print_existing(&self, file: &DeviceFileName) -> Result<(), ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        self.start_stored(&ctx, file).await
    }

    /// Print the last printed file again
    pub async fn repeat_last_print(&self) -> Result<DeviceFileName, ProtocolError> {
        let file = self
            .last_print
            .lock()
            .await
            .clone()
            .ok_or(ProtocolError::NotActive("previous print"))?;
        self.print_existing(&file).await?;
        Ok(file)
    }

    pub async fn last_printed_file(&self) -> Option<DeviceFileName> {
        self.last_print.lock().await.clone()
    }

    async fn start_stored(
        &self,
        ctx: &EngineContext,
        file: &DeviceFileName,
    ) -> Result<(), ProtocolError> {
        if ctx.profile.home_before_print {
            ctx.execute(&Command::Home(HomeAxes::All)).await?;
        }
        ctx.execute(&Command::InitStorage).await?;

        let selection = file.for_selection(ctx.profile.lowercase_select);
        match ctx.execute(&Command::SelectFile(selection.clone())).await {
            Ok(_) => self.start_selected(ctx).await?,
            Err(ProtocolError::DeviceError(text))
                if ctx.profile.supports(CommandKind::SelectAndStart) =>
            {
                warn!(response = %text, "selection rejected, using select-and-start");
                ctx.execute(&Command::SelectAndStart(selection)).await?;
            }
            Err(e) => return Err(e),
        }

        ctx.state.print_started(file.stored());
        *self.last_print.lock().await = Some(file.clone());
        info!(file = %file, "print started");
        Ok(())
    }

    /// Start the selected file.
    ///
    /// A rejected standard start falls back to the vendor start, and the
    /// live profile remembers it for the rest of the connection.
    async fn start_selected(&self, ctx: &EngineContext) -> Result<(), ProtocolError> {
        match ctx.profile.start_print {
            StartPrint::Custom => {
                ctx.execute(&Command::StartStoredPrint).await?;
            }
            StartPrint::Standard => match ctx.execute(&Command::StartSelectedPrint).await {
                Ok(_) => {}
                Err(ProtocolError::DeviceError(text))
                    if ctx.profile.supports(CommandKind::StartStoredPrint) =>
                {
                    warn!(response = %text, "standard start rejected, using custom start");
                    ctx.execute(&Command::StartStoredPrint).await?;
                    self.profile.send_modify(|profile| {
                        Arc::make_mut(profile).start_print = StartPrint::Custom;
                    });
                }
                Err(e) => return Err(e),
            },
        }
        Ok(())
    }

    /// Poll status until the firmware reports an active print.
    ///
    /// Returns `false` if it never did within the configured checks.
    pub async fn verify_print_started(&self) -> Result<bool, ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        let checks = self.config.start_checks.max(1);
        for check in 1..=checks {
            match ctx.execute(&Command::QueryStatus).await {
                Ok(response) => {
                    if let Some(status) = ctx.state.merge_status(&response) {
                        debug!(check, %status, "print start check");
                        if matches!(status, PrinterStatus::SdPrint | PrinterStatus::Paused) {
                            return Ok(true);
                        }
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!(check, error = %e, "print start check failed"),
            }
            if check < checks {
                tokio::time::sleep(self.config.start_check_interval()).await;
            }
        }
        Ok(false)
    }

    pub async fn cancel_print(&self) -> Result<(), ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        ctx.execute(&Command::CancelPrint).await?;
        ctx.state.print_stopped();
        info!("print cancelled");
        Ok(())
    }

    pub async fn pause_print(&self) -> Result<(), ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        ctx.execute(&Command::PausePrint).await?;
        ctx.state.set_paused(true);
        Ok(())
    }

    pub async fn resume_print(&self) -> Result<(), ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        ctx.execute(&Command::ResumePrint).await?;
        ctx.state.set_paused(false);
        Ok(())
    }

    // ----- motion and calibration -----

    pub async fn home(&self, axes: HomeAxes) -> Result<(), ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        ctx.execute(&Command::Home(axes)).await?;
        Ok(())
    }

    /// Move relative to the current position, restoring absolute mode after
    pub async fn move_relative(&self, movement: RelativeMove) -> Result<(), ProtocolError> {
        if movement.is_empty() {
            return Ok(());
        }
        let ctx = self.context_in(PrinterMode::Firmware)?;
        ctx.execute(&Command::RelativePositioning).await?;
        let moved = ctx.execute(&Command::Move(movement)).await;
        let restored = ctx.execute(&Command::AbsolutePositioning).await;
        moved?;
        restored?;
        Ok(())
    }

    /// Start calibration; the head moves to the nozzle height point
    pub async fn start_calibration(&self) -> Result<(), ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        let mut session = self.calibration.lock().await;
        ctx.execute(&Command::StartCalibration).await?;
        *session = CalibrationSession::started();
        info!("calibration started");
        Ok(())
    }

    /// Move to the next point; returns `false` once calibration is complete
    pub async fn next_calibration_point(&self) -> Result<bool, ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        let mut session = self.calibration.lock().await;
        if !session.active {
            return Err(ProtocolError::NotActive("calibration"));
        }
        ctx.execute(&Command::NextCalibrationPoint).await?;
        let active = session.advance();
        if !active {
            info!("calibration complete");
        }
        Ok(active)
    }

    /// Jog the nozzle height at the first calibration point
    pub async fn adjust_calibration_z(&self, delta: f64) -> Result<(), ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        let session = self.calibration.lock().await;
        if !session.accepts_z_adjustment() {
            return Err(ProtocolError::NotActive("calibration height adjustment"));
        }
        ctx.execute(&Command::JogZ(delta)).await?;
        Ok(())
    }

    pub async fn cancel_calibration(&self) -> Result<(), ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        let mut session = self.calibration.lock().await;
        ctx.execute(&Command::CancelCalibration).await?;
        *session = CalibrationSession::default();
        info!("calibration cancelled");
        Ok(())
    }

    pub async fn calibration(&self) -> CalibrationSession {
        *self.calibration.lock().await
    }

    // ----- filament and device settings -----

    pub async fn load_filament(&self) -> Result<(), ProtocolError> {
        self.run(PrinterMode::Firmware, Command::LoadFilament).await
    }

    pub async fn unload_filament(&self) -> Result<(), ProtocolError> {
        self.run(PrinterMode::Firmware, Command::UnloadFilament).await
    }

    /// Filament identifier; the firmware reports it quoted
    pub async fn filament_string(&self) -> Result<String, ProtocolError> {
        let value = self.query_value(Command::QueryFilamentString).await?;
        Ok(value.trim_matches('\'').to_string())
    }

    pub async fn set_filament_string(&self, value: &str) -> Result<(), ProtocolError> {
        self.run(PrinterMode::Firmware, Command::SetFilamentString(value.to_string()))
            .await
    }

    /// Names of the files in device storage
    pub async fn file_list(&self) -> Result<Vec<String>, ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        let response = ctx.execute(&Command::ListFiles).await?;
        Ok(report::parse_file_list(&response.lines))
    }

    pub async fn firmware_string(&self) -> Result<String, ProtocolError> {
        let ctx = self.context()?;
        let response = ctx.execute(&Command::QueryFirmwareString).await?;
        response
            .value()
            .ok_or_else(|| ProtocolError::InvalidResponse(response.text()))
    }

    pub async fn set_firmware_string(&self, value: &str) -> Result<(), ProtocolError> {
        let ctx = self.context()?;
        ctx.execute(&Command::SetFirmwareString(value.to_string()))
            .await?;
        Ok(())
    }

    /// Write a firmware image from the bootloader; returns the blocks sent
    pub async fn flash_firmware(&self, image: Bytes) -> Result<u64, ProtocolError> {
        let ctx = self.context_in(PrinterMode::Bootloader)?;
        let block_size = ctx.profile.flash_block_size;
        if block_size == 0 {
            return Err(ProtocolError::Unsupported("firmware flashing"));
        }
        let _slot = self.transfer_slot.try_acquire()?;
        info!(bytes = image.len(), "flashing firmware");

        ctx.execute(&Command::BeginFlash(image.len() as u64)).await?;
        let mut blocks = 0u64;
        for block in image.chunks(block_size) {
            ctx.execute_raw(block).await?;
            blocks += 1;
        }
        info!(blocks, "firmware written");
        Ok(blocks)
    }

    pub async fn serial_number(&self) -> Result<String, ProtocolError> {
        self.query_value(Command::QuerySerialNumber).await
    }

    pub async fn set_serial_number(&self, value: &str) -> Result<(), ProtocolError> {
        self.run(PrinterMode::Firmware, Command::SetSerialNumber(value.to_string()))
            .await
    }

    /// Extruder steps per millimetre
    pub async fn extruder_steps(&self) -> Result<f64, ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        let response = ctx.execute(&Command::QueryExtruderSteps).await?;
        let text = response.text();
        report::first_number(&response.value().unwrap_or_default())
            .ok_or(ProtocolError::InvalidResponse(text))
    }

    pub async fn set_extruder_steps(&self, steps: f64) -> Result<(), ProtocolError> {
        self.run(PrinterMode::Firmware, Command::SetExtruderSteps(steps))
            .await
    }

    pub async fn factory_reset(&self) -> Result<(), ProtocolError> {
        self.run(PrinterMode::Firmware, Command::FactoryReset).await
    }

    /// Park the printer and keep the job for a later resume
    pub async fn enter_shutdown(&self) -> Result<(), ProtocolError> {
        self.run(PrinterMode::Firmware, Command::EnterShutdown).await?;
        self.state.set_shutdown(true);
        Ok(())
    }

    pub async fn clear_shutdown(&self) -> Result<(), ProtocolError> {
        self.run(PrinterMode::Firmware, Command::ClearShutdown).await?;
        self.state.set_shutdown(false);
        Ok(())
    }

    /// Send a command line as-is and return the response
    pub async fn raw_command(&self, text: &str) -> Result<Response, ProtocolError> {
        let ctx = self.context()?;
        ctx.execute_text(text.trim_end(), self.config.timeout())
            .await
    }

    async fn run(&self, mode: PrinterMode, command: Command) -> Result<(), ProtocolError> {
        let ctx = self.context_in(mode)?;
        ctx.execute(&command).await?;
        Ok(())
    }

    async fn query_value(&self, command: Command) -> Result<String, ProtocolError> {
        let ctx = self.context_in(PrinterMode::Firmware)?;
        let response = ctx.execute(&command).await?;
        response
            .value()
            .ok_or_else(|| ProtocolError::InvalidResponse(response.text()))
    }

    // ----- monitoring -----

    /// Start the status monitor (configured interval when `None`)
    pub async fn start_monitor(&self, interval: Option<Duration>) -> Result<(), ProtocolError> {
        let ctx = self.context()?;
        let mut monitor = self.monitor.lock().await;
        if monitor.as_ref().is_some_and(|m| m.is_running()) {
            return Err(ProtocolError::AlreadyInProgress("status monitor"));
        }
        let interval = interval.unwrap_or_else(|| self.config.monitor_interval());
        *monitor = Some(StatusMonitor::start(ctx, self.profile.subscribe(), interval));
        Ok(())
    }

    /// Stop the status monitor; returns whether one was running
    pub async fn stop_monitor(&self) -> bool {
        match self.monitor.lock().await.take() {
            Some(handle) => {
                let running = handle.is_running();
                handle.stop().await;
                running
            }
            None => false,
        }
    }
}

impl Drop for Printer {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().as_ref() {
            monitor.cancel();
        }
        if let Some(token) = self.transfer_cancel.get_mut().as_ref() {
            token.cancel();
        }
        if let Some(token) = self.direct_cancel.get_mut().as_ref() {
            token.cancel();
        }
        if let Some(token) = self.heating_cancel.get_mut().as_ref() {
            token.cancel();
        }
    }
}

fn initial_profile(config: &PrinterConfig) -> FirmwareProfile {
    let mut profile = config
        .firmware
        .map(FirmwareProfile::for_variant)
        .unwrap_or_default();
    if let Some(home) = config.home_before_print {
        profile.home_before_print = home;
    }
    profile
}

async fn read_source(path: &Path) -> Result<Bytes, ProtocolError> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|e| ProtocolError::File(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoDevices;

    #[async_trait]
    impl DeviceDiscovery for NoDevices {
        async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ProtocolError> {
            Ok(Vec::new())
        }

        async fn open(
            &self,
            _device: &DeviceDescriptor,
        ) -> Result<Box<dyn crate::protocol::Transport>, ProtocolError> {
            Err(ProtocolError::DeviceNotFound)
        }
    }

    fn printer(config: PrinterConfig) -> Printer {
        Printer::with_discovery(config, Arc::new(NoDevices)).unwrap()
    }

    #[tokio::test]
    async fn test_connect_without_device() {
        let printer = printer(PrinterConfig::default());
        let result = printer.connect(ModeRequirement::Any).await;
        assert_eq!(result, Err(ProtocolError::DeviceNotFound));
        assert_eq!(printer.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_operations_need_connection() {
        let printer = printer(PrinterConfig::default());
        assert_eq!(printer.home(HomeAxes::All).await, Err(ProtocolError::NotConnected));
        assert_eq!(printer.status().await, Err(ProtocolError::NotConnected));
        assert!(!printer.cancel_transfer().await);
        assert!(!printer.stop_monitor().await);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PrinterConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            Printer::with_discovery(config, Arc::new(NoDevices)),
            Err(ProtocolError::Config(_))
        ));
    }

    #[test]
    fn test_home_override_applies_to_profile() {
        let config = PrinterConfig {
            home_before_print: Some(true),
            ..Default::default()
        };
        assert!(printer(config).profile().home_before_print);
    }

    #[tokio::test]
    async fn test_repeat_without_previous_print() {
        let printer = printer(PrinterConfig::default());
        assert_eq!(
            printer.repeat_last_print().await,
            Err(ProtocolError::NotActive("previous print"))
        );
    }
}
