//! Shared handles every operation and background worker runs against

use std::sync::Arc;
use std::time::Duration;

use crate::printer::PrinterStateMachine;
use crate::protocol::{
    Command, CommandChannel, FirmwareProfile, ProtocolError, Response, TimeoutClass,
};

/// Per-class command timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub normal: Duration,
    pub long: Duration,
}

impl Timeouts {
    pub fn for_class(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Normal => self.normal,
            TimeoutClass::Long => self.long,
        }
    }
}

/// Channel, state and firmware dialect bundled for one connection.
///
/// Cloning is cheap; workers receive their own copy when spawned.
#[derive(Clone)]
pub struct EngineContext {
    pub channel: Arc<CommandChannel>,
    pub state: Arc<PrinterStateMachine>,
    pub profile: Arc<FirmwareProfile>,
    pub timeouts: Timeouts,
}

impl EngineContext {
    /// Render a command in the current dialect and run one round-trip
    pub async fn execute(&self, command: &Command) -> Result<Response, ProtocolError> {
        command.validate()?;
        let text = self.profile.render(command)?;
        let timeout = self.timeouts.for_class(command.timeout_class());
        self.channel
            .send(&text, timeout, command.expects_response())
            .await
    }

    /// Send a rendered header plus raw payload as one transaction
    pub async fn execute_block(
        &self,
        header: &Command,
        payload: &[u8],
    ) -> Result<Response, ProtocolError> {
        let text = self.profile.render(header)?;
        let timeout = self.timeouts.for_class(header.timeout_class());
        self.channel.send_block(&text, payload, timeout).await
    }

    /// Send raw bytes and wait for the acknowledgment
    pub async fn execute_raw(&self, payload: &[u8]) -> Result<Response, ProtocolError> {
        self.channel.send_raw(payload, self.timeouts.normal).await
    }

    /// Send caller-supplied text untouched
    pub async fn execute_text(
        &self,
        text: &str,
        timeout: Duration,
    ) -> Result<Response, ProtocolError> {
        self.channel.send(text, timeout, true).await
    }

    pub fn supports(&self, command: &Command) -> bool {
        self.profile.supports(command.kind())
    }
}
