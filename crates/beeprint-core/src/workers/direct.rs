//! Host-streamed printing
//!
//! Sends a G-code program to the firmware one line at a time instead of
//! storing it first. Each line is its own channel transaction, so the status
//! monitor keeps polling in between. A rejected or unanswered line is counted
//! and skipped; only a failed link ends the stream early.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::heating::{self, HeatingRequest};
use super::join_error;
use super::transfer::TransferSlot;
use crate::context::EngineContext;
use crate::protocol::{Command, CommandKind, HomeAxes, ProtocolError};

/// Operation name of a streamed print holding the transfer slot
pub const STREAMED_PRINT: &str = "streamed print";

/// Lines between two progress log entries
const PROGRESS_LOG_EVERY: u64 = 100;

/// What to stream and how to prepare the printer
#[derive(Debug, Clone, PartialEq)]
pub struct DirectPrintRequest {
    /// Executable lines, comments and blanks already removed
    pub lines: Vec<String>,
    /// Home all axes before heating
    pub home: bool,
    /// Heat to this target and wait before the first line
    pub heating: Option<HeatingRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectPrintStatus {
    /// Homing or heating
    Preparing,
    Running,
    Completed,
    Cancelled,
    Failed(String),
}

/// Live view of one streamed print
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectPrintSession {
    pub total_lines: u64,
    /// Lines sent so far, answered or not
    pub lines_sent: u64,
    /// Lines the firmware rejected or never answered
    pub errors: u64,
    pub status: DirectPrintStatus,
}

impl DirectPrintSession {
    /// Progress in percent, clamped to [0, 100]
    pub fn progress(&self) -> f64 {
        if self.total_lines == 0 {
            return 100.0;
        }
        (self.lines_sent as f64 / self.total_lines as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn is_finished(&self) -> bool {
        !matches!(
            self.status,
            DirectPrintStatus::Preparing | DirectPrintStatus::Running
        )
    }
}

/// Outcome of a streamed print that ran to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectPrintReport {
    pub lines_sent: u64,
    pub errors: u64,
}

/// Handle to a running streamed print
pub struct DirectPrintHandle {
    cancel: CancellationToken,
    session: watch::Receiver<DirectPrintSession>,
    task: JoinHandle<Result<DirectPrintReport, ProtocolError>>,
}

impl DirectPrintHandle {
    /// Request cancellation; takes effect before the next line
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session(&self) -> DirectPrintSession {
        self.session.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DirectPrintSession> {
        self.session.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<DirectPrintReport, ProtocolError> {
        self.task.await.map_err(join_error)?
    }
}

/// Start streaming `request` on a background task.
///
/// Shares `slot` with storage transfers; fails with `AlreadyInProgress`
/// while either runs.
pub fn begin_direct_print(
    ctx: EngineContext,
    slot: &TransferSlot,
    request: DirectPrintRequest,
) -> Result<DirectPrintHandle, ProtocolError> {
    let guard = slot.try_acquire_for(STREAMED_PRINT)?;
    let cancel = CancellationToken::new();
    let (tx, rx) = watch::channel(DirectPrintSession {
        total_lines: request.lines.len() as u64,
        lines_sent: 0,
        errors: 0,
        status: DirectPrintStatus::Preparing,
    });

    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let result = run_direct_print(&ctx, &request, &tx, &token).await;
        let status = match &result {
            Ok(_) => DirectPrintStatus::Completed,
            Err(ProtocolError::Cancelled) => {
                abort(&ctx).await;
                DirectPrintStatus::Cancelled
            }
            Err(e) => {
                warn!(error = %e, "streamed print failed");
                ctx.state.set_heating(false);
                DirectPrintStatus::Failed(e.to_string())
            }
        };
        tx.send_modify(|s| s.status = status);
        ctx.state.finish_streamed_print();
        drop(guard);
        result
    });

    Ok(DirectPrintHandle {
        cancel,
        session: rx,
        task,
    })
}

async fn run_direct_print(
    ctx: &EngineContext,
    request: &DirectPrintRequest,
    session: &watch::Sender<DirectPrintSession>,
    cancel: &CancellationToken,
) -> Result<DirectPrintReport, ProtocolError> {
    let total = request.lines.len() as u64;
    info!(lines = total, "streamed print requested");

    if request.home {
        check_cancel(cancel)?;
        ctx.execute(&Command::Home(HomeAxes::All)).await?;
    }
    if let Some(heat) = request.heating {
        check_cancel(cancel)?;
        ctx.execute(&Command::SetNozzleTemperature(heat.target)).await?;
        ctx.state.set_target_temperature(heat.target);
        ctx.state.set_heating(true);
        heating::wait_for_temperature(ctx, heat, cancel).await?;
    }

    ctx.state.begin_streamed_print(total);
    session.send_modify(|s| s.status = DirectPrintStatus::Running);
    info!(lines = total, "streaming started");

    let mut sent = 0u64;
    let mut errors = 0u64;
    for line in &request.lines {
        check_cancel(cancel)?;
        match ctx.execute_text(line, ctx.timeouts.long).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                errors += 1;
                warn!(line = sent + 1, text = %line, error = %e, "line not accepted");
            }
        }
        sent += 1;
        session.send_modify(|s| {
            s.lines_sent = sent;
            s.errors = errors;
        });
        ctx.state.set_streamed_line(sent);
        if sent % PROGRESS_LOG_EVERY == 0 {
            info!(sent, total, errors, "streaming progress");
        } else {
            debug!(sent, total, "line sent");
        }
    }

    ctx.execute(&Command::SetNozzleTemperature(0.0)).await?;
    ctx.state.set_target_temperature(0.0);
    info!(sent, errors, "streamed print complete");

    Ok(DirectPrintReport {
        lines_sent: sent,
        errors,
    })
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), ProtocolError> {
    if cancel.is_cancelled() {
        return Err(ProtocolError::Cancelled);
    }
    Ok(())
}

/// Release any blocking wait, then stop the machine
async fn abort(ctx: &EngineContext) {
    info!("streamed print cancelled, stopping printer");
    ctx.state.set_heating(false);
    for command in [Command::BreakWait, Command::CancelPrint] {
        if !ctx.profile.supports(command.kind()) {
            continue;
        }
        if let Err(e) = ctx.execute(&command).await {
            warn!(error = %e, command = ?command.kind(), "abort command failed");
        }
    }
    if !ctx.profile.supports(CommandKind::CancelPrint) {
        warn!("firmware has no stop command; the printer may still be moving");
    }
}
