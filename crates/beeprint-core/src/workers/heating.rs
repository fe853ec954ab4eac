//! Heating waiter
//!
//! Polls the nozzle temperature until it is within tolerance of the target.
//! The channel lock is only held for each temperature query, never across
//! the sleep between polls.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::join_error;
use crate::context::EngineContext;
use crate::printer::PrinterStateMachine;
use crate::protocol::{Command, ProtocolError};

/// What to wait for
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatingRequest {
    pub target: f64,
    /// Degrees either side of the target that count as reached
    pub tolerance: f64,
    pub poll_interval: Duration,
    /// Give up with `Timeout` after this long
    pub ceiling: Option<Duration>,
}

impl HeatingRequest {
    pub fn is_reached(&self, current: f64) -> bool {
        (current - self.target).abs() <= self.tolerance
    }
}

/// Wait until the nozzle reaches the requested temperature.
///
/// Returns the temperature that satisfied the request. Failed polls are
/// logged and retried on the next interval unless the link itself failed.
///
/// The heating flag is cleared when the target is reached, the ceiling
/// passes or the link fails. A cancelled wait leaves it to the canceller:
/// [`HeatingHandle::cancel`] clears it, a replacing wait keeps it set.
pub async fn wait_for_temperature(
    ctx: &EngineContext,
    request: HeatingRequest,
    cancel: &CancellationToken,
) -> Result<f64, ProtocolError> {
    let deadline = request.ceiling.map(|c| Instant::now() + c);
    info!(setpoint = request.target, "waiting for nozzle temperature");

    loop {
        if cancel.is_cancelled() {
            info!("heating wait cancelled");
            return Err(ProtocolError::Cancelled);
        }

        match ctx.execute(&Command::QueryTemperatures).await {
            Ok(response) => {
                let report = ctx.state.merge_temperatures(&response);
                ctx.state.record_poll_success();
                if let Some(current) = report.nozzle {
                    debug!(current, setpoint = request.target, "nozzle temperature");
                    if request.is_reached(current) {
                        info!(current, "target temperature reached");
                        ctx.state.set_heating(false);
                        return Ok(current);
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                ctx.state.set_heating(false);
                return Err(e);
            }
            Err(e) => {
                ctx.state.record_poll_failure();
                warn!(error = %e, "temperature poll failed");
            }
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                warn!(setpoint = request.target, "heating did not reach target in time");
                ctx.state.set_heating(false);
                return Err(ProtocolError::Timeout);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("heating wait cancelled");
                return Err(ProtocolError::Cancelled);
            }
            _ = tokio::time::sleep(request.poll_interval) => {}
        }
    }
}

/// Handle to a heating wait running in the background
pub struct HeatingHandle {
    cancel: CancellationToken,
    state: Arc<PrinterStateMachine>,
    task: JoinHandle<Result<f64, ProtocolError>>,
}

impl HeatingHandle {
    /// Run [`wait_for_temperature`] on its own task
    pub fn spawn(ctx: EngineContext, request: HeatingRequest) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let state = ctx.state.clone();
        let task =
            tokio::spawn(async move { wait_for_temperature(&ctx, request, &token).await });
        Self {
            cancel,
            state,
            task,
        }
    }

    /// Stop waiting; the firmware keeps its target
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.state.set_heating(false);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<f64, ProtocolError> {
        self.task.await.map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance() {
        let request = HeatingRequest {
            target: 210.0,
            tolerance: 2.0,
            poll_interval: Duration::from_secs(2),
            ceiling: None,
        };
        assert!(request.is_reached(208.0));
        assert!(request.is_reached(211.5));
        assert!(!request.is_reached(207.9));
        assert!(!request.is_reached(25.0));
    }
}
