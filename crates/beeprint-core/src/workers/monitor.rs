//! Status monitor
//!
//! Polls status, temperatures and (while printing) print variables on an
//! interval and merges them into the printer state. Each query is its own
//! channel transaction, so a transfer's blocks and the monitor's queries
//! interleave instead of one waiting for the other to finish.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::protocol::{Command, FirmwareProfile, ProtocolError};

/// Periodic status poller
pub struct StatusMonitor;

impl StatusMonitor {
    /// Start polling every `interval` on a background task.
    ///
    /// The dialect is re-read from `profile` at the start of every cycle, so
    /// a mode switch or re-identification takes effect without a restart.
    pub fn start(
        mut ctx: EngineContext,
        profile: watch::Receiver<Arc<FirmwareProfile>>,
        interval: Duration,
    ) -> MonitorHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "status monitor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                ctx.profile = profile.borrow().clone();
                if let Err(e) = Self::poll_once(&ctx).await {
                    if e.is_fatal() {
                        warn!(error = %e, "link lost, status monitor stopping");
                        break;
                    }
                }
            }
            info!("status monitor stopped");
        });
        MonitorHandle { cancel, task }
    }

    /// Run one poll cycle.
    ///
    /// Queries the firmware does not support are skipped. A failed query
    /// leaves the previous values in place and counts the cycle as failed.
    pub async fn poll_once(ctx: &EngineContext) -> Result<(), ProtocolError> {
        let mut queries = vec![Command::QueryStatus, Command::QueryTemperatures];
        let flags = ctx.state.state().flags;
        // A streamed print keeps its own line counters
        if flags.printing && !flags.streaming {
            queries.push(Command::QueryPrintVariables);
        }

        let mut failure = None;
        for query in queries.iter().filter(|q| ctx.supports(q)) {
            match ctx.execute(query).await {
                Ok(response) => match query {
                    Command::QueryStatus => {
                        ctx.state.merge_status(&response);
                    }
                    Command::QueryTemperatures => {
                        ctx.state.merge_temperatures(&response);
                    }
                    _ => {
                        ctx.state.merge_print_variables(&response);
                    }
                },
                Err(e) if e.is_fatal() => {
                    ctx.state.record_poll_failure();
                    return Err(e);
                }
                Err(e) => {
                    debug!(error = %e, "status query failed");
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => {
                ctx.state.record_poll_failure();
                Err(e)
            }
            None => {
                ctx.state.record_poll_success();
                Ok(())
            }
        }
    }
}

/// Handle to a running monitor
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal the task to stop without waiting for it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop polling and wait for the task to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "status monitor task failed");
        }
    }
}
