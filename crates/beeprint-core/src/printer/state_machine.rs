//! Printer state machine
//!
//! Single writer of [`PrinterState`]. Updates come from two paths: directly
//! from commands the engine issues (a set-temperature updates the target
//! right away) and from polled reports merged field by field. Readers get
//! copies through a `watch` channel and never hold a lock.

use chrono::Utc;
use tokio::sync::watch;
use tracing::debug;

use super::report::{self, TemperatureReport};
use super::{PrintProgress, PrinterMode, PrinterSnapshot, PrinterState, PrinterStatus};
use crate::protocol::Response;

/// Owner of the cached printer state
pub struct PrinterStateMachine {
    tx: watch::Sender<PrinterSnapshot>,
}

impl PrinterStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PrinterSnapshot::default());
        Self { tx }
    }

    /// Copy of the latest snapshot
    pub fn snapshot(&self) -> PrinterSnapshot {
        self.tx.borrow().clone()
    }

    /// Copy of the latest state
    pub fn state(&self) -> PrinterState {
        self.tx.borrow().state.clone()
    }

    /// Receiver notified on every merge
    pub fn subscribe(&self) -> watch::Receiver<PrinterSnapshot> {
        self.tx.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut PrinterState)) {
        self.tx.send_modify(|snapshot| {
            f(&mut snapshot.state);
            snapshot.version += 1;
            snapshot.updated_at = Some(Utc::now());
        });
    }

    pub fn set_mode(&self, mode: PrinterMode) {
        self.update(|s| s.mode = mode);
    }

    /// Forget everything tied to the old link after a disconnect
    pub fn reset_connection(&self) {
        self.update(|s| {
            s.mode = PrinterMode::Unknown;
            s.flags.heating = false;
            s.flags.transferring = false;
            s.transfer_progress = None;
            // A streamed print cannot outlive its link
            if s.flags.streaming {
                s.flags.streaming = false;
                s.flags.printing = false;
            }
        });
    }

    pub fn set_target_temperature(&self, target: f64) {
        self.update(|s| s.target_temperature = Some(target));
    }

    pub fn set_heating(&self, heating: bool) {
        self.update(|s| s.flags.heating = heating);
    }

    pub fn begin_transfer(&self, file: &str) {
        let file = file.to_string();
        self.update(|s| {
            s.flags.transferring = true;
            s.transfer_progress = Some(0.0);
            s.current_file = Some(file);
        });
    }

    /// Publish transfer progress; never moves backwards within a transfer
    pub fn set_transfer_progress(&self, percent: f64) {
        let percent = percent.clamp(0.0, 100.0);
        self.update(|s| {
            let current = s.transfer_progress.unwrap_or(0.0);
            s.transfer_progress = Some(current.max(percent));
        });
    }

    /// End a transfer; the last progress value is kept for inspection
    pub fn finish_transfer(&self) {
        self.update(|s| s.flags.transferring = false);
    }

    /// A start-print command was acknowledged
    pub fn print_started(&self, file: &str) {
        let file = file.to_string();
        self.update(|s| {
            s.flags.printing = true;
            s.flags.paused = false;
            s.print_observed = false;
            s.current_file = Some(file);
            s.print_progress = PrintProgress::default();
        });
    }

    /// A cancel was acknowledged or completion was observed
    pub fn print_stopped(&self) {
        self.update(|s| {
            s.flags.printing = false;
            s.flags.paused = false;
            s.print_observed = false;
        });
    }

    /// A host-streamed print of `total_lines` lines began
    pub fn begin_streamed_print(&self, total_lines: u64) {
        self.update(|s| {
            s.flags.printing = true;
            s.flags.streaming = true;
            s.flags.paused = false;
            s.print_observed = false;
            s.current_file = None;
            s.print_progress = PrintProgress {
                total_lines: Some(total_lines),
                current_line: Some(0),
                ..Default::default()
            };
        });
    }

    pub fn set_streamed_line(&self, line: u64) {
        self.update(|s| s.print_progress.current_line = Some(line));
    }

    /// The streamed print ended, whichever way
    pub fn finish_streamed_print(&self) {
        self.update(|s| {
            if s.flags.streaming {
                s.flags.printing = false;
                s.flags.streaming = false;
            }
        });
    }

    pub fn set_paused(&self, paused: bool) {
        self.update(|s| s.flags.paused = paused);
    }

    pub fn set_shutdown(&self, shutdown: bool) {
        self.update(|s| s.flags.shutdown = shutdown);
    }

    /// Merge a temperature report; absent fields keep their previous value
    pub fn apply_temperatures(&self, report: &TemperatureReport) {
        let report = *report;
        self.update(|s| {
            if let Some(v) = report.nozzle {
                s.nozzle_temperature = Some(v);
            }
            if let Some(v) = report.target {
                s.target_temperature = Some(v);
            }
            if let Some(v) = report.bed {
                s.bed_temperature = Some(v);
            }
            if let Some(v) = report.electronics {
                s.electronics_temperature = Some(v);
            }
        });
    }

    /// Merge print-session variables; absent fields keep their previous value
    pub fn apply_print_variables(&self, progress: &PrintProgress) {
        let progress = *progress;
        self.update(|s| {
            let p = &mut s.print_progress;
            if progress.estimated_time.is_some() {
                p.estimated_time = progress.estimated_time;
            }
            if progress.elapsed_time.is_some() {
                p.elapsed_time = progress.elapsed_time;
            }
            if progress.total_lines.is_some() {
                p.total_lines = progress.total_lines;
            }
            if progress.current_line.is_some() {
                p.current_line = progress.current_line;
            }
        });
    }

    /// Merge a status code.
    ///
    /// Printing is level-triggered: it turns off only once the firmware has
    /// been seen printing and then reports Ready (completion) or Shutdown.
    /// A Ready seen before the firmware picks up the job (it may still be
    /// heating) leaves the flag alone.
    pub fn apply_status(&self, status: PrinterStatus) {
        self.update(|s| {
            s.status = Some(status);
            s.mode = PrinterMode::Firmware;
            match status {
                PrinterStatus::SdPrint => {
                    s.flags.printing = true;
                    s.flags.paused = false;
                    s.print_observed = true;
                }
                PrinterStatus::Paused => {
                    s.flags.paused = true;
                    if s.flags.printing {
                        s.print_observed = true;
                    }
                }
                PrinterStatus::Shutdown => {
                    s.flags.shutdown = true;
                    s.flags.printing = false;
                    s.flags.paused = false;
                    s.print_observed = false;
                }
                PrinterStatus::Ready => {
                    s.flags.shutdown = false;
                    s.flags.paused = false;
                    if s.flags.printing && s.print_observed {
                        debug!("print completion observed");
                        s.flags.printing = false;
                        s.print_observed = false;
                    }
                }
                PrinterStatus::Moving | PrinterStatus::Transfer | PrinterStatus::Other(_) => {
                    s.flags.shutdown = false;
                }
            }
        });
    }

    /// Parse and merge a temperature query response
    pub fn merge_temperatures(&self, response: &Response) -> TemperatureReport {
        let parsed = report::parse_temperatures(&response.text());
        if !parsed.is_empty() {
            self.apply_temperatures(&parsed);
        }
        parsed
    }

    /// Parse and merge a print-variables query response
    pub fn merge_print_variables(&self, response: &Response) -> PrintProgress {
        let parsed = report::parse_print_variables(&response.text());
        if parsed != PrintProgress::default() {
            self.apply_print_variables(&parsed);
        }
        parsed
    }

    /// Parse and merge a status query response
    pub fn merge_status(&self, response: &Response) -> Option<PrinterStatus> {
        let status = report::parse_status(&response.text());
        if let Some(status) = status {
            self.apply_status(status);
        }
        status
    }

    /// A poll cycle completed; clears the failure streak
    pub fn record_poll_success(&self) {
        self.tx.send_modify(|snapshot| snapshot.failed_polls = 0);
    }

    /// A poll cycle failed; state is unknown for this cycle, values are kept
    pub fn record_poll_failure(&self) {
        self.tx
            .send_modify(|snapshot| snapshot.failed_polls = snapshot.failed_polls.saturating_add(1));
    }
}

impl Default for PrinterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_bed_keeps_last_value() {
        let sm = PrinterStateMachine::new();
        sm.apply_temperatures(&TemperatureReport {
            nozzle: Some(25.0),
            bed: Some(60.0),
            ..Default::default()
        });
        sm.apply_temperatures(&TemperatureReport {
            nozzle: Some(30.0),
            ..Default::default()
        });

        let state = sm.state();
        assert_eq!(state.nozzle_temperature, Some(30.0));
        assert_eq!(state.bed_temperature, Some(60.0));
    }

    #[test]
    fn test_direct_target_update() {
        let sm = PrinterStateMachine::new();
        sm.set_target_temperature(210.0);
        assert_eq!(sm.state().target_temperature, Some(210.0));
    }

    #[test]
    fn test_printing_is_level_triggered() {
        let sm = PrinterStateMachine::new();
        sm.print_started("ABCDE");

        // Firmware still heating: Ready before the job starts must not clear it
        sm.apply_status(PrinterStatus::Ready);
        assert!(sm.state().flags.printing);

        sm.apply_status(PrinterStatus::SdPrint);
        assert!(sm.state().flags.printing);

        sm.apply_status(PrinterStatus::Ready);
        assert!(!sm.state().flags.printing);
    }

    #[test]
    fn test_flags_overlap() {
        let sm = PrinterStateMachine::new();
        sm.set_heating(true);
        sm.begin_transfer("ABCDE");
        let flags = sm.state().flags;
        assert!(flags.heating && flags.transferring);
    }

    #[test]
    fn test_transfer_progress_is_monotonic_and_clamped() {
        let sm = PrinterStateMachine::new();
        sm.begin_transfer("ABCDE");
        sm.set_transfer_progress(40.0);
        sm.set_transfer_progress(20.0);
        assert_eq!(sm.state().transfer_progress, Some(40.0));
        sm.set_transfer_progress(140.0);
        assert_eq!(sm.state().transfer_progress, Some(100.0));
    }

    #[test]
    fn test_version_and_poll_failures() {
        let sm = PrinterStateMachine::new();
        let v0 = sm.snapshot().version;
        sm.set_mode(PrinterMode::Firmware);
        let snap = sm.snapshot();
        assert_eq!(snap.version, v0 + 1);
        assert!(snap.updated_at.is_some());

        sm.record_poll_failure();
        sm.record_poll_failure();
        assert_eq!(sm.snapshot().failed_polls, 2);
        assert_eq!(sm.state().mode, PrinterMode::Firmware);
        sm.record_poll_success();
        assert_eq!(sm.snapshot().failed_polls, 0);
    }

    #[test]
    fn test_merge_ignores_fieldless_responses() {
        let sm = PrinterStateMachine::new();
        sm.set_target_temperature(200.0);
        let response = Response::acknowledged("M105", vec![], "ok Q:0".into());
        let v = sm.snapshot().version;
        sm.merge_temperatures(&response);
        assert_eq!(sm.snapshot().version, v);
        assert_eq!(sm.state().target_temperature, Some(200.0));
    }

    #[test]
    fn test_streamed_print_progress() {
        let sm = PrinterStateMachine::new();
        sm.begin_streamed_print(200);
        sm.set_streamed_line(50);
        let state = sm.state();
        assert!(state.flags.printing && state.flags.streaming);
        assert_eq!(state.print_progress.percent(), Some(25.0));

        // Idle status while the host still streams does not end the print
        sm.apply_status(PrinterStatus::Ready);
        assert!(sm.state().flags.printing);

        sm.reset_connection();
        let flags = sm.state().flags;
        assert!(!flags.printing && !flags.streaming);
    }

    #[test]
    fn test_shutdown_status() {
        let sm = PrinterStateMachine::new();
        sm.apply_status(PrinterStatus::Shutdown);
        assert!(sm.state().flags.shutdown);
        sm.apply_status(PrinterStatus::Ready);
        assert!(!sm.state().flags.shutdown);
    }
}
