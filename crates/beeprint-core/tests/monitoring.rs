mod common;

use beeprint_core::context::{EngineContext, Timeouts};
use beeprint_core::prelude::*;
use beeprint_core::printer::PrinterStateMachine;
use beeprint_core::protocol::{CommandChannel, ResponseClassifier};
use beeprint_core::workers::StatusMonitor;
use common::{fast_config, init_tracing, SimPrinter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

async fn connected(sim: &SimPrinter, config: PrinterConfig) -> Printer {
    let printer = sim.printer(config);
    printer.connect(ModeRequirement::Any).await.unwrap();
    printer
}

async fn wait_for(printer: &Printer, check: impl Fn(&PrinterSnapshot) -> bool) -> PrinterSnapshot {
    let mut rx = printer.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if check(&snapshot) {
                return snapshot;
            }
            if rx.changed().await.is_err() {
                return snapshot;
            }
        }
    })
    .await
    .expect("condition not reached in time");
    snapshot
}

#[tokio::test]
async fn test_monitor_merges_polls() {
    init_tracing();
    let sim = SimPrinter::new();
    sim.with(|s| s.bed = Some(60.0));
    let printer = connected(&sim, fast_config()).await;
    let before = printer.snapshot().version;

    printer.start_monitor(None).await.unwrap();
    let snapshot = wait_for(&printer, |s| s.state.bed_temperature.is_some()).await;
    assert!(snapshot.version > before);
    assert!(snapshot.updated_at.is_some());
    assert_eq!(snapshot.state.nozzle_temperature, Some(25.0));
    assert_eq!(snapshot.state.status, Some(PrinterStatus::Ready));

    // The bed reading disappears; the last known value stays
    sim.with(|s| s.bed = None);
    let polls = sim.with(|s| s.commands.len());
    wait_for(&printer, |_| sim.with(|s| s.commands.len()) > polls + 4).await;
    assert_eq!(printer.snapshot().state.bed_temperature, Some(60.0));

    assert!(printer.stop_monitor().await);
    assert!(!printer.stop_monitor().await);
}

#[tokio::test]
async fn test_only_one_monitor() {
    let sim = SimPrinter::new();
    let printer = connected(&sim, fast_config()).await;
    printer.start_monitor(None).await.unwrap();
    assert_eq!(
        printer.start_monitor(None).await,
        Err(ProtocolError::AlreadyInProgress("status monitor"))
    );
    printer.stop_monitor().await;
    printer.start_monitor(None).await.unwrap();
    printer.disconnect().await;
}

#[tokio::test]
async fn test_monitor_interleaves_with_transfer() {
    init_tracing();
    let sim = SimPrinter::new();
    let printer = connected(&sim, fast_config()).await;
    sim.with(|s| s.latency = Duration::from_millis(1));

    printer.start_monitor(None).await.unwrap();
    let data: Vec<u8> = vec![b'G'; 512 * 64];
    let handle = printer.transfer_bytes(data.into(), None).await.unwrap();
    handle.wait().await.unwrap();
    printer.stop_monitor().await;

    let commands = sim.commands();
    let first_block = commands.iter().position(|c| c.starts_with("M28")).unwrap();
    let last_block = commands.iter().rposition(|c| c.starts_with("M28")).unwrap();
    assert!(
        commands[first_block..last_block]
            .iter()
            .any(|c| c == "M625"),
        "no status poll ran during the transfer"
    );
}

#[tokio::test]
async fn test_failed_polls_are_counted() {
    let sim = SimPrinter::in_bootloader();
    let printer = connected(&sim, fast_config()).await;
    assert_eq!(printer.mode(), PrinterMode::Bootloader);

    printer.start_monitor(None).await.unwrap();
    let snapshot = wait_for(&printer, |s| s.failed_polls >= 2).await;
    assert!(snapshot.failed_polls >= 2);
    printer.stop_monitor().await;
}

#[tokio::test]
async fn test_monitor_stops_when_unplugged() {
    let sim = SimPrinter::new();
    let printer = connected(&sim, fast_config()).await;
    printer.start_monitor(None).await.unwrap();

    sim.unplug();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(printer.connection_state(), ConnectionState::Disconnected);
    // The task already exited on its own
    assert!(!printer.stop_monitor().await);
}

#[tokio::test]
async fn test_print_progress_query() {
    let sim = SimPrinter::new();
    sim.with(|s| s.print_variables = "A123 B456000 C789 D100".into());
    let printer = connected(&sim, fast_config()).await;

    let progress = printer.print_progress().await.unwrap();
    assert_eq!(progress.estimated_time, Some(123));
    assert_eq!(progress.elapsed_time, Some(456_000));
    assert_eq!(progress.total_lines, Some(789));
    assert_eq!(progress.current_line, Some(100));
    assert_eq!(progress.elapsed_seconds(), Some(456.0));
    let percent = progress.percent().unwrap();
    assert!((percent - 12.674).abs() < 0.01);
}

fn count(sim: &SimPrinter, command: &str) -> usize {
    sim.commands().iter().filter(|c| c.as_str() == command).count()
}

async fn wait_for_count(sim: &SimPrinter, command: &str, at_least: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while count(sim, command) < at_least {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("monitor stalled");
}

#[tokio::test]
async fn test_monitor_follows_profile_changes() {
    let sim = SimPrinter::new();
    let discovery = sim.discovery();
    let devices = discovery.list_devices().await.unwrap();
    let transport = discovery.open(&devices[0]).await.unwrap();
    let channel = Arc::new(CommandChannel::new());
    channel
        .attach(transport, ResponseClassifier::default())
        .await
        .unwrap();

    let (profile, rx) = watch::channel(Arc::new(FirmwareProfile::bee_the_first()));
    let ctx = EngineContext {
        channel,
        state: Arc::new(PrinterStateMachine::new()),
        profile: profile.borrow().clone(),
        timeouts: Timeouts {
            normal: Duration::from_millis(500),
            long: Duration::from_secs(1),
        },
    };
    let monitor = StatusMonitor::start(ctx, rx, Duration::from_millis(10));

    wait_for_count(&sim, "M625", 2).await;

    // Marlin has no status query
    profile.send_replace(Arc::new(FirmwareProfile::marlin()));
    // The second temperature poll after the change belongs to a fresh cycle
    let polls = count(&sim, "M105");
    wait_for_count(&sim, "M105", polls + 2).await;
    let mark = sim.commands().len();
    let polls = count(&sim, "M105");
    wait_for_count(&sim, "M105", polls + 3).await;

    let after = sim.commands()[mark..].to_vec();
    assert!(!after.iter().any(|c| c == "M625"), "stale dialect used: {:?}", after);
    assert!(monitor.is_running());
    monitor.stop().await;
}
