mod common;

use beeprint_core::prelude::*;
use beeprint_core::protocol::{CommandChannel, ResponseClassifier};
use common::{SimPrinter, init_tracing};
use std::sync::Arc;
use std::time::Duration;

async fn attached_channel(sim: &SimPrinter) -> Arc<CommandChannel> {
    let discovery = sim.discovery();
    let devices = discovery.list_devices().await.unwrap();
    let transport = discovery.open(&devices[0]).await.unwrap();
    let channel = Arc::new(CommandChannel::new());
    channel
        .attach(transport, ResponseClassifier::default())
        .await
        .unwrap();
    channel
}

#[tokio::test]
async fn test_concurrent_commands_never_overlap() {
    init_tracing();
    let sim = SimPrinter::new();
    sim.with(|s| s.latency = Duration::from_millis(2));
    let channel = attached_channel(&sim).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let channel = channel.clone();
        tasks.push(tokio::spawn(async move {
            let command = if i % 2 == 0 { "M105" } else { "M625" };
            for _ in 0..3 {
                channel
                    .send(command, Duration::from_secs(1), true)
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut intervals = sim.with(|s| s.intervals.clone());
    assert_eq!(intervals.len(), 24);
    intervals.sort_by_key(|(start, _)| *start);
    for pair in intervals.windows(2) {
        assert!(
            pair[1].0 >= pair[0].1,
            "round-trips overlap: {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test]
async fn test_waiters_are_served_in_arrival_order() {
    let sim = SimPrinter::new();
    sim.with(|s| s.latency = Duration::from_millis(10));
    let channel = attached_channel(&sim).await;

    let commands = ["M115", "M117", "M625", "M105", "M1001"];
    let mut tasks = Vec::new();
    for (i, command) in commands.into_iter().enumerate() {
        let channel = channel.clone();
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5 * i as u64)).await;
            channel
                .send(command, Duration::from_secs(1), true)
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(sim.commands(), commands.to_vec());
}

#[tokio::test]
async fn test_rejection_is_device_error_not_timeout() {
    let sim = SimPrinter::new();
    let channel = attached_channel(&sim).await;

    let result = channel.send("M24", Duration::from_millis(200), true).await;
    assert_eq!(
        result,
        Err(ProtocolError::DeviceError("Bad M-code 24".into()))
    );
    // The link stays usable
    assert!(channel.is_attached());
    let response = channel
        .send("M625", Duration::from_millis(200), true)
        .await
        .unwrap();
    assert_eq!(response.lines, vec!["S:3".to_string()]);
}

#[tokio::test]
async fn test_unplugged_link_is_discarded() {
    let sim = SimPrinter::new();
    let channel = attached_channel(&sim).await;
    sim.unplug();

    let result = channel.send("M105", Duration::from_millis(200), true).await;
    assert!(matches!(result, Err(ProtocolError::Io(_))));
    assert!(!channel.is_attached());
    assert_eq!(
        channel.send("M105", Duration::from_millis(200), true).await,
        Err(ProtocolError::NotConnected)
    );
}

#[tokio::test]
async fn test_payload_lines_never_terminate_a_response() {
    let sim = SimPrinter::new();
    sim.with(|s| {
        s.files.insert("OKAY".to_string(), Vec::new());
        s.files.insert("TOGA".to_string(), Vec::new());
    });
    let channel = attached_channel(&sim).await;

    let response = channel
        .send("M20", Duration::from_millis(200), true)
        .await
        .unwrap();
    assert_eq!(
        response.lines,
        vec!["Begin file list", "OKAY 1024", "TOGA 1024", "End file list"]
    );
    assert_eq!(response.terminal.as_deref(), Some("ok"));

    // Nothing is left over to be mistaken for the next answer
    let response = channel
        .send("M625", Duration::from_millis(200), true)
        .await
        .unwrap();
    assert_eq!(response.lines, vec!["S:3".to_string()]);
}
