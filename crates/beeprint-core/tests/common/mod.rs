//! Simulated BEETHEFIRST printer for integration tests
//!
//! Speaks the firmware's line protocol over an in-memory transport. Mode
//! switches bump a generation counter: links opened before the switch go
//! dead and discovery reports a new device, the way the real USB interface
//! re-enumerates.

#![allow(dead_code)]

use async_trait::async_trait;
use beeprint_core::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use beeprint_core::protocol::TransportError;

pub const FIRMWARE_IDENTITY: &str = "BEEVC-BEETHEFIRST-10.5.1";

/// Observable and scriptable printer state
pub struct SimState {
    pub mode: PrinterMode,
    /// Bumped on every reboot; older links are dead
    pub generation: u64,
    pub present: bool,
    /// Discovery calls that still find nothing after a reboot
    pub absent_polls: u32,
    pub status: u8,
    pub nozzle: f64,
    pub target: f64,
    /// Degrees the nozzle gains per temperature query
    pub heat_step: f64,
    pub bed: Option<f64>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub open_file: Option<(String, Vec<u8>)>,
    /// (first, last, payload length) of each block received
    pub blocks: Vec<(u64, u64, usize)>,
    pub selected: Option<String>,
    pub print_variables: String,
    pub filament: String,
    pub identity: String,
    pub serial: String,
    pub extruder_steps: f64,
    /// Every command line received, in order
    pub commands: Vec<String>,
    /// Round-trip window of each acknowledged command
    pub intervals: Vec<(Instant, Instant)>,
    /// Delay before each response line
    pub latency: Duration,
    /// Reject the next file creation
    pub storage_full: bool,
    /// Accept the standard `M24` start; older revisions answer "Bad M-code"
    pub standard_start: bool,
    /// Reject every `M23` selection
    pub select_broken: bool,
    pub flash_expected: usize,
    pub flashed: Vec<u8>,
    pub opens: u32,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            mode: PrinterMode::Firmware,
            generation: 0,
            present: true,
            absent_polls: 0,
            status: 3,
            nozzle: 25.0,
            target: 0.0,
            heat_step: 50.0,
            bed: None,
            files: BTreeMap::new(),
            open_file: None,
            blocks: Vec::new(),
            selected: None,
            print_variables: "A0 B0 C0 D0".to_string(),
            filament: "A023 - Black".to_string(),
            identity: FIRMWARE_IDENTITY.to_string(),
            serial: "0000000001".to_string(),
            extruder_steps: 441.3,
            commands: Vec::new(),
            intervals: Vec::new(),
            latency: Duration::ZERO,
            storage_full: false,
            standard_start: false,
            select_broken: false,
            flash_expected: 0,
            flashed: Vec::new(),
            opens: 0,
        }
    }
}

/// Handle shared between the test and the simulated links
#[derive(Clone, Default)]
pub struct SimPrinter {
    pub state: Arc<Mutex<SimState>>,
}

impl SimPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_bootloader() -> Self {
        let sim = Self::new();
        sim.with(|s| s.mode = PrinterMode::Bootloader);
        sim
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn commands(&self) -> Vec<String> {
        self.with(|s| s.commands.clone())
    }

    pub fn unplug(&self) {
        self.with(|s| s.present = false);
    }

    pub fn discovery(&self) -> Arc<SimDiscovery> {
        Arc::new(SimDiscovery { sim: self.clone() })
    }

    /// Printer configured for fast tests against this simulator
    pub fn printer(&self, config: PrinterConfig) -> Printer {
        Printer::with_discovery(config, self.discovery()).unwrap()
    }
}

/// Config with short timings suited to the simulator
pub fn fast_config() -> PrinterConfig {
    PrinterConfig {
        timeout_ms: 500,
        long_timeout_ms: 1000,
        reset_delay_ms: 10,
        reconnect_interval_ms: 10,
        monitor_interval_ms: 20,
        heating_poll_ms: 10,
        start_check_interval_ms: 10,
        ..Default::default()
    }
}

fn device_name(generation: u64) -> String {
    format!("/dev/ttyACM{}", generation)
}

pub struct SimDiscovery {
    sim: SimPrinter,
}

#[async_trait]
impl DeviceDiscovery for SimDiscovery {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ProtocolError> {
        Ok(self.sim.with(|s| {
            if !s.present {
                return Vec::new();
            }
            if s.absent_polls > 0 {
                s.absent_polls -= 1;
                return Vec::new();
            }
            vec![DeviceDescriptor {
                name: device_name(s.generation),
                vid: Some(0x29c9),
                pid: Some(0x0001),
                manufacturer: Some("BEEVERYCREATIVE".into()),
                product: Some("BEETHEFIRST".into()),
                serial_number: Some(s.serial.clone()),
            }]
        }))
    }

    async fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn Transport>, ProtocolError> {
        let generation = self.sim.with(|s| {
            if !s.present || device.name != device_name(s.generation) {
                return None;
            }
            s.opens += 1;
            Some(s.generation)
        });
        let generation = generation.ok_or(ProtocolError::DeviceNotFound)?;
        Ok(Box::new(SimTransport {
            sim: self.sim.clone(),
            name: device.name.clone(),
            generation,
            input: Vec::new(),
            raw_expected: 0,
            pending: VecDeque::new(),
            started: None,
        }))
    }
}

pub struct SimTransport {
    sim: SimPrinter,
    name: String,
    generation: u64,
    input: Vec<u8>,
    /// Payload bytes still owed for the current block
    raw_expected: usize,
    pending: VecDeque<String>,
    started: Option<Instant>,
}

impl SimTransport {
    fn alive(&self) -> Result<(), TransportError> {
        self.sim.with(|s| {
            if !s.present {
                Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "device unplugged",
                )))
            } else if s.generation != self.generation {
                Err(TransportError::Closed)
            } else {
                Ok(())
            }
        })
    }

    fn process_input(&mut self) {
        loop {
            if self.raw_expected > 0 {
                if self.input.len() < self.raw_expected {
                    return;
                }
                let payload: Vec<u8> = self.input.drain(..self.raw_expected).collect();
                self.raw_expected = 0;
                self.sim.with(|s| {
                    if let Some((_, data)) = s.open_file.as_mut() {
                        data.extend_from_slice(&payload);
                    }
                    if let Some(last) = s.blocks.last_mut() {
                        last.2 = payload.len();
                    }
                });
                self.pending.push_back("tog".into());
                continue;
            }

            let flashing = self.sim.with(|s| s.flash_expected > 0);
            if flashing {
                if self.input.is_empty() {
                    return;
                }
                let take = self.sim.with(|s| s.flash_expected.min(64));
                if self.input.len() < take {
                    return;
                }
                let block: Vec<u8> = self.input.drain(..take).collect();
                self.sim.with(|s| {
                    s.flash_expected -= block.len();
                    s.flashed.extend_from_slice(&block);
                });
                self.pending.push_back("ok".into());
                continue;
            }

            let Some(pos) = self.input.iter().position(|&b| b == b'\n') else {
                return;
            };
            let line: Vec<u8> = self.input.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                self.started = Some(Instant::now());
                self.handle(&line);
            }
        }
    }

    fn handle(&mut self, line: &str) {
        let mut replies: Vec<String> = Vec::new();
        let mut raw_expected = 0usize;
        self.sim.with(|s| {
            s.commands.push(line.to_string());
            let mut words = line.split_whitespace();
            let code = words.next().unwrap_or("").to_ascii_uppercase();
            let args: Vec<&str> = words.collect();
            let arg = |prefix: char| {
                args.iter()
                    .find_map(|a| a.strip_prefix(prefix))
                    .map(str::to_string)
            };
            let rest = line.split_once(' ').map(|(_, r)| r.to_string()).unwrap_or_default();

            if s.mode == PrinterMode::Bootloader {
                match code.as_str() {
                    "M630" => reboot(s, PrinterMode::Firmware),
                    "M609" => {}
                    "M115" => {
                        replies.push("Bootloader 3.1.0".into());
                        replies.push("ok".into());
                    }
                    "M650" => {
                        s.flash_expected = arg('A').and_then(|v| v.parse().ok()).unwrap_or(0);
                        s.flashed.clear();
                        replies.push("ok".into());
                    }
                    other => replies.push(format!("Bad M-code {}", other.trim_start_matches('M'))),
                }
                return;
            }

            match code.as_str() {
                "M625" => {
                    replies.push(format!("S:{}", s.status));
                    replies.push("ok Q:0".into());
                }
                "M105" => {
                    if s.target > s.nozzle {
                        s.nozzle = (s.nozzle + s.heat_step).min(s.target);
                    }
                    let mut text = format!("T:{:.1} /{:.1}", s.nozzle, s.target);
                    if let Some(bed) = s.bed {
                        text.push_str(&format!(" B:{:.1}", bed));
                    }
                    replies.push(text);
                    replies.push("ok Q:0".into());
                }
                "M32" => match rest.strip_prefix('!') {
                    Some(name) if s.files.contains_key(&name.to_ascii_uppercase()) => {
                        s.selected = Some(name.to_string());
                        s.status = 5;
                        replies.push("ok".into());
                    }
                    Some(name) => replies.push(format!("error opening file {}", name)),
                    None => {
                        replies.push(s.print_variables.clone());
                        replies.push("ok".into());
                    }
                },
                "M630" => {}
                "M609" => reboot(s, PrinterMode::Bootloader),
                "M104" | "M703" => {
                    s.target = arg('S').and_then(|v| v.parse().ok()).unwrap_or(0.0);
                    replies.push("ok".into());
                }
                "M704" => {
                    s.target = 0.0;
                    replies.push("ok".into());
                }
                "M21" | "M701" | "M702" | "M607" | "M114" | "G28" | "G90" | "G91" | "G1"
                | "G0" | "G131" | "G132" => {
                    if code == "M114" {
                        s.identity = arg('A').unwrap_or_default();
                    }
                    replies.push("ok".into());
                }
                "M20" => {
                    replies.push("Begin file list".into());
                    for name in s.files.keys() {
                        replies.push(format!("{} 1024", name));
                    }
                    replies.push("End file list".into());
                    replies.push("ok".into());
                }
                "M30" => {
                    if s.storage_full {
                        replies.push("error creating file".into());
                    } else {
                        s.open_file = Some((rest.clone(), Vec::new()));
                        replies.push("ok".into());
                    }
                }
                "M28" => {
                    let first: u64 = arg('A').and_then(|v| v.parse().ok()).unwrap_or(0);
                    let last: u64 = arg('D').and_then(|v| v.parse().ok()).unwrap_or(0);
                    s.blocks.push((first, last, 0));
                    raw_expected = (last - first + 1) as usize;
                }
                "M29" => {
                    if let Some((name, data)) = s.open_file.take() {
                        s.files.insert(name, data);
                    }
                    replies.push("ok".into());
                }
                "M23" => {
                    let exists = s.files.contains_key(&rest.to_ascii_uppercase());
                    if exists && rest == rest.to_ascii_lowercase() && !s.select_broken {
                        s.selected = Some(rest.clone());
                        replies.push(format!("File opened:{} Size:1024", rest));
                        replies.push("File selected".into());
                        replies.push("ok".into());
                    } else {
                        replies.push(format!("error opening file {}", rest));
                    }
                }
                "M24" if s.standard_start => {
                    if s.selected.is_some() {
                        s.status = 5;
                        replies.push("ok".into());
                    } else {
                        replies.push("error: no file selected".into());
                    }
                }
                "M108" => replies.push("ok".into()),
                "M33" => {
                    if s.selected.is_some() {
                        s.status = 5;
                        replies.push("ok".into());
                    } else {
                        replies.push("error: no file selected".into());
                    }
                }
                "M640" => {
                    s.status = 7;
                    replies.push("ok".into());
                }
                "M643" => {
                    s.status = 5;
                    replies.push("ok".into());
                }
                "M112" => {
                    s.status = 3;
                    replies.push("ok".into());
                }
                "M1001" => {
                    replies.push(format!("'{}'", s.filament));
                    replies.push("ok".into());
                }
                "M1000" => {
                    s.filament = rest.clone();
                    replies.push("ok".into());
                }
                "M115" => {
                    replies.push(s.identity.clone());
                    replies.push("ok".into());
                }
                "M117" => {
                    replies.push(s.serial.clone());
                    replies.push("ok".into());
                }
                "M118" => {
                    s.serial = arg('T').unwrap_or_default();
                    replies.push("ok".into());
                }
                "M200" => {
                    match arg('P').and_then(|v| v.parse().ok()) {
                        Some(steps) => s.extruder_steps = steps,
                        None => replies.push(format!("E Steps: {}", s.extruder_steps)),
                    }
                    replies.push("ok".into());
                }
                "M36" => {
                    s.status = 9;
                    replies.push("ok".into());
                }
                "M505" => {
                    s.status = 3;
                    replies.push("ok".into());
                }
                other if other.starts_with('G') => {
                    replies.push(format!("Bad G-code {}", other.trim_start_matches('G')))
                }
                other => replies.push(format!("Bad M-code {}", other.trim_start_matches('M'))),
            }
        });
        self.raw_expected = raw_expected;
        self.pending.extend(replies);
    }
}

fn reboot(s: &mut SimState, mode: PrinterMode) {
    s.mode = mode;
    s.generation += 1;
    s.status = 3;
}

#[async_trait]
impl Transport for SimTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.alive()?;
        self.input.extend_from_slice(bytes);
        self.process_input();
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        self.alive()?;
        let Some(line) = self.pending.pop_front() else {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout);
        };
        let latency = self.sim.with(|s| s.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("ok") || lower.starts_with("tog") {
            if let Some(started) = self.started.take() {
                let now = Instant::now();
                self.sim.with(|s| s.intervals.push((started, now)));
            }
        }
        Ok(line)
    }

    async fn discard_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Route engine logs to the test output
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
