//! Command channel
//!
//! Owns the one physical link and serializes every command onto it. The link
//! sits behind a `tokio::sync::Mutex`, whose waiters are served in arrival
//! order, so a chatty transfer cannot starve the status monitor. The lock is
//! held for exactly one command round-trip.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::{LineKind, ProtocolError, Response, ResponseClassifier, Transport};

/// Line terminator appended to every command
pub const LINE_TERMINATOR: u8 = b'\n';

struct Link {
    transport: Box<dyn Transport>,
    classifier: ResponseClassifier,
}

/// Serialized request/response access to the printer link
pub struct CommandChannel {
    link: Mutex<Option<Link>>,
    attached: AtomicBool,
    sequence: AtomicU64,
}

impl CommandChannel {
    pub fn new() -> Self {
        Self {
            link: Mutex::new(None),
            attached: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
        }
    }

    /// Install an opened transport as the channel's link
    pub async fn attach(
        &self,
        transport: Box<dyn Transport>,
        classifier: ResponseClassifier,
    ) -> Result<(), ProtocolError> {
        let mut guard = self.link.lock().await;
        if guard.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }
        debug!(port = transport.name(), "link attached");
        *guard = Some(Link {
            transport,
            classifier,
        });
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Drop the link; returns whether one was attached
    pub async fn detach(&self) -> bool {
        let mut guard = self.link.lock().await;
        self.attached.store(false, Ordering::SeqCst);
        match guard.take() {
            Some(link) => {
                debug!(port = link.transport.name(), "link detached");
                true
            }
            None => false,
        }
    }

    /// Replace the terminal-token rules after the firmware has been identified
    pub async fn set_classifier(&self, classifier: ResponseClassifier) {
        if let Some(link) = self.link.lock().await.as_mut() {
            link.classifier = classifier;
        }
    }

    /// Whether a usable link is attached (never blocks on the link lock)
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Send one text command.
    ///
    /// With `expect_response` the call waits for a terminal token: an
    /// acknowledgment yields `Ok`, an explicit firmware rejection yields
    /// `DeviceError`, and no terminal token before `timeout` yields `Timeout`.
    /// Without it the call returns right after the write, which is what mode
    /// switches need since the link vanishes while the device reboots.
    /// Nothing is retried here.
    pub async fn send(
        &self,
        command: &str,
        timeout: Duration,
        expect_response: bool,
    ) -> Result<Response, ProtocolError> {
        self.transact(Some(command), None, timeout, expect_response)
            .await
    }

    /// Send a header line followed by raw payload bytes as one transaction
    pub async fn send_block(
        &self,
        header: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Response, ProtocolError> {
        self.transact(Some(header), Some(payload), timeout, true)
            .await
    }

    /// Send raw bytes with no header line and wait for the acknowledgment
    pub async fn send_raw(
        &self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Response, ProtocolError> {
        self.transact(None, Some(payload), timeout, true).await
    }

    async fn transact(
        &self,
        header: Option<&str>,
        payload: Option<&[u8]>,
        timeout: Duration,
        expect_response: bool,
    ) -> Result<Response, ProtocolError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(ProtocolError::NotConnected)?;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let label = match (header, payload) {
            (Some(h), _) => h.to_string(),
            (None, Some(p)) => format!("<{} raw bytes>", p.len()),
            (None, None) => String::new(),
        };
        debug!(seq, command = %label, "send");

        let result = exchange(link, header, payload, &label, timeout, expect_response).await;

        match &result {
            Err(e) if e.is_fatal() => {
                error!(seq, command = %label, error = %e, "link failed, discarding connection");
                *guard = None;
                self.attached.store(false, Ordering::SeqCst);
            }
            Err(ProtocolError::DeviceError(text)) => {
                warn!(seq, command = %label, response = %text, "command rejected");
            }
            Err(e) => debug!(seq, command = %label, error = %e, "command failed"),
            Ok(_) => {}
        }
        result
    }
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

async fn exchange(
    link: &mut Link,
    header: Option<&str>,
    payload: Option<&[u8]>,
    label: &str,
    timeout: Duration,
    expect_response: bool,
) -> Result<Response, ProtocolError> {
    // Lines left over from an earlier timed-out command must not be read as
    // this command's answer
    link.transport.discard_input().await?;

    if let Some(header) = header {
        let mut line = Vec::with_capacity(header.len() + 1);
        line.extend_from_slice(header.as_bytes());
        line.push(LINE_TERMINATOR);
        link.transport.write(&line).await?;
    }
    if let Some(payload) = payload {
        link.transport.write(payload).await?;
    }

    if !expect_response {
        return Ok(Response::unacknowledged(label));
    }

    let deadline = Instant::now() + timeout;
    let mut lines = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProtocolError::Timeout);
        }

        let line = link.transport.read_line(remaining).await?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        trace!(command = %label, line, "recv");

        match link.classifier.classify(line) {
            LineKind::Ack => return Ok(Response::acknowledged(label, lines, line.to_string())),
            LineKind::Rejected => return Err(ProtocolError::DeviceError(line.to_string())),
            LineKind::Info => lines.push(line.to_string()),
        }
    }
}
