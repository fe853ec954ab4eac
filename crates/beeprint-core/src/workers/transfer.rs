//! File transfer into device storage
//!
//! The file is created on the device, then streamed in fixed-size blocks,
//! each block one channel transaction (`M28 A<first> D<last>` header plus
//! raw bytes), and closed. A status poll may run between two blocks.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::join_error;
use crate::context::EngineContext;
use crate::printer::DeviceFileName;
use crate::protocol::{Command, ProtocolError};

/// Operation name of a storage transfer holding the slot
pub const FILE_TRANSFER: &str = "file transfer";

/// Guards the single bulk operation (storage transfer or streamed print)
/// allowed per connection
#[derive(Debug, Clone, Default)]
pub struct TransferSlot {
    holder: Arc<Mutex<Option<&'static str>>>,
}

impl TransferSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for a storage transfer
    pub fn try_acquire(&self) -> Result<TransferGuard, ProtocolError> {
        self.try_acquire_for(FILE_TRANSFER)
    }

    /// Claim the slot for `operation`; it is released when the guard drops.
    ///
    /// A busy slot fails with `AlreadyInProgress` naming the current holder.
    pub fn try_acquire_for(
        &self,
        operation: &'static str,
    ) -> Result<TransferGuard, ProtocolError> {
        let mut holder = lock(&self.holder);
        if let Some(current) = *holder {
            return Err(ProtocolError::AlreadyInProgress(current));
        }
        *holder = Some(operation);
        Ok(TransferGuard {
            holder: self.holder.clone(),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.holder().is_some()
    }

    /// Operation currently holding the slot
    pub fn holder(&self) -> Option<&'static str> {
        *lock(&self.holder)
    }
}

fn lock<'a>(holder: &'a Mutex<Option<&'static str>>) -> MutexGuard<'a, Option<&'static str>> {
    holder.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds the transfer slot for as long as it lives
#[derive(Debug)]
pub struct TransferGuard {
    holder: Arc<Mutex<Option<&'static str>>>,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        *lock(&self.holder) = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Running,
    Completed,
    Cancelled,
    Failed(String),
}

/// Live view of one transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSession {
    pub file: DeviceFileName,
    /// Bytes acknowledged by the device so far
    pub offset: u64,
    pub total: u64,
    pub chunk_size: usize,
    pub status: TransferStatus,
}

impl TransferSession {
    /// Progress in percent, clamped to [0, 100]
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.offset as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn is_finished(&self) -> bool {
        self.status != TransferStatus::Running
    }
}

/// Outcome of a completed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub file: DeviceFileName,
    pub bytes_sent: u64,
    pub chunks: u64,
}

/// Handle to a running transfer task
pub struct TransferHandle {
    cancel: CancellationToken,
    session: watch::Receiver<TransferSession>,
    task: JoinHandle<Result<TransferReport, ProtocolError>>,
}

impl TransferHandle {
    /// Request cancellation; takes effect before the next block
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session(&self) -> TransferSession {
        self.session.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferSession> {
        self.session.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to end
    pub async fn wait(self) -> Result<TransferReport, ProtocolError> {
        self.task.await.map_err(join_error)?
    }
}

/// Start streaming `source` into `file` on a background task.
///
/// Fails immediately with `AlreadyInProgress` if another transfer holds
/// `slot`.
pub fn begin_transfer(
    ctx: EngineContext,
    slot: &TransferSlot,
    source: Bytes,
    file: DeviceFileName,
    chunk_size: usize,
) -> Result<TransferHandle, ProtocolError> {
    if chunk_size == 0 {
        return Err(ProtocolError::Config("chunk size must be positive".into()));
    }
    let guard = slot.try_acquire()?;
    let cancel = CancellationToken::new();
    let (tx, rx) = watch::channel(TransferSession {
        file: file.clone(),
        offset: 0,
        total: source.len() as u64,
        chunk_size,
        status: TransferStatus::Running,
    });

    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let result = run_transfer(&ctx, &source, &tx, &token).await;
        let status = match &result {
            Ok(_) => TransferStatus::Completed,
            Err(ProtocolError::Cancelled) => TransferStatus::Cancelled,
            Err(e) => TransferStatus::Failed(e.to_string()),
        };
        tx.send_modify(|s| s.status = status);
        ctx.state.finish_transfer();
        drop(guard);
        result
    });

    Ok(TransferHandle {
        cancel,
        session: rx,
        task,
    })
}

async fn run_transfer(
    ctx: &EngineContext,
    source: &Bytes,
    session: &watch::Sender<TransferSession>,
    cancel: &CancellationToken,
) -> Result<TransferReport, ProtocolError> {
    let (file, chunk_size) = {
        let s = session.borrow();
        (s.file.clone(), s.chunk_size)
    };
    let total = source.len() as u64;
    info!(file = %file, bytes = total, chunk_size, "transfer started");
    ctx.state.begin_transfer(file.stored());

    if cancel.is_cancelled() {
        info!(file = %file, "transfer cancelled before the file was created");
        return Err(ProtocolError::Cancelled);
    }
    ctx.execute(&Command::CreateFile(file.stored().to_string()))
        .await?;

    let mut offset = 0u64;
    let mut chunks = 0u64;
    for chunk in source.chunks(chunk_size) {
        if cancel.is_cancelled() {
            info!(file = %file, offset, "transfer cancelled");
            if ctx.profile.close_on_abort {
                if let Err(e) = ctx.execute(&Command::CloseFile).await {
                    warn!(error = %e, "could not close partial file");
                }
            }
            return Err(ProtocolError::Cancelled);
        }

        let last = offset + chunk.len() as u64 - 1;
        ctx.execute_block(&Command::WriteBlock { first: offset, last }, chunk)
            .await?;

        offset += chunk.len() as u64;
        chunks += 1;
        session.send_modify(|s| s.offset = offset);
        let progress = session.borrow().progress();
        ctx.state.set_transfer_progress(progress);
        debug!(offset, total, progress, "block written");
    }

    ctx.execute(&Command::CloseFile).await?;
    ctx.state.set_transfer_progress(100.0);
    info!(file = %file, bytes = offset, chunks, "transfer complete");

    Ok(TransferReport {
        file,
        bytes_sent: offset,
        chunks,
    })
}
