//! Background workers
//!
//! Each worker runs as a tokio task, takes the channel lock for one command
//! at a time and stops at the next safe point once its cancellation token
//! fires.

pub mod direct;
pub mod heating;
pub mod monitor;
pub mod transfer;

pub use direct::{
    DirectPrintHandle, DirectPrintReport, DirectPrintRequest, DirectPrintSession,
    DirectPrintStatus,
};
pub use heating::{HeatingHandle, HeatingRequest};
pub use monitor::{MonitorHandle, StatusMonitor};
pub use transfer::{
    TransferHandle, TransferReport, TransferSession, TransferSlot, TransferStatus,
};

use crate::protocol::ProtocolError;
use tokio::task::JoinError;

pub(crate) fn join_error(e: JoinError) -> ProtocolError {
    ProtocolError::TaskFailed(e.to_string())
}
