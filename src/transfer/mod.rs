//! Chunked Transfer Protocol
//!
//! Moves one file over an established [`Channel`](crate::channel::Channel):
//! a metadata announcement, a sequence of binary chunks, then an
//! end-of-stream sentinel. Either side may abort with a cancel sentinel.

pub mod file;
pub mod receiver;
pub mod sender;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol::FileMetadata;

pub use file::{FileBlob, ReceivedFile};
pub use receiver::{ReceiverSession, ReceiverState};
pub use sender::{SenderCommand, SenderHandle, SenderSession, SenderState};

/// Transfer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Connection not ready")]
    ChannelNotReady,
    #[error("No file selected")]
    NoFileSelected,
    #[error("{0}")]
    InvalidConfig(String),
    #[error("Error reading file: {0}")]
    ReadFailure(String),
    #[error("Error sending file: {0}")]
    SendFailure(String),
    #[error("Unrecognized control message: {0}")]
    MalformedControlMessage(String),
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Received {received} bytes but {expected} were announced")]
    SizeMismatch { expected: u64, received: u64 },
}

/// Snapshot of transfer progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub transferred: u64,
    pub total: u64,
    pub percent: u8,
    /// MB/s since the transfer started
    pub throughput: f64,
}

/// Status notifications for whatever drives or displays a session
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started(FileMetadata),
    Progress(Progress),
    Paused,
    Resumed,
    /// Sender: every byte has been handed to the channel
    Sent { name: String, size: u64 },
    /// Receiver: the artifact is assembled and ready
    Received(ReceivedFile),
    Cancelled { by_peer: bool },
    Failed { reason: String },
}

pub type EventSender = mpsc::UnboundedSender<TransferEvent>;

/// How a driven session ended
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Sent,
    Received(ReceivedFile),
    Cancelled,
    /// The channel closed before end of stream
    Stalled,
}

/// Computes percentage and throughput from a start instant
#[derive(Debug, Clone, Copy)]
pub struct ProgressMeter {
    started: Instant,
    total: u64,
}

impl ProgressMeter {
    pub fn start(total: u64) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    pub fn sample(&self, transferred: u64) -> Progress {
        let percent = if self.total == 0 {
            100
        } else {
            ((transferred.min(self.total) * 100 + self.total / 2) / self.total) as u8
        };
        let elapsed = self.started.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            (transferred as f64 / (1024.0 * 1024.0)) / elapsed
        } else {
            0.0
        };
        Progress {
            transferred,
            total: self.total,
            percent,
            throughput,
        }
    }
}

pub(crate) fn emit(events: &Option<EventSender>, event: TransferEvent) {
    if let Some(events) = events {
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_progress_meter() {
        let meter = ProgressMeter::start(4 * 1024 * 1024);
        assert_eq!(meter.sample(0).throughput, 0.0);

        tokio::time::advance(Duration::from_secs(2)).await;
        let p = meter.sample(1024 * 1024);
        assert_eq!(p.percent, 25);
        assert!((p.throughput - 0.5).abs() < 1e-9);

        assert_eq!(meter.sample(4 * 1024 * 1024).percent, 100);
        assert_eq!(ProgressMeter::start(0).sample(0).percent, 100);
    }

    #[test]
    fn test_percent_rounds() {
        let meter = ProgressMeter::start(3);
        assert_eq!(meter.sample(1).percent, 33);
        assert_eq!(meter.sample(2).percent, 67);
    }
}
