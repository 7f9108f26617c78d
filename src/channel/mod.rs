//! Transfer Channel
//!
//! An ordered, bidirectional message transport between the two peers. The
//! transfer protocols only see this thin capability: send text or binary,
//! inspect the outstanding buffer depth, and consume [`ChannelEvent`]s.

pub mod memory;
pub mod stream;

use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryChannel;
pub use stream::StreamChannel;

/// One message on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    /// Bytes this message occupies in the send buffer
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Events delivered to the owner of a channel endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Message),
    /// The buffered amount dropped to or below the low threshold
    BufferedAmountLow,
    Closed,
}

/// Receiving side of a channel endpoint's events
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel is not open")]
    NotOpen,
    #[error("Channel closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability handed to the transfer protocols
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Queue a message. Never blocks; queued bytes count towards
    /// [`Channel::buffered_amount`] until they leave the process.
    fn send(&self, message: Message) -> Result<(), ChannelError>;

    fn buffered_amount(&self) -> usize;

    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    fn close(&self);
}

/// Counts outstanding bytes and raises [`ChannelEvent::BufferedAmountLow`]
/// once per downward crossing of the threshold.
#[derive(Debug)]
pub struct BufferGauge {
    amount: AtomicUsize,
    threshold: AtomicUsize,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl BufferGauge {
    pub fn new(events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            amount: AtomicUsize::new(0),
            threshold: AtomicUsize::new(0),
            events,
        }
    }

    pub fn amount(&self) -> usize {
        self.amount.load(Ordering::Acquire)
    }

    pub fn set_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::Release);
    }

    pub fn add(&self, bytes: usize) {
        self.amount.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn release(&self, bytes: usize) {
        let before = self.amount.fetch_sub(bytes, Ordering::AcqRel);
        let after = before.saturating_sub(bytes);
        let threshold = self.threshold.load(Ordering::Acquire);
        if before > threshold && after <= threshold {
            let _ = self.events.send(ChannelEvent::BufferedAmountLow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_fires_once_per_crossing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gauge = BufferGauge::new(tx);
        gauge.set_threshold(100);

        gauge.add(300);
        gauge.release(100);
        assert!(rx.try_recv().is_err());
        gauge.release(150);
        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::BufferedAmountLow);
        gauge.release(50);
        assert!(rx.try_recv().is_err());
        assert_eq!(gauge.amount(), 0);

        gauge.add(50);
        gauge.release(50);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_message_len() {
        assert_eq!(Message::Text("EOF".into()).len(), 3);
        assert_eq!(Message::Binary(Bytes::from_static(&[0; 10])).len(), 10);
        assert!(Message::Binary(Bytes::new()).is_empty());
    }
}
