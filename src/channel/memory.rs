//! In-process channel pair.
//!
//! Messages sent on one end are held in its outbox until [`MemoryChannel::flush`]
//! moves them to the peer, which makes buffer depth fully controllable.
//! Pairs built with [`MemoryChannel::loopback`] deliver immediately.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{BufferGauge, Channel, ChannelError, ChannelEvent, ChannelEvents, Message};

pub struct MemoryChannel {
    open: Arc<AtomicBool>,
    outbox: Mutex<VecDeque<Message>>,
    gauge: BufferGauge,
    own_events: mpsc::UnboundedSender<ChannelEvent>,
    peer_events: mpsc::UnboundedSender<ChannelEvent>,
    immediate: bool,
}

impl MemoryChannel {
    /// Two connected endpoints whose sends stay buffered until flushed
    pub fn pair() -> ((Arc<Self>, ChannelEvents), (Arc<Self>, ChannelEvents)) {
        Self::build(false)
    }

    /// Two connected endpoints whose sends are delivered at once
    pub fn loopback() -> ((Arc<Self>, ChannelEvents), (Arc<Self>, ChannelEvents)) {
        Self::build(true)
    }

    fn build(immediate: bool) -> ((Arc<Self>, ChannelEvents), (Arc<Self>, ChannelEvents)) {
        let open = Arc::new(AtomicBool::new(true));
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = Arc::new(Self::endpoint(open.clone(), a_tx.clone(), b_tx.clone(), immediate));
        let b = Arc::new(Self::endpoint(open, b_tx.clone(), a_tx.clone(), immediate));

        let _ = a_tx.send(ChannelEvent::Open);
        let _ = b_tx.send(ChannelEvent::Open);
        ((a, a_rx), (b, b_rx))
    }

    fn endpoint(
        open: Arc<AtomicBool>,
        own_events: mpsc::UnboundedSender<ChannelEvent>,
        peer_events: mpsc::UnboundedSender<ChannelEvent>,
        immediate: bool,
    ) -> Self {
        Self {
            open,
            outbox: Mutex::new(VecDeque::new()),
            gauge: BufferGauge::new(own_events.clone()),
            own_events,
            peer_events,
            immediate,
        }
    }

    /// Deliver queued messages to the peer until at least `max_bytes` have
    /// moved or the outbox is empty. Returns the bytes delivered.
    pub fn flush(&self, max_bytes: usize) -> usize {
        let mut delivered = 0;
        while delivered < max_bytes {
            let next = self.outbox.lock().pop_front();
            let Some(message) = next else { break };
            let len = message.len();
            let _ = self.peer_events.send(ChannelEvent::Message(message));
            self.gauge.release(len);
            delivered += len;
        }
        delivered
    }

    /// Deliver everything queued so far
    pub fn flush_all(&self) -> usize {
        self.flush(usize::MAX)
    }

    pub fn queued_messages(&self) -> usize {
        self.outbox.lock().len()
    }
}

impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, message: Message) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        if self.immediate {
            return self
                .peer_events
                .send(ChannelEvent::Message(message))
                .map_err(|_| ChannelError::Closed);
        }
        self.gauge.add(message.len());
        self.outbox.lock().push_back(message);
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.gauge.amount()
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.gauge.set_threshold(threshold);
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.own_events.send(ChannelEvent::Closed);
            let _ = self.peer_events.send(ChannelEvent::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_pair_buffers_until_flushed() {
        let ((a, mut a_events), (_b, mut b_events)) = MemoryChannel::pair();
        assert_eq!(a_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Open));

        a.set_buffered_amount_low_threshold(4);
        a.send(Message::Binary(Bytes::from_static(&[1; 8]))).unwrap();
        a.send(Message::Text("EOF".into())).unwrap();
        assert_eq!(a.buffered_amount(), 11);
        assert!(b_events.try_recv().is_err());

        assert_eq!(a.flush(1), 8);
        assert_eq!(a.buffered_amount(), 3);
        assert_eq!(a_events.try_recv().unwrap(), ChannelEvent::BufferedAmountLow);
        assert_eq!(
            b_events.try_recv().unwrap(),
            ChannelEvent::Message(Message::Binary(Bytes::from_static(&[1; 8])))
        );

        a.flush_all();
        assert_eq!(
            b_events.try_recv().unwrap(),
            ChannelEvent::Message(Message::Text("EOF".into()))
        );
        assert_eq!(a.queued_messages(), 0);
    }

    #[tokio::test]
    async fn test_close_notifies_both_ends() {
        let ((a, mut a_events), (b, mut b_events)) = MemoryChannel::loopback();
        a.close();
        a.close();
        assert!(!b.is_open());
        assert!(matches!(b.send(Message::Text("x".into())), Err(ChannelError::NotOpen)));

        assert_eq!(a_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(a_events.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Closed));
        assert!(b_events.try_recv().is_err());
    }
}
