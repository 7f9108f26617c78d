//! Channel over a byte stream (TCP in practice).
//!
//! Each message is one frame: a 4-byte big-endian length covering a kind
//! byte plus the payload. A writer task drains the send queue and releases
//! the buffered amount as bytes reach the socket.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BufferGauge, Channel, ChannelError, ChannelEvent, ChannelEvents, Message};
use crate::protocol::read_frame;

const KIND_TEXT: u8 = 0;
const KIND_BINARY: u8 = 1;

/// Upper bound for a single incoming frame
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub struct StreamChannel {
    open: Arc<AtomicBool>,
    gauge: Arc<BufferGauge>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamChannel {
    /// Take ownership of an established stream and start its I/O tasks
    pub fn spawn<S>(stream: S) -> (Arc<Self>, ChannelEvents)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (read_half, write_half) = tokio::io::split(stream);

        let open = Arc::new(AtomicBool::new(true));
        let gauge = Arc::new(BufferGauge::new(events_tx.clone()));

        let writer = tokio::spawn(write_loop(write_half, out_rx, gauge.clone()));
        let reader = tokio::spawn(read_loop(read_half, events_tx.clone(), open.clone()));

        let _ = events_tx.send(ChannelEvent::Open);

        let channel = Arc::new(Self {
            open,
            gauge,
            outgoing: Mutex::new(Some(out_tx)),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        });
        (channel, events_rx)
    }

    /// Stop accepting messages, wait until everything queued has been
    /// written, then shut the write side down.
    pub async fn shutdown(&self) {
        self.outgoing.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

impl Channel for StreamChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.outgoing.lock().is_some()
    }

    fn send(&self, message: Message) -> Result<(), ChannelError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let outgoing = self.outgoing.lock();
        let sender = outgoing.as_ref().ok_or(ChannelError::NotOpen)?;
        let len = message.len();
        self.gauge.add(len);
        if sender.send(message).is_err() {
            self.gauge.release(len);
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.gauge.amount()
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.gauge.set_threshold(threshold);
    }

    fn close(&self) {
        // The writer drains what is queued, then shuts the write side down
        self.outgoing.lock().take();
        self.open.store(false, Ordering::Release);
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

fn encode_frame(message: &Message) -> Vec<u8> {
    let (kind, payload): (u8, &[u8]) = match message {
        Message::Text(text) => (KIND_TEXT, text.as_bytes()),
        Message::Binary(data) => (KIND_BINARY, data.as_ref()),
    };
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&((payload.len() + 1) as u32).to_be_bytes());
    frame.push(kind);
    frame.extend_from_slice(payload);
    frame
}

fn decode_frame(mut frame: Vec<u8>) -> Option<Message> {
    if frame.is_empty() {
        return None;
    }
    let payload = frame.split_off(1);
    match frame[0] {
        KIND_TEXT => match String::from_utf8(payload) {
            Ok(text) => Some(Message::Text(text)),
            Err(_) => {
                log::warn!("Dropping text frame that is not valid UTF-8");
                None
            }
        },
        KIND_BINARY => Some(Message::Binary(Bytes::from(payload))),
        other => {
            log::warn!("Dropping frame of unknown kind {}", other);
            None
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    gauge: Arc<BufferGauge>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        let len = message.len();
        let frame = encode_frame(&message);
        if let Err(e) = writer.write_all(&frame).await {
            log::error!("Channel write failed: {}", e);
            gauge.release(len);
            break;
        }
        gauge.release(len);
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(
    mut reader: R,
    events: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader, MAX_FRAME_SIZE + 1).await {
            Ok(Some(frame)) => {
                if let Some(message) = decode_frame(frame) {
                    if events.send(ChannelEvent::Message(message)).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("Channel read failed: {}", e);
                break;
            }
        }
    }
    open.store(false, Ordering::Release);
    let _ = events.send(ChannelEvent::Closed);
}
