//! Receiver Protocol
//!
//! `Idle -> Receiving -> Complete | Cancelled`
//!
//! Every incoming message is one dispatch. Metadata opens a cycle, binary
//! chunks are appended in arrival order, end of stream assembles the file
//! and a cancel discards everything received so far.

use bytes::{Bytes, BytesMut};

use super::{emit, EventSender, ProgressMeter, ReceivedFile, TransferError, TransferEvent, TransferOutcome};
use crate::channel::{Channel, ChannelEvent, ChannelEvents, Message};
use crate::config::TransferConfig;
use crate::protocol::{ControlMessage, FileMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Receiving,
    Cancelled,
    Complete,
}

impl ReceiverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiverState::Idle => "idle",
            ReceiverState::Receiving => "receiving",
            ReceiverState::Cancelled => "cancelled",
            ReceiverState::Complete => "complete",
        }
    }
}

/// Result of dispatching one message
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Started(FileMetadata),
    Chunk { received: u64 },
    Completed(ReceivedFile),
    /// End of stream arrived before any data for a non-empty file
    NothingToFinalize,
    Cancelled,
}

pub struct ReceiverSession {
    config: TransferConfig,
    state: ReceiverState,
    metadata: Option<FileMetadata>,
    received_size: u64,
    chunks: Vec<Bytes>,
    meter: Option<ProgressMeter>,
    completed: Option<ReceivedFile>,
    events: Option<EventSender>,
}

impl ReceiverSession {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            state: ReceiverState::Idle,
            metadata: None,
            received_size: 0,
            chunks: Vec::new(),
            meter: None,
            completed: None,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.metadata.as_ref()
    }

    pub fn received_size(&self) -> u64 {
        self.received_size
    }

    /// Number of chunks currently buffered
    pub fn buffered_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Take the most recently completed file
    pub fn take_file(&mut self) -> Option<ReceivedFile> {
        self.completed.take()
    }

    fn invalid(&self, operation: &'static str) -> TransferError {
        TransferError::InvalidState {
            operation,
            state: self.state.as_str(),
        }
    }

    fn reset(&mut self) {
        self.received_size = 0;
        self.chunks.clear();
        self.meter = None;
    }

    /// Dispatch one message from the channel
    pub fn handle_message(&mut self, message: Message) -> Result<Dispatch, TransferError> {
        match message {
            Message::Binary(chunk) => self.on_chunk(chunk),
            Message::Text(text) => match ControlMessage::parse(&text) {
                Some(ControlMessage::Metadata(metadata)) => self.on_metadata(metadata),
                Some(ControlMessage::EndOfStream) => self.on_end_of_stream(),
                Some(ControlMessage::Cancel) => self.on_cancel(),
                None => Err(TransferError::MalformedControlMessage(text)),
            },
        }
    }

    fn on_metadata(&mut self, metadata: FileMetadata) -> Result<Dispatch, TransferError> {
        if self.state == ReceiverState::Receiving {
            return Err(TransferError::ProtocolViolation(format!(
                "metadata for {} arrived while {} is still in progress",
                metadata.name,
                self.metadata.as_ref().map(|m| m.name.as_str()).unwrap_or("a file")
            )));
        }

        log::info!("Receiving file: {} ({} bytes)", metadata.name, metadata.size);
        self.reset();
        self.meter = Some(ProgressMeter::start(metadata.size));
        self.metadata = Some(metadata.clone());
        self.state = ReceiverState::Receiving;
        emit(&self.events, TransferEvent::Started(metadata.clone()));
        Ok(Dispatch::Started(metadata))
    }

    fn on_chunk(&mut self, chunk: Bytes) -> Result<Dispatch, TransferError> {
        if self.state != ReceiverState::Receiving {
            return Err(self.invalid("accept a chunk"));
        }
        self.received_size += chunk.len() as u64;
        self.chunks.push(chunk);

        let expected = self.metadata.as_ref().map(|m| m.size).unwrap_or(0);
        if expected > 0 {
            if let Some(meter) = self.meter.as_ref() {
                let progress = meter.sample(self.received_size);
                log::trace!(
                    "Received {} / {} bytes ({:.2} MB/s)",
                    progress.transferred,
                    progress.total,
                    progress.throughput
                );
                emit(&self.events, TransferEvent::Progress(progress));
            }
        }
        Ok(Dispatch::Chunk {
            received: self.received_size,
        })
    }

    fn on_end_of_stream(&mut self) -> Result<Dispatch, TransferError> {
        if self.state != ReceiverState::Receiving {
            return Err(self.invalid("finish"));
        }
        let Some(metadata) = self.metadata.clone() else {
            return Err(self.invalid("finish"));
        };

        if self.received_size == 0 && metadata.size > 0 {
            log::info!("Transfer of {} ended before data arrived", metadata.name);
            self.reset();
            self.state = ReceiverState::Idle;
            return Ok(Dispatch::NothingToFinalize);
        }

        if self.config.verify_size && self.received_size != metadata.size {
            let error = TransferError::SizeMismatch {
                expected: metadata.size,
                received: self.received_size,
            };
            log::error!("Discarding {}: {}", metadata.name, error);
            self.reset();
            self.state = ReceiverState::Cancelled;
            emit(
                &self.events,
                TransferEvent::Failed {
                    reason: error.to_string(),
                },
            );
            return Err(error);
        }

        let mut assembled = BytesMut::with_capacity(self.received_size as usize);
        for chunk in self.chunks.drain(..) {
            assembled.extend_from_slice(&chunk);
        }
        let file = ReceivedFile {
            metadata,
            data: assembled.freeze(),
        };

        match self.meter.as_ref() {
            Some(meter) => log::info!(
                "File received: {} ({:.2} MB/s average)",
                file.name(),
                meter.sample(self.received_size).throughput
            ),
            None => log::info!("File received: {}", file.name()),
        }

        self.reset();
        self.state = ReceiverState::Complete;
        self.completed = Some(file.clone());
        emit(&self.events, TransferEvent::Received(file.clone()));
        Ok(Dispatch::Completed(file))
    }

    fn on_cancel(&mut self) -> Result<Dispatch, TransferError> {
        if self.state != ReceiverState::Receiving {
            return Err(self.invalid("cancel"));
        }
        log::info!("Sender cancelled transfer after {} bytes", self.received_size);
        self.reset();
        self.state = ReceiverState::Cancelled;
        emit(&self.events, TransferEvent::Cancelled { by_peer: true });
        Ok(Dispatch::Cancelled)
    }

    /// Abort the current transfer locally and tell the sender
    pub fn cancel<C: Channel + ?Sized>(&mut self, channel: &C) -> bool {
        if self.state != ReceiverState::Receiving {
            return false;
        }
        if let Err(e) = channel.send(Message::Text(ControlMessage::Cancel.encode())) {
            log::debug!("Could not deliver cancel to sender: {}", e);
        }
        self.reset();
        self.state = ReceiverState::Cancelled;
        emit(&self.events, TransferEvent::Cancelled { by_peer: false });
        true
    }

    /// Consume channel events until a file completes, the sender cancels,
    /// or the channel closes.
    pub async fn run(&mut self, channel_events: &mut ChannelEvents) -> TransferOutcome {
        while let Some(event) = channel_events.recv().await {
            let message = match event {
                ChannelEvent::Message(message) => message,
                ChannelEvent::Closed => break,
                ChannelEvent::Open | ChannelEvent::BufferedAmountLow => continue,
            };

            match self.handle_message(message) {
                Ok(Dispatch::Completed(file)) => {
                    self.completed = None;
                    return TransferOutcome::Received(file);
                }
                Ok(Dispatch::Cancelled) => return TransferOutcome::Cancelled,
                Ok(_) => {}
                Err(TransferError::MalformedControlMessage(text)) => {
                    log::debug!("Ignoring unrecognized control message: {}", text);
                }
                Err(e @ TransferError::SizeMismatch { .. }) => {
                    log::warn!("{}", e);
                    return TransferOutcome::Cancelled;
                }
                Err(e) => log::warn!("Ignoring message: {}", e),
            }
        }

        if self.state == ReceiverState::Receiving {
            log::warn!(
                "Channel closed after {} bytes, before end of stream",
                self.received_size
            );
        }
        TransferOutcome::Stalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;

    fn metadata_text(name: &str, size: u64) -> Message {
        Message::Text(
            ControlMessage::Metadata(FileMetadata {
                name: name.to_string(),
                size,
                mime_type: "application/octet-stream".to_string(),
                index: None,
                total: None,
            })
            .encode(),
        )
    }

    fn chunk(bytes: &[u8]) -> Message {
        Message::Binary(Bytes::copy_from_slice(bytes))
    }

    fn eof() -> Message {
        Message::Text("EOF".to_string())
    }

    #[test]
    fn test_reassembles_in_order() {
        let mut rx = ReceiverSession::new(TransferConfig::default());
        assert!(matches!(rx.handle_message(metadata_text("a.bin", 6)), Ok(Dispatch::Started(_))));
        assert_eq!(rx.state(), ReceiverState::Receiving);

        rx.handle_message(chunk(&[1, 2, 3, 4])).unwrap();
        rx.handle_message(chunk(&[5, 6])).unwrap();
        assert_eq!(rx.received_size(), 6);
        assert_eq!(rx.buffered_chunks(), 2);

        match rx.handle_message(eof()).unwrap() {
            Dispatch::Completed(file) => {
                assert_eq!(&file.data[..], &[1, 2, 3, 4, 5, 6]);
                assert_eq!(file.mime_type(), "application/octet-stream");
            }
            other => panic!("unexpected dispatch {:?}", other),
        }
        assert_eq!(rx.state(), ReceiverState::Complete);
        assert!(rx.take_file().is_some());
        assert!(rx.take_file().is_none());
    }

    #[test]
    fn test_zero_byte_file_finalizes_empty() {
        let mut rx = ReceiverSession::new(TransferConfig::default());
        rx.handle_message(metadata_text("empty.txt", 0)).unwrap();
        match rx.handle_message(eof()).unwrap() {
            Dispatch::Completed(file) => {
                assert!(file.is_empty());
                assert_eq!(file.name(), "empty.txt");
            }
            other => panic!("unexpected dispatch {:?}", other),
        }
        assert_eq!(rx.state(), ReceiverState::Complete);
    }

    #[test]
    fn test_eof_before_data_is_noop() {
        let mut rx = ReceiverSession::new(TransferConfig::default());
        rx.handle_message(metadata_text("big.bin", 1000)).unwrap();
        assert_eq!(rx.handle_message(eof()).unwrap(), Dispatch::NothingToFinalize);
        assert_eq!(rx.state(), ReceiverState::Idle);
        assert!(rx.take_file().is_none());

        // A fresh metadata starts over
        assert!(rx.handle_message(metadata_text("big.bin", 1000)).is_ok());
    }

    #[test]
    fn test_metadata_while_receiving_is_rejected() {
        let mut rx = ReceiverSession::new(TransferConfig::default());
        rx.handle_message(metadata_text("first.bin", 4)).unwrap();
        rx.handle_message(chunk(&[1, 2])).unwrap();

        let err = rx.handle_message(metadata_text("second.bin", 10)).unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
        assert_eq!(rx.metadata().unwrap().name, "first.bin");
        assert_eq!(rx.received_size(), 2);

        rx.handle_message(chunk(&[3, 4])).unwrap();
        assert!(matches!(rx.handle_message(eof()), Ok(Dispatch::Completed(_))));
    }

    #[test]
    fn test_cancel_discards_and_reopens() {
        let mut rx = ReceiverSession::new(TransferConfig::default());
        rx.handle_message(metadata_text("a.bin", 10)).unwrap();
        rx.handle_message(chunk(&[0; 5])).unwrap();
        assert_eq!(rx.handle_message(Message::Text("CANCEL".into())).unwrap(), Dispatch::Cancelled);
        assert_eq!(rx.state(), ReceiverState::Cancelled);
        assert_eq!(rx.received_size(), 0);
        assert_eq!(rx.buffered_chunks(), 0);

        assert!(rx.handle_message(chunk(&[1])).is_err());
        rx.handle_message(metadata_text("b.bin", 1)).unwrap();
        rx.handle_message(chunk(&[1])).unwrap();
        assert!(matches!(rx.handle_message(eof()), Ok(Dispatch::Completed(_))));
    }

    #[test]
    fn test_chunk_or_eof_when_idle() {
        let mut rx = ReceiverSession::new(TransferConfig::default());
        assert!(matches!(
            rx.handle_message(chunk(&[1])),
            Err(TransferError::InvalidState { .. })
        ));
        assert!(matches!(rx.handle_message(eof()), Err(TransferError::InvalidState { .. })));
        assert!(matches!(
            rx.handle_message(Message::Text("CANCEL".into())),
            Err(TransferError::InvalidState { .. })
        ));
        assert_eq!(rx.state(), ReceiverState::Idle);
    }

    #[test]
    fn test_unrecognized_text_is_malformed() {
        let mut rx = ReceiverSession::new(TransferConfig::default());
        assert!(matches!(
            rx.handle_message(Message::Text("PING".into())),
            Err(TransferError::MalformedControlMessage(_))
        ));
        assert_eq!(rx.state(), ReceiverState::Idle);
    }

    #[test]
    fn test_size_mismatch() {
        let mut rx = ReceiverSession::new(TransferConfig::default());
        rx.handle_message(metadata_text("short.bin", 10)).unwrap();
        rx.handle_message(chunk(&[0; 4])).unwrap();
        assert_eq!(
            rx.handle_message(eof()),
            Err(TransferError::SizeMismatch { expected: 10, received: 4 })
        );
        assert_eq!(rx.state(), ReceiverState::Cancelled);

        let mut lenient = ReceiverSession::new(TransferConfig {
            verify_size: false,
            ..TransferConfig::default()
        });
        lenient.handle_message(metadata_text("short.bin", 10)).unwrap();
        lenient.handle_message(chunk(&[0; 4])).unwrap();
        assert!(matches!(lenient.handle_message(eof()), Ok(Dispatch::Completed(f)) if f.len() == 4));
    }

    #[test]
    fn test_local_cancel_notifies_sender() {
        let ((a, _a_events), (_b, mut b_events)) = MemoryChannel::loopback();
        let mut rx = ReceiverSession::new(TransferConfig::default());
        assert!(!rx.cancel(a.as_ref()));

        rx.handle_message(metadata_text("a.bin", 10)).unwrap();
        assert!(rx.cancel(a.as_ref()));
        assert_eq!(rx.state(), ReceiverState::Cancelled);

        assert_eq!(b_events.try_recv().unwrap(), ChannelEvent::Open);
        assert_eq!(
            b_events.try_recv().unwrap(),
            ChannelEvent::Message(Message::Text("CANCEL".into()))
        );
    }

    #[tokio::test]
    async fn test_run_until_complete_and_stall() {
        let ((a, _a_events), (_b, mut b_events)) = MemoryChannel::loopback();
        a.send(Message::Text("future-extension".into())).unwrap();
        a.send(metadata_text("r.bin", 3)).unwrap();
        a.send(chunk(&[7, 8, 9])).unwrap();
        a.send(eof()).unwrap();

        let mut rx = ReceiverSession::new(TransferConfig::default());
        match rx.run(&mut b_events).await {
            TransferOutcome::Received(file) => assert_eq!(&file.data[..], &[7, 8, 9]),
            other => panic!("unexpected outcome {:?}", other),
        }

        a.send(metadata_text("s.bin", 3)).unwrap();
        a.send(chunk(&[1])).unwrap();
        a.close();
        assert_eq!(rx.run(&mut b_events).await, TransferOutcome::Stalled);
        assert_eq!(rx.state(), ReceiverState::Receiving);
        assert_eq!(rx.received_size(), 1);
    }
}
