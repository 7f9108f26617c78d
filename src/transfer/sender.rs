//! Sender Protocol
//!
//! `Idle -> Sending <-> Paused -> Complete | Cancelled`
//!
//! The session announces the file, then loops: at the top of every
//! iteration it checks for cancel/pause and for backpressure, reads one
//! chunk at the current offset, hands it to the channel and advances. When
//! the channel holds more than the high-water mark the loop suspends until
//! the channel reports it has drained below the low-water mark.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{emit, EventSender, FileBlob, ProgressMeter, TransferError, TransferEvent, TransferOutcome};
use crate::channel::{Channel, ChannelEvent, ChannelEvents, Message};
use crate::config::TransferConfig;
use crate::protocol::ControlMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Sending,
    Paused,
    Cancelled,
    Complete,
}

impl SenderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderState::Idle => "idle",
            SenderState::Sending => "sending",
            SenderState::Paused => "paused",
            SenderState::Cancelled => "cancelled",
            SenderState::Complete => "complete",
        }
    }
}

/// What the send loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Read { offset: u64, len: usize },
    /// Wait for the channel to drain below the low-water mark
    Backpressure,
    /// Every byte is submitted; send end of stream
    Finished,
    /// Not sending (paused, cancelled, complete or idle)
    Stopped,
}

pub struct SenderSession<C: Channel + ?Sized> {
    channel: Arc<C>,
    config: TransferConfig,
    state: SenderState,
    file: Option<FileBlob>,
    offset: u64,
    meter: Option<ProgressMeter>,
    events: Option<EventSender>,
}

impl<C: Channel + ?Sized> SenderSession<C> {
    pub fn new(channel: Arc<C>, config: TransferConfig) -> Self {
        Self {
            channel,
            config,
            state: SenderState::Idle,
            file: None,
            offset: 0,
            meter: None,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn file(&self) -> Option<&FileBlob> {
        self.file.as_ref()
    }

    fn invalid(&self, operation: &'static str) -> TransferError {
        TransferError::InvalidState {
            operation,
            state: self.state.as_str(),
        }
    }

    /// Announce `file` and enter `Sending`
    pub fn start(&mut self, file: Option<FileBlob>) -> Result<(), TransferError> {
        if self.state != SenderState::Idle {
            return Err(self.invalid("start"));
        }
        if !self.channel.is_open() {
            return Err(TransferError::ChannelNotReady);
        }
        let file = file.ok_or(TransferError::NoFileSelected)?;
        self.config
            .validate()
            .map_err(|e| TransferError::InvalidConfig(e.to_string()))?;

        self.channel
            .set_buffered_amount_low_threshold(self.config.low_water_mark);

        let metadata = file.metadata();
        self.channel
            .send(Message::Text(ControlMessage::Metadata(metadata.clone()).encode()))
            .map_err(|e| TransferError::SendFailure(e.to_string()))?;

        log::info!("Starting file transfer: {} ({} bytes)", file.name(), file.size());
        self.offset = 0;
        self.meter = Some(ProgressMeter::start(file.size()));
        self.file = Some(file);
        self.state = SenderState::Sending;
        emit(&self.events, TransferEvent::Started(metadata));
        Ok(())
    }

    /// Top of the send loop
    pub fn next_step(&self) -> Step {
        let Some(file) = self.file.as_ref() else {
            return Step::Stopped;
        };
        if self.state != SenderState::Sending {
            return Step::Stopped;
        }
        if self.offset >= file.size() {
            return Step::Finished;
        }
        if self.channel.buffered_amount() > self.config.high_water_mark {
            return Step::Backpressure;
        }
        let remaining = file.size() - self.offset;
        Step::Read {
            offset: self.offset,
            len: (self.config.chunk_size as u64).min(remaining) as usize,
        }
    }

    /// Submit a chunk that was read at the current offset
    pub fn on_chunk(&mut self, chunk: Bytes) -> Result<(), TransferError> {
        if !matches!(self.state, SenderState::Sending | SenderState::Paused) {
            return Err(self.invalid("send a chunk"));
        }
        let size = self.file.as_ref().map(|f| f.size()).unwrap_or(0);
        let len = chunk.len() as u64;
        if len == 0 {
            return Err(TransferError::ReadFailure(format!(
                "unexpected end of file at offset {} of {}",
                self.offset, size
            )));
        }
        if self.offset + len > size {
            return Err(TransferError::ReadFailure(format!(
                "file grew past its announced size of {} bytes",
                size
            )));
        }

        self.channel
            .send(Message::Binary(chunk))
            .map_err(|e| TransferError::SendFailure(e.to_string()))?;
        self.offset += len;

        if let Some(meter) = self.meter.as_ref() {
            let progress = meter.sample(self.offset);
            log::trace!(
                "Sent {} / {} bytes ({:.2} MB/s)",
                progress.transferred,
                progress.total,
                progress.throughput
            );
            emit(&self.events, TransferEvent::Progress(progress));
        }
        Ok(())
    }

    /// Send end of stream and enter `Complete`
    pub fn finish(&mut self) -> Result<(), TransferError> {
        if self.next_step() != Step::Finished {
            return Err(self.invalid("finish"));
        }
        self.channel
            .send(Message::Text(ControlMessage::EndOfStream.encode()))
            .map_err(|e| TransferError::SendFailure(e.to_string()))?;

        self.state = SenderState::Complete;
        let (name, size) = self
            .file
            .as_ref()
            .map(|f| (f.name().to_string(), f.size()))
            .unwrap_or_default();
        match self.meter.as_ref() {
            Some(meter) => log::info!(
                "File sent successfully: {} ({:.2} MB/s average)",
                name,
                meter.sample(size).throughput
            ),
            None => log::info!("File sent successfully: {}", name),
        }
        emit(&self.events, TransferEvent::Sent { name, size });
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), TransferError> {
        if self.state != SenderState::Sending {
            return Err(self.invalid("pause"));
        }
        self.state = SenderState::Paused;
        log::info!("Transfer paused at offset {}", self.offset);
        emit(&self.events, TransferEvent::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), TransferError> {
        if self.state != SenderState::Paused {
            return Err(self.invalid("resume"));
        }
        self.state = SenderState::Sending;
        log::info!("Transfer resumed at offset {}", self.offset);
        emit(&self.events, TransferEvent::Resumed);
        Ok(())
    }

    /// Abort locally and tell the peer. Returns whether the state changed.
    pub fn cancel(&mut self) -> bool {
        if !matches!(self.state, SenderState::Sending | SenderState::Paused) {
            return false;
        }
        if let Err(e) = self
            .channel
            .send(Message::Text(ControlMessage::Cancel.encode()))
        {
            log::debug!("Could not deliver cancel to peer: {}", e);
        }
        self.state = SenderState::Cancelled;
        log::info!("Transfer cancelled at offset {}", self.offset);
        emit(&self.events, TransferEvent::Cancelled { by_peer: false });
        true
    }

    /// The peer cancelled; abort without echoing a cancel back
    pub fn on_remote_cancel(&mut self) -> bool {
        if !matches!(self.state, SenderState::Sending | SenderState::Paused) {
            return false;
        }
        self.state = SenderState::Cancelled;
        log::info!("Receiver cancelled the transfer at offset {}", self.offset);
        emit(&self.events, TransferEvent::Cancelled { by_peer: true });
        true
    }

    /// Abort after a read or send failure
    pub fn fail(&mut self, error: &TransferError) {
        log::error!("Transfer aborted: {}", error);
        if matches!(self.state, SenderState::Sending | SenderState::Paused) {
            let _ = self
                .channel
                .send(Message::Text(ControlMessage::Cancel.encode()));
        }
        self.state = SenderState::Cancelled;
        emit(
            &self.events,
            TransferEvent::Failed {
                reason: error.to_string(),
            },
        );
    }

    fn apply(&mut self, command: SenderCommand) {
        let result = match command {
            SenderCommand::Pause => self.pause(),
            SenderCommand::Resume => self.resume(),
            SenderCommand::Cancel => {
                self.cancel();
                Ok(())
            }
        };
        if let Err(e) = result {
            log::warn!("Ignoring command: {}", e);
        }
    }

    /// Drive a started session until it completes or is cancelled.
    ///
    /// Commands from a [`SenderHandle`] and channel events are observed
    /// between iterations. A pause lets an in-flight read finish and be sent;
    /// a cancel drops it.
    pub async fn run(
        &mut self,
        mut channel_events: ChannelEvents,
        mut commands: mpsc::UnboundedReceiver<SenderCommand>,
    ) -> Result<TransferOutcome, TransferError> {
        if self.state == SenderState::Idle {
            return Err(self.invalid("run"));
        }

        type ChunkRead = Pin<Box<dyn Future<Output = Result<Bytes, TransferError>> + Send>>;
        let mut in_flight: Option<ChunkRead> = None;
        let mut draining = false;

        loop {
            if in_flight.is_none() && !draining {
                match self.next_step() {
                    Step::Read { offset, len } => {
                        if let Some(file) = self.file.as_ref() {
                            in_flight = Some(Box::pin(file.read_chunk(offset, len)));
                        }
                    }
                    Step::Backpressure => {
                        log::debug!(
                            "Backpressure: {} bytes buffered, waiting for drain",
                            self.channel.buffered_amount()
                        );
                        draining = true;
                    }
                    Step::Finished => {
                        if let Err(e) = self.finish() {
                            self.fail(&e);
                            return Err(e);
                        }
                    }
                    Step::Stopped => {}
                }
            }

            match self.state {
                SenderState::Complete => return Ok(TransferOutcome::Sent),
                SenderState::Cancelled => return Ok(TransferOutcome::Cancelled),
                _ => {}
            }

            tokio::select! {
                Some(command) = commands.recv() => {
                    if command == SenderCommand::Cancel {
                        in_flight = None;
                    }
                    let was_paused = self.state == SenderState::Paused;
                    self.apply(command);
                    if was_paused && self.state == SenderState::Sending {
                        // Re-run the loop now: the buffer may already be
                        // below the low-water mark, so no drain signal will come
                        draining = false;
                    }
                }
                event = channel_events.recv() => match event {
                    Some(ChannelEvent::BufferedAmountLow) => {
                        draining = false;
                    }
                    Some(ChannelEvent::Message(Message::Text(text))) => {
                        match ControlMessage::parse(&text) {
                            Some(ControlMessage::Cancel) => {
                                in_flight = None;
                                self.on_remote_cancel();
                            }
                            _ => log::debug!("Ignoring text message from receiver: {}", text),
                        }
                    }
                    Some(ChannelEvent::Message(Message::Binary(_))) | Some(ChannelEvent::Open) => {}
                    Some(ChannelEvent::Closed) | None => {
                        let error = TransferError::SendFailure("channel closed".to_string());
                        self.fail(&error);
                        return Err(error);
                    }
                },
                result = async {
                    match in_flight.as_mut() {
                        Some(read) => read.await,
                        None => std::future::pending().await,
                    }
                }, if in_flight.is_some() => {
                    in_flight = None;
                    if let Err(e) = result.and_then(|chunk| self.on_chunk(chunk)) {
                        self.fail(&e);
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Commands accepted by a running sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderCommand {
    Pause,
    Resume,
    Cancel,
}

/// Cloneable control surface for a running sender
#[derive(Debug, Clone)]
pub struct SenderHandle {
    commands: mpsc::UnboundedSender<SenderCommand>,
}

impl SenderHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SenderCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { commands: tx }, rx)
    }

    pub fn pause(&self) -> bool {
        self.commands.send(SenderCommand::Pause).is_ok()
    }

    pub fn resume(&self) -> bool {
        self.commands.send(SenderCommand::Resume).is_ok()
    }

    pub fn cancel(&self) -> bool {
        self.commands.send(SenderCommand::Cancel).is_ok()
    }
}
