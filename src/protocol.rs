//! Wire Protocols
//!
//! Defines the rendezvous messages exchanged with the signaling server and
//! the control-plane messages carried over an established transfer channel.

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Literal sentinel marking the end of a file's byte stream
pub const EOF_SENTINEL: &str = "EOF";

/// Literal sentinel aborting the current transfer
pub const CANCEL_SENTINEL: &str = "CANCEL";

/// Messages exchanged between clients and the rendezvous server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    // Client -> Server
    CreateRoom {
        offer: String,
    },
    JoinRoom {
        pin: String,
    },
    SendAnswer {
        pin: String,
        answer: String,
    },

    // Server -> Client
    RoomCreated {
        success: bool,
        pin: Option<String>,
        message: Option<String>,
    },
    RoomJoined {
        success: bool,
        offer: Option<String>,
        message: Option<String>,
    },
    AnswerSent {
        success: bool,
        message: Option<String>,
    },
    /// Pushed to the offering party only
    AnswerReady {
        pin: String,
        answer: String,
    },

    Error {
        message: String,
    },
}

impl SignalingMessage {
    /// Serialize the message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Create a framed message with length prefix (4 bytes, big-endian)
    pub fn to_framed(&self) -> Result<Vec<u8>, serde_json::Error> {
        let data = self.to_bytes()?;
        let len = (data.len() as u32).to_be_bytes();
        let mut framed = Vec::with_capacity(4 + data.len());
        framed.extend_from_slice(&len);
        framed.extend_from_slice(&data);
        Ok(framed)
    }
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream before the length prefix.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, max_len),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write a signaling message as one length-prefixed frame
pub async fn write_message<W>(writer: &mut W, message: &SignalingMessage) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let data = message
        .to_framed()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&data).await?;
    writer.flush().await
}

/// File description announced before any chunk is sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// Position within a multi-file batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TaggedControl {
    Metadata(FileMetadata),
}

/// Text-typed messages on the transfer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Metadata(FileMetadata),
    EndOfStream,
    Cancel,
}

impl ControlMessage {
    pub fn encode(&self) -> String {
        match self {
            ControlMessage::Metadata(metadata) => {
                // Serializing a plain struct of strings and integers cannot fail
                serde_json::to_string(&TaggedControl::Metadata(metadata.clone()))
                    .unwrap_or_default()
            }
            ControlMessage::EndOfStream => EOF_SENTINEL.to_string(),
            ControlMessage::Cancel => CANCEL_SENTINEL.to_string(),
        }
    }

    /// Parse a text message. Unrecognized text yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            EOF_SENTINEL => Some(ControlMessage::EndOfStream),
            CANCEL_SENTINEL => Some(ControlMessage::Cancel),
            _ => match serde_json::from_str::<TaggedControl>(text) {
                Ok(TaggedControl::Metadata(metadata)) => Some(ControlMessage::Metadata(metadata)),
                Err(_) => None,
            },
        }
    }
}
