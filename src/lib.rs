//! PinShare - PIN Rendezvous and Direct File Transfer Library
//!
//! This library provides the rendezvous service that pairs two peers by a
//! one-time PIN, and the chunked transfer protocol that moves a file between
//! them once a direct channel is open.

pub mod channel;
pub mod config;
pub mod negotiation;
pub mod protocol;
pub mod rendezvous;
pub mod room;
pub mod server;
pub mod signaling;
pub mod transfer;

pub use channel::{Channel, ChannelEvent, Message};
pub use config::{ClientConfig, ServerConfig, TransferConfig};
pub use protocol::{ControlMessage, FileMetadata, SignalingMessage};
pub use rendezvous::RendezvousService;
pub use room::{MemoryRoomStore, Room, RoomError, RoomStore};
pub use signaling::SignalingClient;
pub use transfer::{TransferError, TransferEvent, TransferOutcome};
