//! Connection Negotiation
//!
//! Produces the opaque offer/answer blobs relayed by the rendezvous service
//! and turns them into an open [`StreamChannel`]. The offerer listens on a
//! TCP port and advertises the addresses it could gather; the joiner echoes
//! the session token in its answer and dials the offered candidates.

use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use uuid::Uuid;

use crate::channel::{ChannelEvents, StreamChannel};
use crate::protocol::read_frame;

/// Time allowed for a single candidate dial or handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the offerer waits for the joiner after the answer arrives
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_TOKEN_FRAME: usize = 256;

/// Negotiation errors
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed session description: {0}")]
    Malformed(String),
    #[error("Expected an {expected} but got an {actual}")]
    UnexpectedKind {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Answer belongs to a different session")]
    TokenMismatch,
    #[error("None of the offered addresses were reachable")]
    NoReachableCandidate,
    #[error("Timed out waiting for the peer")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl DescriptionKind {
    fn as_str(&self) -> &'static str {
        match self {
            DescriptionKind::Offer => "offer",
            DescriptionKind::Answer => "answer",
        }
    }
}

/// The blob carried in `create-room` and `send-answer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub token: String,
    #[serde(default)]
    pub candidates: Vec<SocketAddr>,
}

impl SessionDescription {
    pub fn encode(&self) -> String {
        // Only strings and socket addresses; serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(blob: &str, expected: DescriptionKind) -> Result<Self, NegotiationError> {
        let description: Self =
            serde_json::from_str(blob).map_err(|e| NegotiationError::Malformed(e.to_string()))?;
        if description.kind != expected {
            return Err(NegotiationError::UnexpectedKind {
                expected: expected.as_str(),
                actual: description.kind.as_str(),
            });
        }
        Ok(description)
    }
}

/// Offering side: owns the listener until the joiner connects
pub struct Offerer {
    listener: TcpListener,
    token: String,
}

impl Offerer {
    /// Bind a listener and gather candidate addresses.
    ///
    /// Gathering is bounded by `gather_timeout`; whatever was found by then
    /// is published, falling back to loopback.
    pub async fn prepare(
        advertise_host: Option<&str>,
        gather_timeout: Duration,
    ) -> Result<(Self, String), NegotiationError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let port = listener.local_addr()?.port();

        let candidates = match tokio::time::timeout(gather_timeout, gather(advertise_host, port)).await {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)],
            Err(_) => {
                log::warn!("Address gathering timed out, offering loopback only");
                vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)]
            }
        };
        log::debug!("Offering candidates {:?}", candidates);

        let offer = SessionDescription {
            kind: DescriptionKind::Offer,
            token: Uuid::new_v4().to_string(),
            candidates,
        };
        let blob = offer.encode();
        Ok((
            Self {
                listener,
                token: offer.token,
            },
            blob,
        ))
    }

    /// Validate the answer and wait for the joiner to connect with it
    pub async fn accept(self, answer: &str) -> Result<(Arc<StreamChannel>, ChannelEvents), NegotiationError> {
        let answer = SessionDescription::decode(answer, DescriptionKind::Answer)?;
        if answer.token != self.token {
            return Err(NegotiationError::TokenMismatch);
        }

        let accepted = tokio::time::timeout(ACCEPT_TIMEOUT, self.accept_peer())
            .await
            .map_err(|_| NegotiationError::Timeout)??;

        let _ = accepted.set_nodelay(true);
        Ok(StreamChannel::spawn(accepted))
    }

    async fn accept_peer(&self) -> Result<TcpStream, NegotiationError> {
        loop {
            let (mut stream, peer_addr) = self.listener.accept().await?;
            match tokio::time::timeout(CONNECT_TIMEOUT, read_token(&mut stream)).await {
                Ok(Ok(token)) if token == self.token => {
                    write_token(&mut stream, &self.token).await?;
                    log::info!("Peer connected from {}", peer_addr);
                    return Ok(stream);
                }
                Ok(Ok(_)) => log::warn!("Rejected connection from {}: wrong session", peer_addr),
                Ok(Err(e)) => log::warn!("Handshake with {} failed: {}", peer_addr, e),
                Err(_) => log::warn!("Handshake with {} timed out", peer_addr),
            }
        }
    }
}

/// Joining side: built from the offer it received
pub struct Joiner {
    offer: SessionDescription,
}

impl Joiner {
    /// Parse the offer and produce the answer blob
    pub fn answer(offer: &str) -> Result<(Self, String), NegotiationError> {
        let offer = SessionDescription::decode(offer, DescriptionKind::Offer)?;
        let answer = SessionDescription {
            kind: DescriptionKind::Answer,
            token: offer.token.clone(),
            candidates: Vec::new(),
        };
        Ok((Self { offer }, answer.encode()))
    }

    /// Dial the offered candidates in order until one completes the handshake
    pub async fn connect(self) -> Result<(Arc<StreamChannel>, ChannelEvents), NegotiationError> {
        for candidate in &self.offer.candidates {
            match tokio::time::timeout(CONNECT_TIMEOUT, self.dial(*candidate)).await {
                Ok(Ok(stream)) => {
                    log::info!("Connected to peer at {}", candidate);
                    return Ok(StreamChannel::spawn(stream));
                }
                Ok(Err(e)) => log::debug!("Candidate {} failed: {}", candidate, e),
                Err(_) => log::debug!("Candidate {} timed out", candidate),
            }
        }
        Err(NegotiationError::NoReachableCandidate)
    }

    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream, NegotiationError> {
        let mut stream = TcpStream::connect(addr).await?;
        write_token(&mut stream, &self.offer.token).await?;
        if read_token(&mut stream).await? != self.offer.token {
            return Err(NegotiationError::TokenMismatch);
        }
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

async fn gather(advertise_host: Option<&str>, port: u16) -> Vec<SocketAddr> {
    let mut candidates = Vec::new();

    if let Some(host) = advertise_host {
        match tokio::net::lookup_host((host, port)).await {
            Ok(addrs) => candidates.extend(addrs),
            Err(e) => log::warn!("Could not resolve advertised host {}: {}", host, e),
        }
        return candidates;
    }

    // Routing lookup only; no packet is sent
    if let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        if socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).await.is_ok() {
            if let Ok(local) = socket.local_addr() {
                if !local.ip().is_unspecified() && !local.ip().is_loopback() {
                    candidates.push(SocketAddr::new(local.ip(), port));
                }
            }
        }
    }
    candidates.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    candidates
}

async fn write_token(stream: &mut TcpStream, token: &str) -> io::Result<()> {
    let mut frame = Vec::with_capacity(4 + token.len());
    frame.extend_from_slice(&(token.len() as u32).to_be_bytes());
    frame.extend_from_slice(token.as_bytes());
    stream.write_all(&frame).await?;
    stream.flush().await
}

async fn read_token<R: AsyncReadExt + Unpin>(stream: &mut R) -> Result<String, NegotiationError> {
    let frame = read_frame(stream, MAX_TOKEN_FRAME)
        .await?
        .ok_or_else(|| NegotiationError::Io(io::ErrorKind::UnexpectedEof.into()))?;
    String::from_utf8(frame).map_err(|e| NegotiationError::Malformed(e.to_string()))
}
