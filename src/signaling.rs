//! Signaling Client
//!
//! Client side of the rendezvous protocol. Requests and their responses
//! share one connection; an `answer-ready` push that arrives while a
//! response is awaited is kept for [`SignalingClient::wait_answer_ready`].

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, pki_types::ServerName};
use tokio_rustls::TlsConnector;

use crate::config::ClientConfig;
use crate::protocol::{read_frame, write_message, SignalingMessage};

/// Largest frame accepted from the server
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
    #[error("Invalid message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Rejected(String),
    #[error("Server error: {0}")]
    Server(String),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Connection closed by server")]
    ConnectionClosed,
}

trait SignalingStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SignalingStream for T {}

pub struct SignalingClient {
    stream: Box<dyn SignalingStream>,
    pushes: VecDeque<SignalingMessage>,
}

impl SignalingClient {
    /// Wrap an already connected stream
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            stream: Box::new(stream),
            pushes: VecDeque::new(),
        }
    }

    /// Connect to `host:port`, over TLS when `config.tls` is set
    pub async fn connect(host: &str, port: u16, config: &ClientConfig) -> Result<Self, SignalingError> {
        log::info!("Connecting to signaling server at {}:{}...", host, port);
        let stream = TcpStream::connect((host, port)).await?;
        let _ = stream.set_nodelay(true);

        if !config.tls {
            return Ok(Self::from_stream(stream));
        }

        let connector = TlsConnector::from(Arc::new(tls_config(config.insecure)));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| SignalingError::InvalidServerName(host.to_string()))?;
        let tls_stream = connector.connect(server_name, stream).await?;
        log::info!("TLS session established with {}", host);
        Ok(Self::from_stream(tls_stream))
    }

    /// Publish an offer and return the PIN of the new room
    pub async fn create_room(&mut self, offer: String) -> Result<String, SignalingError> {
        match self.request(SignalingMessage::CreateRoom { offer }).await? {
            SignalingMessage::RoomCreated {
                success: true,
                pin: Some(pin),
                ..
            } => Ok(pin),
            SignalingMessage::RoomCreated { message, .. } => Err(rejected(message)),
            other => Err(unexpected(other)),
        }
    }

    /// Join a room by PIN and return its offer
    pub async fn join_room(&mut self, pin: &str) -> Result<String, SignalingError> {
        let request = SignalingMessage::JoinRoom { pin: pin.to_string() };
        match self.request(request).await? {
            SignalingMessage::RoomJoined {
                success: true,
                offer: Some(offer),
                ..
            } => Ok(offer),
            SignalingMessage::RoomJoined { message, .. } => Err(rejected(message)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn send_answer(&mut self, pin: &str, answer: String) -> Result<(), SignalingError> {
        let request = SignalingMessage::SendAnswer {
            pin: pin.to_string(),
            answer,
        };
        match self.request(request).await? {
            SignalingMessage::AnswerSent { success: true, .. } => Ok(()),
            SignalingMessage::AnswerSent { message, .. } => Err(rejected(message)),
            other => Err(unexpected(other)),
        }
    }

    /// Wait for the answer to the room this client created
    pub async fn wait_answer_ready(&mut self, pin: &str) -> Result<String, SignalingError> {
        loop {
            let push = match self.pushes.pop_front() {
                Some(push) => push,
                None => self.receive().await?,
            };
            match push {
                SignalingMessage::AnswerReady { pin: for_pin, answer } if for_pin == pin => {
                    return Ok(answer)
                }
                SignalingMessage::AnswerReady { pin: for_pin, .. } => {
                    log::debug!("Ignoring answer for room {}", for_pin);
                }
                SignalingMessage::Error { message } => return Err(SignalingError::Server(message)),
                other => log::debug!("Ignoring unsolicited message: {:?}", other),
            }
        }
    }

    async fn request(&mut self, request: SignalingMessage) -> Result<SignalingMessage, SignalingError> {
        write_message(&mut self.stream, &request).await?;
        loop {
            match self.receive().await? {
                push @ SignalingMessage::AnswerReady { .. } => self.pushes.push_back(push),
                SignalingMessage::Error { message } => return Err(SignalingError::Server(message)),
                response => return Ok(response),
            }
        }
    }

    async fn receive(&mut self) -> Result<SignalingMessage, SignalingError> {
        let frame = read_frame(&mut self.stream, MAX_RESPONSE_SIZE)
            .await?
            .ok_or(SignalingError::ConnectionClosed)?;
        Ok(SignalingMessage::from_bytes(&frame)?)
    }
}

fn rejected(message: Option<String>) -> SignalingError {
    SignalingError::Rejected(message.unwrap_or_else(|| "Request failed".to_string()))
}

fn unexpected(message: SignalingMessage) -> SignalingError {
    SignalingError::UnexpectedResponse(format!("{:?}", message))
}

fn tls_config(insecure: bool) -> rustls::ClientConfig {
    if insecure {
        log::warn!("Certificate verification disabled");
        return rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Certificate verifier that accepts any certificate (for self-signed development servers)
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
