//! Signaling Server
//!
//! Accept loop and per-connection task. Each connection gets an id and an
//! outbox; responses and `answer-ready` pushes share that outbox so frames
//! are written by a single task in order.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use crate::protocol::{read_frame, SignalingMessage};
use crate::rendezvous::RendezvousService;
use crate::room::RoomStore;

/// Accept connections until the listener fails
pub async fn serve<S>(
    listener: TcpListener,
    service: Arc<RendezvousService<S>>,
    acceptor: Option<TlsAcceptor>,
    max_message_size: usize,
) -> io::Result<()>
where
    S: RoomStore + 'static,
{
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let acceptor = acceptor.clone();
        let service = service.clone();

        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        log::info!("New TLS connection from {}", peer_addr);
                        handle_connection(tls_stream, peer_addr, service, max_message_size).await;
                    }
                    Err(e) => log::error!("TLS handshake failed for {}: {}", peer_addr, e),
                },
                None => {
                    log::info!("New connection from {}", peer_addr);
                    handle_connection(stream, peer_addr, service, max_message_size).await;
                }
            }
        });
    }
}

/// Serve one client until it disconnects, then delete its rooms
pub async fn handle_connection<T, S>(
    stream: T,
    peer_addr: SocketAddr,
    service: Arc<RendezvousService<S>>,
    max_message_size: usize,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
    S: RoomStore + 'static,
{
    let peer_id = Uuid::new_v4().to_string();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<SignalingMessage>();
    service.register_peer(&peer_id, outbox_tx.clone());

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            let data = match message.to_framed() {
                Ok(data) => data,
                Err(e) => {
                    log::error!("Failed to encode {:?}: {}", message, e);
                    continue;
                }
            };
            if write_half.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    loop {
        let frame = match read_frame(&mut read_half, max_message_size).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                log::error!("Closing {}: {}", peer_addr, e);
                break;
            }
            Err(e) => {
                log::debug!("Read from {} failed: {}", peer_addr, e);
                break;
            }
        };

        let response = match SignalingMessage::from_bytes(&frame) {
            Ok(message) => service.handle_message(&peer_id, message),
            Err(e) => {
                log::warn!("Invalid message from {}: {}", peer_addr, e);
                SignalingMessage::Error {
                    message: "Invalid message format".to_string(),
                }
            }
        };

        if outbox_tx.send(response).is_err() {
            break;
        }
    }

    service.disconnect(&peer_id);
    drop(outbox_tx);
    let _ = writer.await;
    log::info!("Client {} disconnected", peer_addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::write_message;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    async fn next(stream: &mut tokio::io::DuplexStream) -> Option<SignalingMessage> {
        read_frame(stream, 64 * 1024)
            .await
            .unwrap()
            .map(|frame| SignalingMessage::from_bytes(&frame).unwrap())
    }

    #[tokio::test]
    async fn test_invalid_json_keeps_connection() {
        let service = Arc::new(RendezvousService::in_memory(Duration::from_secs(600)));
        let (mut client, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(server_side, addr(), service.clone(), 1024));

        client.write_all(&3u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{{{").await.unwrap();
        assert_eq!(
            next(&mut client).await,
            Some(SignalingMessage::Error {
                message: "Invalid message format".into()
            })
        );

        write_message(&mut client, &SignalingMessage::CreateRoom { offer: "o".into() })
            .await
            .unwrap();
        assert!(matches!(
            next(&mut client).await,
            Some(SignalingMessage::RoomCreated { success: true, .. })
        ));
        assert_eq!(service.store().len(), 1);

        drop(client);
        task.await.unwrap();
        assert!(service.store().is_empty());
        assert_eq!(service.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let service = Arc::new(RendezvousService::in_memory(Duration::from_secs(600)));
        let (mut client, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(server_side, addr(), service.clone(), 16));

        client.write_all(&1024u32.to_be_bytes()).await.unwrap();
        task.await.unwrap();
        assert_eq!(next(&mut client).await, None);
    }

    #[tokio::test]
    async fn test_server_message_is_unsupported() {
        let service = Arc::new(RendezvousService::in_memory(Duration::from_secs(600)));
        let (mut client, server_side) = tokio::io::duplex(4096);
        tokio::spawn(handle_connection(server_side, addr(), service, 1024));

        write_message(
            &mut client,
            &SignalingMessage::AnswerReady {
                pin: "123456".into(),
                answer: "a".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            next(&mut client).await,
            Some(SignalingMessage::Error {
                message: "Unsupported message type".into()
            })
        );
    }
}
