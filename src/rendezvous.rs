//! Rendezvous Service
//!
//! Matches an offering peer with a joining peer by PIN and relays the
//! negotiation blobs between them exactly once.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::SignalingMessage;
use crate::room::{self, MemoryRoomStore, RoomError, RoomState, RoomStore};

/// Outbound queue of a connected peer
pub type PeerSender = mpsc::UnboundedSender<SignalingMessage>;

/// Owns the room store and the registry of live peer connections
pub struct RendezvousService<S: RoomStore = MemoryRoomStore> {
    store: S,
    ttl: Duration,
    peers: RwLock<HashMap<String, PeerSender>>,
}

impl RendezvousService<MemoryRoomStore> {
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(MemoryRoomStore::new(), ttl)
    }
}

impl<S: RoomStore> RendezvousService<S> {
    pub fn new(store: S, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a peer's live connection so pushes can reach it
    pub fn register_peer(&self, peer_id: &str, sender: PeerSender) {
        self.peers.write().insert(peer_id.to_string(), sender);
        log::debug!("Peer {} registered", peer_id);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Forget a peer and delete every room it takes part in
    pub fn disconnect(&self, peer_id: &str) -> Vec<String> {
        self.peers.write().remove(peer_id);
        let pins = self.store.remove_by_party(peer_id);
        for pin in &pins {
            log::info!("Cleaned up room {} after {} disconnected", pin, peer_id);
        }
        pins
    }

    /// Create a room holding `offer` and return its PIN
    pub fn create_room(&self, offer: String, offerer_id: &str) -> Result<String, RoomError> {
        let pin = room::insert_with_fresh_pin(&self.store, offer, offerer_id)?;
        log::info!("Room created: {} (offerer {})", pin, offerer_id);
        Ok(pin)
    }

    /// Claim the joiner slot of a room and return its offer
    pub fn join_room(&self, pin: &str, joiner_id: &str) -> Result<String, RoomError> {
        if !room::is_valid_pin(pin) {
            return Err(RoomError::RoomNotFound);
        }
        self.expire_if_stale(pin, Instant::now());

        let offer = self.store.join(pin, joiner_id)?;
        log::info!("Peer {} joined room {}", joiner_id, pin);
        Ok(offer)
    }

    /// Store the answer and push it to the offering peer
    pub fn submit_answer(&self, pin: &str, answer: String) -> Result<(), RoomError> {
        self.expire_if_stale(pin, Instant::now());

        let offerer_id = self.store.attach_answer(pin, answer.clone())?;
        let push = SignalingMessage::AnswerReady {
            pin: pin.to_string(),
            answer,
        };

        let delivered = match self.peers.read().get(&offerer_id) {
            Some(sender) => sender.send(push).is_ok(),
            None => false,
        };

        if delivered {
            self.store.set_state(pin, RoomState::Consumed);
            log::info!("Answer delivered for room {}", pin);
        } else {
            log::warn!("Offerer {} of room {} is not connected", offerer_id, pin);
        }
        Ok(())
    }

    /// Delete every room older than the TTL
    pub fn sweep(&self, now: Instant) -> usize {
        let pins = self.store.remove_expired(now, self.ttl);
        for pin in &pins {
            log::info!("Cleaned up expired room: {}", pin);
        }
        pins.len()
    }

    /// Drop all rooms and peer registrations
    pub fn shutdown(&self) {
        self.store.clear();
        self.peers.write().clear();
    }

    fn expire_if_stale(&self, pin: &str, now: Instant) {
        if self.store.remove_if_expired(pin, now, self.ttl) {
            log::info!("Cleaned up expired room: {}", pin);
        }
    }

    /// Answer one request from `peer_id`
    pub fn handle_message(&self, peer_id: &str, message: SignalingMessage) -> SignalingMessage {
        match message {
            SignalingMessage::CreateRoom { offer } => match self.create_room(offer, peer_id) {
                Ok(pin) => SignalingMessage::RoomCreated {
                    success: true,
                    pin: Some(pin),
                    message: None,
                },
                Err(e) => SignalingMessage::RoomCreated {
                    success: false,
                    pin: None,
                    message: Some(e.to_string()),
                },
            },

            SignalingMessage::JoinRoom { pin } => match self.join_room(&pin, peer_id) {
                Ok(offer) => SignalingMessage::RoomJoined {
                    success: true,
                    offer: Some(offer),
                    message: None,
                },
                Err(e) => {
                    let message = match e {
                        RoomError::RoomNotFound => "Invalid PIN".to_string(),
                        other => other.to_string(),
                    };
                    SignalingMessage::RoomJoined {
                        success: false,
                        offer: None,
                        message: Some(message),
                    }
                }
            },

            SignalingMessage::SendAnswer { pin, answer } => {
                match self.submit_answer(&pin, answer) {
                    Ok(()) => SignalingMessage::AnswerSent {
                        success: true,
                        message: None,
                    },
                    Err(e) => SignalingMessage::AnswerSent {
                        success: false,
                        message: Some(e.to_string()),
                    },
                }
            }

            _ => SignalingMessage::Error {
                message: "Unsupported message type".to_string(),
            },
        }
    }
}

/// Periodically evict expired rooms until the returned task is aborted
pub fn spawn_sweeper<S>(service: Arc<RendezvousService<S>>, every: Duration) -> JoinHandle<()>
where
    S: RoomStore + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = service.sweep(Instant::now());
            if removed > 0 {
                log::debug!("Sweep removed {} rooms, {} remain", removed, service.store().len());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(600);

    fn service() -> RendezvousService {
        RendezvousService::in_memory(TTL)
    }

    #[test]
    fn test_create_then_join_once() {
        let svc = service();
        let pin = svc.create_room("offer-blob".into(), "alice").unwrap();
        assert!(room::is_valid_pin(&pin));

        assert_eq!(svc.join_room(&pin, "bob").unwrap(), "offer-blob");
        assert_eq!(svc.join_room(&pin, "carol"), Err(RoomError::RoomFull));
    }

    #[test]
    fn test_join_unknown_pin() {
        let svc = service();
        assert_eq!(svc.join_room("123456", "bob"), Err(RoomError::RoomNotFound));
        assert_eq!(svc.join_room("12ab56", "bob"), Err(RoomError::RoomNotFound));
    }

    #[test]
    fn test_answer_pushed_to_offerer_only() {
        let svc = service();
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        svc.register_peer("alice", alice_tx);
        svc.register_peer("bob", bob_tx);

        let pin = svc.create_room("offer".into(), "alice").unwrap();
        svc.join_room(&pin, "bob").unwrap();
        svc.submit_answer(&pin, "answer".into()).unwrap();

        assert_eq!(
            alice_rx.try_recv().unwrap(),
            SignalingMessage::AnswerReady {
                pin: pin.clone(),
                answer: "answer".into()
            }
        );
        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(svc.store().get(&pin).unwrap().state, RoomState::Consumed);

        assert_eq!(
            svc.submit_answer(&pin, "answer".into()),
            Err(RoomError::AnswerAlreadySubmitted)
        );
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_answer_unknown_room() {
        let svc = service();
        assert_eq!(
            svc.submit_answer("999999", "answer".into()),
            Err(RoomError::RoomNotFound)
        );
    }

    #[test]
    fn test_disconnect_removes_rooms_of_either_party() {
        let svc = service();
        let (tx, _rx) = mpsc::unbounded_channel();
        svc.register_peer("bob", tx);

        let joined = svc.create_room("o".into(), "alice").unwrap();
        svc.join_room(&joined, "bob").unwrap();
        let other = svc.create_room("o".into(), "dave").unwrap();

        assert_eq!(svc.disconnect("bob"), vec![joined.clone()]);
        assert_eq!(svc.peer_count(), 0);
        assert_eq!(svc.join_room(&joined, "erin"), Err(RoomError::RoomNotFound));
        assert!(svc.store().get(&other).is_some());
    }

    #[test]
    fn test_handle_message_wire_errors() {
        let svc = service();
        match svc.handle_message("bob", SignalingMessage::JoinRoom { pin: "123456".into() }) {
            SignalingMessage::RoomJoined { success, message, .. } => {
                assert!(!success);
                assert_eq!(message.as_deref(), Some("Invalid PIN"));
            }
            other => panic!("unexpected response {:?}", other),
        }

        let pin = match svc.handle_message("alice", SignalingMessage::CreateRoom { offer: "o".into() }) {
            SignalingMessage::RoomCreated { success: true, pin: Some(pin), .. } => pin,
            other => panic!("unexpected response {:?}", other),
        };
        svc.handle_message("bob", SignalingMessage::JoinRoom { pin: pin.clone() });
        match svc.handle_message("carol", SignalingMessage::JoinRoom { pin }) {
            SignalingMessage::RoomJoined { success, message, .. } => {
                assert!(!success);
                assert_eq!(message.as_deref(), Some("Room full"));
            }
            other => panic!("unexpected response {:?}", other),
        }

        match svc.handle_message(
            "bob",
            SignalingMessage::SendAnswer { pin: "111111".into(), answer: "a".into() },
        ) {
            SignalingMessage::AnswerSent { success, message } => {
                assert!(!success);
                assert_eq!(message.as_deref(), Some("Room not found"));
            }
            other => panic!("unexpected response {:?}", other),
        }

        assert!(matches!(
            svc.handle_message("bob", SignalingMessage::Error { message: "x".into() }),
            SignalingMessage::Error { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_sweep() {
        let svc = Arc::new(service());
        let sweeper = spawn_sweeper(svc.clone(), Duration::from_secs(60));

        let pin = svc.create_room("o".into(), "alice").unwrap();
        tokio::time::advance(Duration::from_secs(599)).await;
        assert!(svc.store().get(&pin).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(svc.join_room(&pin, "bob"), Err(RoomError::RoomNotFound));

        // The periodic sweep alone also clears it once it runs
        let other = svc.create_room("o".into(), "carol").unwrap();
        tokio::time::advance(Duration::from_secs(661)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(svc.store().get(&other).is_none());
        assert!(svc.store().is_empty());

        sweeper.abort();
    }

    #[test]
    fn test_concurrent_join_through_service() {
        let svc = Arc::new(service());
        let pin = svc.create_room("offer".into(), "alice").unwrap();
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let handles: Vec<_> = ["bob", "carol"]
            .into_iter()
            .map(|who| {
                let svc = svc.clone();
                let pin = pin.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    svc.join_room(&pin, who)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.as_deref() == Ok("offer")).count(), 1);
        assert_eq!(results.iter().filter(|r| **r == Err(RoomError::RoomFull)).count(), 1);
    }

    #[test]
    fn test_shutdown_drops_everything() {
        let svc = service();
        let (tx, _rx) = mpsc::unbounded_channel();
        svc.register_peer("alice", tx);
        svc.create_room("o".into(), "alice").unwrap();
        svc.shutdown();
        assert!(svc.store().is_empty());
        assert_eq!(svc.peer_count(), 0);
    }
}
