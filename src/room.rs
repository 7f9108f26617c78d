//! Room Management
//!
//! Rooms pair one offering peer with at most one joining peer under a
//! six-digit PIN. The store is process-scoped and owns every room record.

use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Inclusive lower bound of the PIN space (six digits, no leading zero)
const PIN_MIN: u32 = 100_000;
/// Exclusive upper bound of the PIN space
const PIN_MAX: u32 = 1_000_000;
/// Attempts before giving up on finding a free PIN
const PIN_ATTEMPTS: usize = 64;

/// Lifecycle of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Created,
    Joined,
    Answered,
    /// The answer has been pushed to the offerer
    Consumed,
}

/// Represents a rendezvous room
#[derive(Debug, Clone)]
pub struct Room {
    pub pin: String,
    pub offer: String,
    pub answer: Option<String>,
    pub offerer_id: String,
    pub joiner_id: Option<String>,
    pub created_at: Instant,
    pub state: RoomState,
}

impl Room {
    pub fn new(pin: String, offer: String, offerer_id: String) -> Self {
        Self {
            pin,
            offer,
            answer: None,
            offerer_id,
            joiner_id: None,
            created_at: Instant::now(),
            state: RoomState::Created,
        }
    }

    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }

    pub fn involves(&self, peer_id: &str) -> bool {
        self.offerer_id == peer_id || self.joiner_id.as_deref() == Some(peer_id)
    }
}

/// Room-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Room not found")]
    RoomNotFound,
    #[error("Room full")]
    RoomFull,
    #[error("Answer already submitted")]
    AnswerAlreadySubmitted,
    #[error("No free PIN available")]
    PinSpaceExhausted,
}

/// Storage for rooms keyed by PIN.
///
/// Every method is atomic with respect to the others on the same PIN.
pub trait RoomStore: Send + Sync {
    /// Insert a room unless its PIN is already taken
    fn insert(&self, room: Room) -> bool;

    fn get(&self, pin: &str) -> Option<Room>;

    /// Set the joiner if none is set yet and return the stored offer
    fn join(&self, pin: &str, joiner_id: &str) -> Result<String, RoomError>;

    /// Store the answer and return the offerer's id
    fn attach_answer(&self, pin: &str, answer: String) -> Result<String, RoomError>;

    fn set_state(&self, pin: &str, state: RoomState) -> bool;

    fn remove(&self, pin: &str) -> Option<Room>;

    /// Remove every room where the peer is offerer or joiner
    fn remove_by_party(&self, peer_id: &str) -> Vec<String>;

    /// Remove every room older than `ttl` at `now`
    fn remove_expired(&self, now: Instant, ttl: Duration) -> Vec<String>;

    /// Remove the room at `pin` only if it is older than `ttl` at `now`
    fn remove_if_expired(&self, pin: &str, now: Instant, ttl: Duration) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);
}

/// In-memory room store
pub struct MemoryRoomStore {
    rooms: RwLock<HashMap<String, Room>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRoomStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomStore for MemoryRoomStore {
    fn insert(&self, room: Room) -> bool {
        let mut rooms = self.rooms.write();
        if rooms.contains_key(&room.pin) {
            return false;
        }
        rooms.insert(room.pin.clone(), room);
        true
    }

    fn get(&self, pin: &str) -> Option<Room> {
        self.rooms.read().get(pin).cloned()
    }

    fn join(&self, pin: &str, joiner_id: &str) -> Result<String, RoomError> {
        let mut rooms = self.rooms.write();
        let room = rooms.get_mut(pin).ok_or(RoomError::RoomNotFound)?;
        if room.joiner_id.is_some() {
            return Err(RoomError::RoomFull);
        }
        room.joiner_id = Some(joiner_id.to_string());
        room.state = RoomState::Joined;
        Ok(room.offer.clone())
    }

    fn attach_answer(&self, pin: &str, answer: String) -> Result<String, RoomError> {
        let mut rooms = self.rooms.write();
        let room = rooms.get_mut(pin).ok_or(RoomError::RoomNotFound)?;
        if room.answer.is_some() {
            return Err(RoomError::AnswerAlreadySubmitted);
        }
        room.answer = Some(answer);
        room.state = RoomState::Answered;
        Ok(room.offerer_id.clone())
    }

    fn set_state(&self, pin: &str, state: RoomState) -> bool {
        match self.rooms.write().get_mut(pin) {
            Some(room) => {
                room.state = state;
                true
            }
            None => false,
        }
    }

    fn remove(&self, pin: &str) -> Option<Room> {
        self.rooms.write().remove(pin)
    }

    fn remove_by_party(&self, peer_id: &str) -> Vec<String> {
        let mut rooms = self.rooms.write();
        let pins: Vec<String> = rooms
            .values()
            .filter(|r| r.involves(peer_id))
            .map(|r| r.pin.clone())
            .collect();
        for pin in &pins {
            rooms.remove(pin);
        }
        pins
    }

    fn remove_expired(&self, now: Instant, ttl: Duration) -> Vec<String> {
        let mut rooms = self.rooms.write();
        let pins: Vec<String> = rooms
            .values()
            .filter(|r| r.is_expired(now, ttl))
            .map(|r| r.pin.clone())
            .collect();
        for pin in &pins {
            rooms.remove(pin);
        }
        pins
    }

    fn remove_if_expired(&self, pin: &str, now: Instant, ttl: Duration) -> bool {
        let mut rooms = self.rooms.write();
        let expired = rooms.get(pin).is_some_and(|r| r.is_expired(now, ttl));
        if expired {
            rooms.remove(pin);
        }
        expired
    }

    fn len(&self) -> usize {
        self.rooms.read().len()
    }

    fn clear(&self) {
        self.rooms.write().clear();
    }
}

/// Draw a uniformly random six-digit PIN
pub fn random_pin() -> String {
    rand::rng().random_range(PIN_MIN..PIN_MAX).to_string()
}

/// Store a new room under a fresh PIN, retrying on collision
pub fn insert_with_fresh_pin<S: RoomStore + ?Sized>(
    store: &S,
    offer: String,
    offerer_id: &str,
) -> Result<String, RoomError> {
    for _ in 0..PIN_ATTEMPTS {
        let pin = random_pin();
        if store.insert(Room::new(pin.clone(), offer.clone(), offerer_id.to_string())) {
            return Ok(pin);
        }
        log::debug!("PIN {} already in use, retrying", pin);
    }
    Err(RoomError::PinSpaceExhausted)
}

/// Whether a string is a well-formed PIN
pub fn is_valid_pin(pin: &str) -> bool {
    pin.len() == 6 && pin.bytes().all(|b| b.is_ascii_digit())
}
