//! Stream reservations for single-connection mode.
//!
//! A reservation is created by a `PUT`, consumed by exactly one `GET` attach, and
//! carries every operation submitted against its token until the output stream closes.
//! The registry is the only process-global state on the server side: a concurrent map
//! from opaque token to reservation, with per-reservation state serialized behind its
//! own locks. Reservations that are never attached are evicted after an idle timeout
//! so abandoned `PUT`s cannot pin memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bound on events buffered while no consumer is attached.
///
/// Producers await channel capacity, so a reservation that is never attached holds at
/// most this many encoded records before its operations stop making progress.
pub(crate) const STREAM_WINDOW: usize = 64;

/// A reserved single-connection stream.
///
/// Holds the output channel every operation on this token writes into, the one-shot
/// receiver handed to the attaching `GET`, and the cancellation triggers for in-flight
/// operations.
pub struct Reservation {
    token: String,
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    consumed: AtomicBool,
    closed: CancellationToken,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    operations: Mutex<HashMap<String, CancellationToken>>,
}

impl Reservation {
    fn new(token: String) -> Self {
        let (tx, rx) = mpsc::channel(STREAM_WINDOW);
        let now = Instant::now();
        Self {
            token,
            tx,
            rx: Mutex::new(Some(rx)),
            consumed: AtomicBool::new(false),
            closed: CancellationToken::new(),
            created_at: now,
            last_activity: Mutex::new(now),
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// The opaque token binding requests to this reservation.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// A sender feeding the reservation's output stream.
    pub fn sender(&self) -> mpsc::Sender<Bytes> {
        self.tx.clone()
    }

    /// Takes the output receiver, marking the reservation consumed.
    ///
    /// Returns `None` on the second and later calls; a token is valid for exactly one
    /// attach.
    pub fn attach(&self) -> Option<mpsc::Receiver<Bytes>> {
        let rx = self.rx.lock().take()?;
        self.consumed.store(true, Ordering::Release);
        self.touch();
        Some(rx)
    }

    /// Whether a `GET` has already attached to this reservation.
    pub fn consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    /// Token cancelled when the reservation is destroyed.
    ///
    /// The attached response body observes it so a server-side close terminates the
    /// stream instead of leaving the peer waiting on a silent connection.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// When the reservation was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the reservation last saw a request.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Records request activity on this reservation.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Registers an operation's cancellation trigger under its id.
    ///
    /// Fails when the id is already taken within this reservation.
    pub fn add_operation(&self, id: &str, cancel: CancellationToken) -> bool {
        self.touch();
        let mut ops = self.operations.lock();
        if ops.contains_key(id) {
            return false;
        }
        ops.insert(id.to_string(), cancel);
        true
    }

    /// Cancels the identified operation, returning whether it existed.
    pub fn cancel_operation(&self, id: &str) -> bool {
        self.touch();
        match self.operations.lock().remove(id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drops a finished operation's record without triggering cancellation.
    pub fn remove_operation(&self, id: &str) {
        self.operations.lock().remove(id);
    }

    /// Number of operations currently registered on this reservation.
    pub fn operation_count(&self) -> usize {
        self.operations.lock().len()
    }

    fn cancel_all(&self) {
        self.closed.cancel();
        let ops = std::mem::take(&mut *self.operations.lock());
        for cancel in ops.into_values() {
            cancel.cancel();
        }
    }
}

/// Process-local mapping from stream token to reservation.
///
/// Lookups are concurrent; mutation of a reservation's contents goes through the
/// reservation's own locks.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<DashMap<String, Arc<Reservation>>>,
}

impl StreamRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a fresh stream token: 128 random bits as lowercase hex.
    pub fn generate_token() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Registers a reservation under `token`.
    ///
    /// Returns `None` when the token is already reserved. If the reservation is not
    /// attached within `idle_timeout` it is evicted and its operations cancelled.
    pub fn reserve(&self, token: String, idle_timeout: Duration) -> Option<Arc<Reservation>> {
        use dashmap::mapref::entry::Entry;

        let reservation = match self.streams.entry(token.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(entry) => {
                let reservation = Arc::new(Reservation::new(token.clone()));
                entry.insert(reservation.clone());
                reservation
            }
        };

        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            let evict = registry
                .get(&token)
                .is_some_and(|r| !r.consumed());
            if evict {
                tracing::debug!(token = %token, "evicting unclaimed stream reservation");
                registry.close(&token);
            }
        });

        Some(reservation)
    }

    /// Looks up the reservation for `token`.
    pub fn get(&self, token: &str) -> Option<Arc<Reservation>> {
        self.streams.get(token).map(|r| r.value().clone())
    }

    /// Removes the reservation for `token`, cancelling every operation it holds.
    pub fn close(&self, token: &str) {
        if let Some((_, reservation)) = self.streams.remove(token) {
            reservation.cancel_all();
        }
    }

    /// Number of live reservations.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Tokens of every live reservation.
    pub fn tokens(&self) -> Vec<String> {
        self.streams.iter().map(|r| r.key().clone()).collect()
    }

    /// Whether the registry holds no reservations.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
