// src/proxy/pool.rs
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use hyper_tls::HttpsConnector;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

/// Fixed number of outbound connection slots a proxy node can rotate through.
pub const POOL_CAPACITY: usize = 64;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Per-target set of reusable outbound clients.
///
/// Each slot owns its own hyper connection pool and is created on first use.
/// Slots are handed out by a rotating counter; there is no admission control,
/// a busy slot is simply shared.
pub struct ConnectionPool {
    slots: Vec<OnceLock<HttpClient>>,
    max_slots: usize,
    next_slot: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(max_backend_connections: usize) -> Self {
        let max_slots = max_backend_connections.clamp(1, POOL_CAPACITY);
        Self {
            slots: (0..max_slots).map(|_| OnceLock::new()).collect(),
            max_slots,
            next_slot: AtomicUsize::new(0),
        }
    }

    /// Index of the slot the next outbound call should use.
    pub fn next_slot(&self) -> usize {
        self.next_slot.fetch_add(1, Ordering::Relaxed) % self.max_slots
    }

    pub fn client(&self, slot: usize) -> &HttpClient {
        self.slots[slot % self.max_slots].get_or_init(build_client)
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    pub fn initialized_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.get().is_some()).count()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_slots", &self.max_slots)
            .field("initialized", &self.initialized_slots())
            .finish()
    }
}

fn build_client() -> HttpClient {
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(10)
        .build(HttpsConnector::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_rotate_modulo_max_connections() {
        let pool = ConnectionPool::new(3);
        let slots: Vec<usize> = (0..7).map(|_| pool.next_slot()).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn slot_count_is_bounded_by_capacity() {
        assert_eq!(ConnectionPool::new(1000).max_slots(), POOL_CAPACITY);
        assert_eq!(ConnectionPool::new(0).max_slots(), 1);
    }

    #[tokio::test]
    async fn clients_are_created_lazily() {
        let pool = ConnectionPool::new(4);
        assert_eq!(pool.initialized_slots(), 0);

        let slot = pool.next_slot();
        let _ = pool.client(slot);
        let _ = pool.client(slot);
        assert_eq!(pool.initialized_slots(), 1);
    }
}
