//! Bounded cache for content chunks awaiting their envelopes.
//!
//! Large operations travel as an envelope plus a separately-delivered
//! content chunk. Whichever half arrives first waits here for the other:
//! chunks received ahead of their envelope are parked until the envelope is
//! processed, and locally-submitted split contents are parked so the
//! server's echo of our own envelope can be rejoined without a round trip.
//!
//! Capacity is a tuning parameter, not a correctness limit. When a chunk is
//! evicted before its envelope shows up, the reassembly path falls back to
//! a targeted storage fetch.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::events::EventHub;
use tandem_protocol::ContentMessage;

/// Bounded FIFO of content chunks with per-client lookup.
pub struct ContentCache {
    capacity: usize,
    events: EventHub<String>,
    state: Mutex<CacheState>,
}

struct CacheState {
    items: VecDeque<ContentMessage>,
    evictions: u64,
}

impl ContentCache {
    /// Create a cache holding at most `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: EventHub::default(),
            state: Mutex::new(CacheState {
                items: VecDeque::new(),
                evictions: 0,
            }),
        }
    }

    /// Insert a chunk, evicting the oldest entry if the cache is full.
    /// Every insert announces the chunk's client id to subscribers.
    pub fn set(&self, content: ContentMessage) {
        let client_id = content.client_id.clone();
        {
            let mut state = self.state.lock();
            if state.items.len() == self.capacity {
                if let Some(dropped) = state.items.pop_front() {
                    state.evictions += 1;
                    tracing::warn!(
                        client_id = %dropped.client_id,
                        client_sequence_number = dropped.client_sequence_number,
                        "content cache full, evicting oldest chunk"
                    );
                }
            }
            state.items.push_back(content);
        }
        self.events.emit(client_id);
    }

    /// The oldest cached chunk for `client_id`, without removing it.
    pub fn peek(&self, client_id: &str) -> Option<ContentMessage> {
        self.state
            .lock()
            .items
            .iter()
            .find(|content| content.client_id == client_id)
            .cloned()
    }

    /// Remove and return the oldest cached chunk for `client_id`.
    pub fn get(&self, client_id: &str) -> Option<ContentMessage> {
        let mut state = self.state.lock();
        let position = state
            .items
            .iter()
            .position(|content| content.client_id == client_id)?;
        state.items.remove(position)
    }

    /// Subscribe to insert announcements (the inserted chunk's client id).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }

    /// Number of cached chunks.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the cache holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// How many chunks have been evicted at capacity.
    pub fn evictions(&self) -> u64 {
        self.state.lock().evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(client_id: &str, client_sequence_number: u64) -> ContentMessage {
        ContentMessage {
            client_id: client_id.to_string(),
            client_sequence_number,
            contents: json!(format!("payload-{client_sequence_number}")),
        }
    }

    #[test]
    fn peek_does_not_remove_and_get_does() {
        let cache = ContentCache::new(10);
        cache.set(chunk("alice", 1));

        assert_eq!(cache.peek("alice").unwrap().client_sequence_number, 1);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.get("alice").unwrap().client_sequence_number, 1);
        assert!(cache.is_empty());
        assert!(cache.get("alice").is_none());
    }

    #[test]
    fn lookup_is_per_client_and_fifo() {
        let cache = ContentCache::new(10);
        cache.set(chunk("alice", 1));
        cache.set(chunk("bob", 5));
        cache.set(chunk("alice", 2));

        assert_eq!(cache.peek("bob").unwrap().client_sequence_number, 5);
        assert_eq!(cache.get("alice").unwrap().client_sequence_number, 1);
        assert_eq!(cache.get("alice").unwrap().client_sequence_number, 2);
    }

    #[test]
    fn insert_beyond_capacity_evicts_oldest() {
        let cache = ContentCache::new(2);
        cache.set(chunk("alice", 1));
        cache.set(chunk("alice", 2));
        cache.set(chunk("alice", 3));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 1);
        assert_eq!(cache.get("alice").unwrap().client_sequence_number, 2);
    }

    #[tokio::test]
    async fn set_announces_client_id() {
        let cache = ContentCache::new(10);
        let mut arrivals = cache.subscribe();
        cache.set(chunk("alice", 1));
        assert_eq!(arrivals.recv().await.unwrap(), "alice");
    }
}
