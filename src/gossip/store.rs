//! Spreadable-message cache with TTL decay, deduplication, and flood limits.
//!
//! A message is identified by `(data_type, SHA-256(data))`. The wire TTL is
//! decremented once per hop; a separate local TTL counts down one per round
//! and controls forwarding (`local_ttl > 0`) and eviction. Expired entries
//! linger for a grace period so re-received copies still deduplicate.

use crate::constants::{LOCAL_TTL_INFINITE, MESSAGE_FLOOD_LIMIT, MESSAGE_GRACE_ROUNDS};
use crate::gossip::node::Identity;
use crate::Hash;

/// Reasons a message is refused by the store.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("message already known")]
    Duplicate,
    #[error("message flood limit reached for peer {0}")]
    FloodLimit(Identity),
}

/// One cached message together with its spreading state.
#[derive(Clone, Debug, PartialEq)]
pub struct SpreadMessage {
    /// Rounds of forwarding left; drops below zero into the dedup grace
    /// window, eviction at `< -MESSAGE_GRACE_ROUNDS`.
    pub local_ttl: i32,
    /// TTL to put on the wire when forwarding (already decremented).
    pub ttl: u8,
    pub data_type: u16,
    pub data: Vec<u8>,
    pub data_hash: Hash,
    /// The peer we first received this message from (ourselves for local
    /// announcements).
    pub source: Identity,
}

/// The message cache. Callers wrap it in a mutex; operations are synchronous.
#[derive(Default)]
pub struct MessageStore {
    messages: Vec<SpreadMessage>,
}

impl MessageStore {
    pub fn new() -> Self {
        MessageStore::default()
    }

    /// Insert a message announced through the local API.
    ///
    /// The TTL goes on the wire unchanged (no hop was taken yet). A TTL of
    /// zero means infinite hops.
    pub fn spread(
        &mut self,
        ttl: u8,
        data_type: u16,
        data: Vec<u8>,
        source: Identity,
    ) -> Result<&SpreadMessage, StoreError> {
        let data_hash = crate::sha256(&data);
        if self.contains(data_type, &data_hash) {
            return Err(StoreError::Duplicate);
        }
        let local_ttl = if ttl == 0 {
            LOCAL_TTL_INFINITE
        } else {
            i32::from(ttl)
        };
        self.messages.push(SpreadMessage {
            local_ttl,
            ttl,
            data_type,
            data,
            data_hash,
            source,
        });
        Ok(self.messages.last().expect("just pushed"))
    }

    /// Insert a message received from a peer.
    ///
    /// Deduplicates by `(data_type, data_hash)` and refuses further messages
    /// from a peer that already has [`MESSAGE_FLOOD_LIMIT`] entries in the
    /// store. The wire TTL is decremented for the hop just taken.
    pub fn on_receive(
        &mut self,
        sender: Identity,
        ttl: u8,
        data_type: u16,
        data: Vec<u8>,
    ) -> Result<&SpreadMessage, StoreError> {
        let data_hash = crate::sha256(&data);
        if self.contains(data_type, &data_hash) {
            return Err(StoreError::Duplicate);
        }
        let from_same_source = self
            .messages
            .iter()
            .filter(|m| m.source == sender)
            .count();
        if from_same_source >= MESSAGE_FLOOD_LIMIT {
            return Err(StoreError::FloodLimit(sender));
        }

        let (new_ttl, local_ttl) = if ttl == 0 {
            (0, LOCAL_TTL_INFINITE)
        } else {
            (ttl - 1, i32::from(ttl - 1))
        };
        self.messages.push(SpreadMessage {
            local_ttl,
            ttl: new_ttl,
            data_type,
            data,
            data_hash,
            source: sender,
        });
        Ok(self.messages.last().expect("just pushed"))
    }

    /// Round boundary: age every entry and evict those past the grace window.
    pub fn decay(&mut self) {
        for message in &mut self.messages {
            message.local_ttl -= 1;
        }
        self.messages
            .retain(|m| m.local_ttl >= -MESSAGE_GRACE_ROUNDS);
    }

    /// Remove every entry with the given data hash (validation failed).
    pub fn remove_by_hash(&mut self, data_hash: &Hash) {
        self.messages.retain(|m| &m.data_hash != data_hash);
    }

    /// Clones of all entries that may still be forwarded.
    pub fn forwardable(&self) -> Vec<SpreadMessage> {
        self.messages
            .iter()
            .filter(|m| m.local_ttl > 0)
            .cloned()
            .collect()
    }

    /// All cached entries, forwardable or not.
    pub fn messages(&self) -> &[SpreadMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn contains(&self, data_type: u16, data_hash: &Hash) -> bool {
        self.messages
            .iter()
            .any(|m| m.data_type == data_type && &m.data_hash == data_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> Identity {
        Identity::from(crate::sha256(&[seed]))
    }

    #[test]
    fn receive_sets_hash_and_decrements_ttl() {
        let mut store = MessageStore::new();
        let message = store
            .on_receive(peer(1), 3, 0x1234, b"hello".to_vec())
            .unwrap();
        assert_eq!(message.ttl, 2);
        assert_eq!(message.local_ttl, 2);
        assert_eq!(message.data_hash, crate::sha256(b"hello"));
    }

    #[test]
    fn zero_ttl_means_infinite() {
        let mut store = MessageStore::new();
        let message = store
            .on_receive(peer(1), 0, 0x1234, b"forever".to_vec())
            .unwrap();
        assert_eq!(message.ttl, 0);
        assert_eq!(message.local_ttl, LOCAL_TTL_INFINITE);
    }

    #[test]
    fn duplicate_insert_keeps_size_one() {
        let mut store = MessageStore::new();
        store.on_receive(peer(1), 5, 7, b"data".to_vec()).unwrap();
        assert_eq!(
            store.on_receive(peer(2), 5, 7, b"data".to_vec()),
            Err(StoreError::Duplicate)
        );
        assert_eq!(store.len(), 1);

        // same bytes under a different data type are a distinct message
        store.on_receive(peer(2), 5, 8, b"data".to_vec()).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn spread_deduplicates_too() {
        let mut store = MessageStore::new();
        store.spread(4, 7, b"mine".to_vec(), peer(0)).unwrap();
        assert_eq!(
            store.spread(4, 7, b"mine".to_vec(), peer(0)),
            Err(StoreError::Duplicate)
        );
    }

    #[test]
    fn spread_keeps_wire_ttl_undecremented() {
        let mut store = MessageStore::new();
        let message = store.spread(4, 7, b"mine".to_vec(), peer(0)).unwrap();
        assert_eq!(message.ttl, 4);
        assert_eq!(message.local_ttl, 4);
    }

    #[test]
    fn flood_limit_rejects_the_51st_message() {
        let mut store = MessageStore::new();
        let flooder = peer(9);
        for i in 0..50u32 {
            store
                .on_receive(flooder, 5, 7, i.to_be_bytes().to_vec())
                .unwrap();
        }
        assert_eq!(
            store.on_receive(flooder, 5, 7, b"one too many".to_vec()),
            Err(StoreError::FloodLimit(flooder))
        );
        // other peers are unaffected
        store
            .on_receive(peer(3), 5, 7, b"one too many".to_vec())
            .unwrap();
    }

    #[test]
    fn ttl_three_is_forwardable_for_three_rounds() {
        let mut store = MessageStore::new();
        store.spread(3, 7, b"hops".to_vec(), peer(0)).unwrap();

        for round in 1..=3 {
            assert_eq!(store.forwardable().len(), 1, "round {round}");
            store.decay();
        }
        // local_ttl reached 0: no longer forwardable, still deduplicating
        assert!(store.forwardable().is_empty());
        assert_eq!(
            store.spread(3, 7, b"hops".to_vec(), peer(0)),
            Err(StoreError::Duplicate)
        );
    }

    #[test]
    fn expired_message_is_purged_after_the_grace_window() {
        let mut store = MessageStore::new();
        store.spread(3, 7, b"hops".to_vec(), peer(0)).unwrap();

        // 3 forwarding rounds + 24 grace rounds of dedup memory
        for _ in 0..27 {
            store.decay();
        }
        assert_eq!(store.len(), 1);

        store.decay();
        assert!(store.is_empty());
        // forgotten: the same message may now be inserted again
        store.spread(3, 7, b"hops".to_vec(), peer(0)).unwrap();
    }

    #[test]
    fn remove_by_hash_purges_invalidated_messages() {
        let mut store = MessageStore::new();
        store.on_receive(peer(1), 5, 7, b"bad".to_vec()).unwrap();
        store.on_receive(peer(1), 5, 8, b"bad".to_vec()).unwrap();
        store.on_receive(peer(1), 5, 7, b"good".to_vec()).unwrap();

        store.remove_by_hash(&crate::sha256(b"bad"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.forwardable()[0].data, b"good");
    }
}
