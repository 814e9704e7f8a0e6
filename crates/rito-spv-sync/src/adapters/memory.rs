//! In-Memory Adapters
//!
//! `HeaderIndex` and `PersistenceGateway` implementations that keep
//! everything in process memory. Used by embedders without a database and
//! throughout the tests.

use crate::domain::{Hash, HeaderRecord, Peer};
use crate::ports::outbound::{HeaderIndex, PersistenceGateway};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Header store indexed by hash and by height.
#[derive(Debug, Default)]
pub struct MemoryHeaderIndex {
    /// Headers indexed by hash.
    headers: HashMap<Hash, HeaderRecord>,
    /// Hash indexed by height.
    by_height: BTreeMap<u32, Hash>,
}

impl MemoryHeaderIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Header at `height`.
    pub fn get_by_height(&self, height: u32) -> Option<&HeaderRecord> {
        self.by_height
            .get(&height)
            .and_then(|hash| self.headers.get(hash))
    }
}

impl HeaderIndex for MemoryHeaderIndex {
    fn get(&self, hash: &Hash) -> Option<HeaderRecord> {
        self.headers.get(hash).cloned()
    }

    fn insert(&mut self, header: HeaderRecord) {
        if let Some(old) = self.by_height.insert(header.height, header.hash) {
            if old != header.hash {
                self.headers.remove(&old);
            }
        }
        self.headers.insert(header.hash, header);
    }

    fn remove_above(&mut self, height: u32) -> usize {
        let Some(first) = height.checked_add(1) else {
            return 0;
        };
        let removed = self.by_height.split_off(&first);
        for hash in removed.values() {
            self.headers.remove(hash);
        }
        removed.len()
    }

    fn tip(&self) -> Option<HeaderRecord> {
        self.by_height
            .values()
            .next_back()
            .and_then(|hash| self.headers.get(hash))
            .cloned()
    }

    fn headers_from(&self, height: u32) -> Vec<HeaderRecord> {
        self.by_height
            .range(height..)
            .filter_map(|(_, hash)| self.headers.get(hash))
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.headers.len()
    }
}

/// One recorded persistence call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SavedBatch {
    /// `save_blocks(replace, blocks)`.
    Blocks {
        /// Full replacement?
        replace: bool,
        /// Saved headers.
        blocks: Vec<HeaderRecord>,
    },
    /// `save_peers(replace, peers)`.
    Peers {
        /// Full replacement?
        replace: bool,
        /// Saved peers.
        peers: Vec<Peer>,
    },
}

/// Persistence gateway that keeps the durable view in memory and records
/// every call.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    blocks: Mutex<BTreeMap<u32, HeaderRecord>>,
    peers: Mutex<Vec<Peer>>,
    calls: Mutex<Vec<SavedBatch>>,
}

impl MemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Saved headers, ascending by height.
    pub fn blocks(&self) -> Vec<HeaderRecord> {
        self.blocks.lock().values().cloned().collect()
    }

    /// Saved peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.lock().clone()
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<SavedBatch> {
        self.calls.lock().clone()
    }
}

impl PersistenceGateway for MemoryPersistence {
    fn save_blocks(&self, replace: bool, blocks: &[HeaderRecord]) {
        {
            let mut stored = self.blocks.lock();
            if replace {
                stored.clear();
            }
            for block in blocks {
                stored.insert(block.height, block.clone());
            }
        }
        self.calls.lock().push(SavedBatch::Blocks {
            replace,
            blocks: blocks.to_vec(),
        });
    }

    fn save_peers(&self, replace: bool, peers: &[Peer]) {
        {
            let mut stored = self.peers.lock();
            if replace {
                stored.clear();
            }
            for peer in peers {
                let addr = peer.socket_addr();
                stored.retain(|p| p.socket_addr() != addr);
                stored.push(peer.clone());
            }
        }
        self.calls.lock().push(SavedBatch::Peers {
            replace,
            peers: peers.to_vec(),
        });
    }
}
