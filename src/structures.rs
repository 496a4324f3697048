//! Record structures: the shape tables shared by the encoder and the decoder.
//!
//! - [`StructureStore`]: persistence hook for the shared pool
//! - [`InMemoryStructures`]: a thread-safe store for sessions in one process
//! - `RecordShapes`: the encoder's transition trie and id allocator
//! - `StructureTable`: the decoder's id to field-list table
//!
//! ## Examples
//!
//! ```rust
//! use serde_packr::{packr, InMemoryStructures, Packer, StructureStore};
//!
//! let store = InMemoryStructures::new();
//! let mut packer = Packer::new().with_structure_store(store.clone());
//! packer.encode(&packr!({ "id": 1, "name": "a" })).unwrap();
//!
//! assert_eq!(store.get_structures(), vec![vec!["id".to_string(), "name".to_string()]]);
//! ```

use crate::options::{Options, RECORD_ID_BASE, TWO_BYTE_ID_BASE};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Persistence for shared record structures.
///
/// A [`Packer`](crate::Packer) reads the store before its first encode and
/// saves after every encode that added shared structures. An
/// [`Unpacker`](crate::Unpacker) reads it when a buffer references a shared id
/// it has no definition for.
pub trait StructureStore {
    /// Current shared structures, in id order.
    fn get_structures(&self) -> Vec<Vec<String>>;

    /// Replaces the stored structures.
    ///
    /// `expected_len` is the number of structures the caller loaded. The store
    /// must refuse the save (return `false`) when it currently holds a
    /// different number, meaning another session saved in between.
    fn save_structures(&self, structures: &[Vec<String>], expected_len: usize) -> bool;
}

/// A [`StructureStore`] kept in memory behind a mutex.
///
/// Clones share the same structures, so one store can back several packers
/// and unpackers, including on different threads.
///
/// # Examples
///
/// ```rust
/// use serde_packr::{InMemoryStructures, StructureStore};
///
/// let store = InMemoryStructures::new();
/// let shape = vec![vec!["x".to_string(), "y".to_string()]];
/// assert!(store.save_structures(&shape, 0));
/// // a second writer that still believes the store is empty is refused
/// assert!(!store.save_structures(&shape, 0));
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryStructures {
    structures: Arc<Mutex<Vec<Vec<String>>>>,
}

impl InMemoryStructures {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with known structures.
    #[must_use]
    pub fn with_structures(structures: Vec<Vec<String>>) -> Self {
        InMemoryStructures {
            structures: Arc::new(Mutex::new(structures)),
        }
    }

    /// Number of stored structures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing has been stored yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<String>>> {
        self.structures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl StructureStore for InMemoryStructures {
    fn get_structures(&self) -> Vec<Vec<String>> {
        self.lock().clone()
    }

    fn save_structures(&self, structures: &[Vec<String>], expected_len: usize) -> bool {
        let mut stored = self.lock();
        if stored.len() != expected_len {
            debug!(
                stored = stored.len(),
                expected_len, "structure save refused: store changed"
            );
            return false;
        }
        *stored = structures.to_vec();
        true
    }
}

/// Wire bytes of a record id.
///
/// Returns the id bytes and how many of them are used.
pub(crate) fn record_id_bytes(id: u16, two_byte: bool) -> ([u8; 2], usize) {
    if !two_byte || id < TWO_BYTE_ID_BASE {
        ([id as u8, 0], 1)
    } else {
        let offset = id - TWO_BYTE_ID_BASE;
        ([(TWO_BYTE_ID_BASE + (offset & 0x1f)) as u8, (offset >> 5) as u8], 2)
    }
}

/// Record id from its two wire bytes (two-byte mode, first byte `>= 0x60`).
pub(crate) fn record_id_from_bytes(b0: u8, b1: u8) -> u16 {
    TWO_BYTE_ID_BASE + (u16::from(b0) - TWO_BYTE_ID_BASE) + (u16::from(b1) << 5)
}

/// Number of trie nodes after which the trie is rebuilt from the live shapes.
const MAX_TRIE_NODES: usize = 10_000;

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, usize>,
    id: Option<u16>,
}

#[derive(Clone, Debug)]
struct OwnSlot {
    node: usize,
    keys: Vec<String>,
}

/// Saved allocator state, restored when an encode fails.
#[derive(Clone, Debug)]
pub(crate) struct ShapesSnapshot {
    shared_len: usize,
    own: Vec<Option<OwnSlot>>,
    cursor: usize,
}

/// The encoder's shape classifier.
///
/// Objects are classified by walking their keys through an arena trie; the
/// node reached after the last key caches the record id of that key order.
#[derive(Debug)]
pub(crate) struct RecordShapes {
    nodes: Vec<TrieNode>,
    shared: Vec<Vec<String>>,
    own: Vec<Option<OwnSlot>>,
    cursor: usize,
    /// Shared structures known to be persisted (loaded or saved).
    saved_len: usize,
    shared_capacity: usize,
    own_capacity: usize,
    shared_limit_id: u16,
}

impl RecordShapes {
    pub(crate) fn new(options: &Options) -> Self {
        RecordShapes {
            nodes: vec![TrieNode::default()],
            shared: Vec::new(),
            own: Vec::new(),
            cursor: 0,
            saved_len: 0,
            shared_capacity: options.shared_capacity(),
            own_capacity: options.own_capacity(),
            shared_limit_id: options.shared_limit_id(),
        }
    }

    /// Trie node for a key sequence, creating the missing path.
    pub(crate) fn node_for<'k>(&mut self, keys: impl IntoIterator<Item = &'k str>) -> usize {
        let mut node = 0;
        for key in keys {
            node = match self.nodes[node].children.get(key) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children.insert(key.to_string(), child);
                    child
                }
            };
        }
        node
    }

    /// Cached record id of a trie node.
    pub(crate) fn id_of(&self, node: usize) -> Option<u16> {
        self.nodes[node].id
    }

    /// `true` when a new shape may still go to the shared pool.
    pub(crate) fn has_shared_room(&self) -> bool {
        self.shared.len() < self.shared_capacity
    }

    /// Assigns a record id to a new shape.
    ///
    /// Returns `None` when neither pool can take it; the object is then
    /// written as a plain map.
    pub(crate) fn allocate(&mut self, node: usize, keys: Vec<String>, share: bool) -> Option<u16> {
        let id = if share && self.has_shared_room() {
            let id = RECORD_ID_BASE + self.shared.len() as u16;
            debug!(id, fields = keys.len(), "allocated shared structure");
            self.shared.push(keys);
            id
        } else if self.own_capacity > 0 {
            if self.own.len() < self.own_capacity {
                self.own.resize(self.own_capacity, None);
            }
            let slot = self.cursor;
            if let Some(evicted) = self.own[slot].take() {
                debug!(slot, "evicting own structure");
                self.nodes[evicted.node].id = None;
            }
            self.own[slot] = Some(OwnSlot { node, keys });
            self.cursor = (slot + 1) % self.own_capacity;
            self.shared_limit_id + slot as u16
        } else {
            return None;
        };
        self.nodes[node].id = Some(id);
        Some(id)
    }

    /// Forgets the own ring (end of one buffer).
    pub(crate) fn clear_own(&mut self) {
        for slot in self.own.drain(..).flatten() {
            self.nodes[slot.node].id = None;
        }
        self.cursor = 0;
    }

    pub(crate) fn shared(&self) -> &[Vec<String>] {
        &self.shared
    }

    pub(crate) fn saved_len(&self) -> usize {
        self.saved_len
    }

    /// `true` when shared structures were added since the last load or save.
    pub(crate) fn has_unsaved(&self) -> bool {
        self.shared.len() > self.saved_len
    }

    pub(crate) fn mark_saved(&mut self) {
        self.saved_len = self.shared.len();
    }

    /// Replaces the shared pool with the structures of a store.
    pub(crate) fn load_shared(&mut self, mut structures: Vec<Vec<String>>) {
        debug!(count = structures.len(), "loaded shared structures");
        self.saved_len = structures.len();
        structures.truncate(self.shared_capacity);
        self.shared = structures;
        self.rebuild();
    }

    pub(crate) fn snapshot(&self) -> ShapesSnapshot {
        ShapesSnapshot {
            shared_len: self.shared.len(),
            own: self.own.clone(),
            cursor: self.cursor,
        }
    }

    pub(crate) fn restore(&mut self, snapshot: ShapesSnapshot) {
        self.shared.truncate(snapshot.shared_len);
        self.own = snapshot.own;
        self.cursor = snapshot.cursor;
        self.rebuild();
    }

    /// Rebuilds the trie once it has grown past its node budget.
    pub(crate) fn compact_if_needed(&mut self) {
        if self.nodes.len() > MAX_TRIE_NODES {
            debug!(nodes = self.nodes.len(), "rebuilding structure trie");
            self.rebuild();
        }
    }

    /// Re-creates the trie from the live shared and own structures.
    fn rebuild(&mut self) {
        self.nodes = vec![TrieNode::default()];
        let shared = std::mem::take(&mut self.shared);
        for (index, keys) in shared.iter().enumerate() {
            let node = self.node_for(keys.iter().map(String::as_str));
            self.nodes[node].id = Some(RECORD_ID_BASE + index as u16);
        }
        self.shared = shared;

        let mut own = std::mem::take(&mut self.own);
        for (slot, entry) in own.iter_mut().enumerate() {
            if let Some(entry) = entry {
                let node = self.node_for(entry.keys.iter().map(String::as_str));
                self.nodes[node].id = Some(self.shared_limit_id + slot as u16);
                entry.node = node;
            }
        }
        self.own = own;
    }

    #[cfg(test)]
    fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// The decoder's record table: field lists by record id.
#[derive(Clone, Debug, Default)]
pub(crate) struct StructureTable {
    slots: Vec<Option<Arc<[String]>>>,
    shared_capacity: usize,
}

impl StructureTable {
    pub(crate) fn new(options: &Options) -> Self {
        StructureTable {
            slots: Vec::new(),
            shared_capacity: options.shared_capacity(),
        }
    }

    pub(crate) fn get(&self, id: u16) -> Option<Arc<[String]>> {
        let index = usize::from(id.checked_sub(RECORD_ID_BASE)?);
        self.slots.get(index).cloned().flatten()
    }

    pub(crate) fn define(&mut self, id: u16, keys: Arc<[String]>) {
        let index = usize::from(id.saturating_sub(RECORD_ID_BASE));
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(keys);
    }

    /// `true` for ids in the shared pool.
    pub(crate) fn is_shared(&self, id: u16) -> bool {
        usize::from(id.saturating_sub(RECORD_ID_BASE)) < self.shared_capacity
    }

    /// Fills the shared range from a store, keeping inline definitions that
    /// the store does not know about.
    pub(crate) fn load_shared(&mut self, structures: Vec<Vec<String>>) {
        debug!(count = structures.len(), "loaded shared structures for decoding");
        for (index, keys) in structures
            .into_iter()
            .take(self.shared_capacity)
            .enumerate()
        {
            self.define(RECORD_ID_BASE + index as u16, keys.into());
        }
    }

    /// Forgets own structures (end of one buffer).
    pub(crate) fn clear_own(&mut self) {
        self.slots.truncate(self.shared_capacity);
    }
}
