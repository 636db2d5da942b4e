//! L1 Cache - In-Process LRU + TTL
//!
//! Capacity-bounded, entry-counted LRU with absolute TTL, guarded by a
//! single mutex.
//!
//! # Design
//!
//! - Doubly-linked LRU list realised as an index-addressed arena: a growable
//!   slot vector plus a free list, linked through `usize` handles
//! - `HashMap<String, usize>` index from key to slot
//! - Head = most recently used, tail = least recently used
//! - Expiry is lazy: a stale entry is dropped when read, otherwise it stays
//!   resident until LRU pressure or an explicit delete removes it
//!
//! The node set reachable from `head` always equals the key set of the
//! index; every mutation keeps both in step under the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::entry::CacheEntry;

/// Arena node: one entry plus its list links
#[derive(Debug)]
struct Node<V> {
    entry: CacheEntry<V>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Index + list, only ever touched under the L1 lock
#[derive(Debug)]
struct LruState<V> {
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<V> LruState<V> {
    fn with_capacity(capacity: usize) -> Self {
        // Pre-size modestly; large capacities grow on demand
        let initial = capacity.min(1024);
        Self {
            slots: Vec::with_capacity(initial),
            free: Vec::new(),
            index: HashMap::with_capacity(initial),
            head: None,
            tail: None,
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn node(&self, idx: usize) -> Option<&Node<V>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<V>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    /// Unlink a node from the list, leaving it in its slot
    fn detach(&mut self, idx: usize) {
        let (prev, next) = match self.node(idx) {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = None;
        }
    }

    /// Link a detached node in at the head
    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(node) = self.node_mut(h) {
                    node.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn promote(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.detach(idx);
            self.push_front(idx);
        }
    }

    fn alloc(&mut self, node: Node<V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    /// Unlink and free a slot, returning its node
    fn release(&mut self, idx: usize) -> Option<Node<V>> {
        self.detach(idx);
        let node = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        Some(node)
    }

    fn remove(&mut self, key: &str) -> Option<Node<V>> {
        let idx = self.index.remove(key)?;
        self.release(idx)
    }

    fn pop_tail(&mut self) -> Option<Node<V>> {
        let idx = self.tail?;
        let key = self.node(idx)?.entry.key.clone();
        self.index.remove(&key);
        self.release(idx)
    }

    fn insert_front(&mut self, entry: CacheEntry<V>) {
        let key = entry.key.clone();
        let idx = self.alloc(Node {
            entry,
            prev: None,
            next: None,
        });
        self.push_front(idx);
        self.index.insert(key, idx);
    }

    /// Keys from head (MRU) to tail (LRU)
    fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            match self.node(idx) {
                Some(node) => {
                    keys.push(node.entry.key.clone());
                    cursor = node.next;
                }
                None => break,
            }
        }
        keys
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }
}

/// L1 Cache - in-process LRU with absolute TTL
pub struct L1Cache<V> {
    /// Index and list, guarded together
    state: Mutex<LruState<V>>,
    /// Maximum resident entries
    capacity: usize,
    /// Capacity evictions
    evictions: AtomicU64,
    /// Entries dropped because a read found them stale
    expirations: AtomicU64,
}

impl<V: Clone> L1Cache<V> {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(LruState::with_capacity(capacity)),
            capacity,
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up a key, promoting it to most-recently-used.
    ///
    /// A stale entry is removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let idx = *state.index.get(key)?;

        let expired = state.node(idx)?.entry.is_expired_at(now);
        if expired {
            state.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        state.promote(idx);
        let node = state.node_mut(idx)?;
        node.entry.record_access(now);
        Some(node.entry.value.clone())
    }

    /// Insert or replace a value at the head of the LRU list.
    ///
    /// Replacing restarts the TTL clock. Returns the key evicted to make
    /// room, if any.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) -> Option<String> {
        let key = key.into();
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(&idx) = state.index.get(&key) {
            if let Some(node) = state.node_mut(idx) {
                node.entry = CacheEntry::created_at(key, value, ttl, now);
            }
            state.promote(idx);
            return None;
        }

        state.insert_front(CacheEntry::created_at(key, value, ttl, now));

        if state.len() > self.capacity {
            if let Some(evicted) = state.pop_tail() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                return Some(evicted.entry.key);
            }
        }
        None
    }

    /// Remove a key. Returns whether it was resident.
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Read without promoting or touching access bookkeeping.
    ///
    /// Stale entries read as absent but are left in place.
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let state = self.state.lock();
        let idx = *state.index.get(key)?;
        let node = state.node(idx)?;
        if node.entry.is_expired_at(now) {
            None
        } else {
            Some(node.entry.value.clone())
        }
    }

    /// Snapshot of an entry's bookkeeping, without promoting it
    pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
        let state = self.state.lock();
        let idx = *state.index.get(key)?;
        state.node(idx).map(|node| node.entry.clone())
    }

    /// Whether the key is resident, stale or not
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().index.contains_key(key)
    }

    /// Resident keys, most recently used first
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().keys()
    }

    /// Remove every resident key matching `predicate`, returning the count
    pub fn remove_matching<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let mut state = self.state.lock();
        let doomed: Vec<String> = state
            .index
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        for key in &doomed {
            state.remove(key);
        }
        doomed.len()
    }

    /// Number of resident entries (including stale ones not yet read)
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum resident entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Capacity evictions so far
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Lazy expirations so far
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    /// Walk the list both ways and compare it with the index
    #[cfg(test)]
    fn check_invariants(&self) {
        let state = self.state.lock();
        let forward = state.keys();
        assert_eq!(forward.len(), state.index.len(), "list/index size mismatch");
        for key in &forward {
            assert!(state.index.contains_key(key), "listed key {} not indexed", key);
        }

        let mut backward = Vec::new();
        let mut cursor = state.tail;
        while let Some(idx) = cursor {
            let node = state.node(idx).expect("tail chain hits empty slot");
            backward.push(node.entry.key.clone());
            cursor = node.prev;
        }
        backward.reverse();
        assert_eq!(forward, backward, "prev/next links disagree");

        for (key, &idx) in &state.index {
            assert_eq!(&state.node(idx).expect("index hits empty slot").entry.key, key);
        }
        assert!(state.len() <= self.capacity);
    }
}

// =============================================================================
// Tests
// =============================================================================
