//! The process-wide pixmap cache.
//!
//! One cache instance is shared by all channel clients of the same
//! logical remote party. Entries live in a slab; the hash map and the
//! index-linked LRU ring reference slab slots, keeping the two views
//! one-to-one by construction. `available` is signed: freezing parks the
//! live ring behind saved endpoints and drops `available` to -1 so every
//! add fails until the cache is reset.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::debug;

/// Fixed width of the per-peer serial vectors.
pub const MAX_CACHE_CLIENTS: usize = 4;

/// Monotonic message serials, one per channel client of the party.
pub type SyncVector = [u64; MAX_CACHE_CLIENTS];

/// Element-wise max, used when merging migrated serial vectors.
pub fn merge_sync(into: &mut SyncVector, other: &SyncVector) {
    for (a, b) in into.iter_mut().zip(other) {
        *a = (*a).max(*b);
    }
}

/// One id evicted on behalf of an add, with the serial vector the
/// receivers must have acknowledged before reusing the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub id: u64,
    pub sync: SyncVector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// The caller's view of the cache generation is stale; it must sync
    /// before adding again.
    StaleGeneration,
    /// No eviction could make room (frozen cache, or the LRU tail has not
    /// been acknowledged by this receiver yet).
    Blocked,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    size: u64,
    lossy: bool,
    sync: SyncVector,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    capacity: i64,
    available: i64,
    generation: u32,
    frozen: bool,
    frozen_head: Option<usize>,
    frozen_tail: Option<usize>,
    sync: SyncVector,
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    hash: HashMap<u64, usize>,
    lru_head: Option<usize>,
    lru_tail: Option<usize>,
    items: usize,
}

impl Inner {
    fn alloc(&mut self, entry: Entry) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    fn release_slot(&mut self, idx: usize) {
        self.slots[idx] = None;
        self.free.push(idx);
    }

    fn entry(&self, idx: usize) -> &Entry {
        self.slots[idx].as_ref().expect("live cache entry")
    }

    fn entry_mut(&mut self, idx: usize) -> &mut Entry {
        self.slots[idx].as_mut().expect("live cache entry")
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.entry(idx);
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.entry_mut(p).next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.entry_mut(n).prev = prev,
            None => self.lru_tail = prev,
        }
        let e = self.entry_mut(idx);
        e.prev = None;
        e.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.lru_head;
        {
            let e = self.entry_mut(idx);
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head {
            self.entry_mut(h).prev = Some(idx);
        }
        self.lru_head = Some(idx);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(idx);
        }
    }

    /// Frees every entry reachable from the live ring.
    fn drop_ring(&mut self) {
        let mut cur = self.lru_head;
        while let Some(idx) = cur {
            cur = self.entry(idx).next;
            self.release_slot(idx);
        }
        self.lru_head = None;
        self.lru_tail = None;
    }
}

/// Pixmap cache shared across the channel clients of one remote party.
#[derive(Debug)]
pub struct PixmapCache {
    client: u64,
    id: u8,
    inner: Mutex<Inner>,
}

impl PixmapCache {
    fn new(client: u64, id: u8, capacity: i64) -> Self {
        Self {
            client,
            id,
            inner: Mutex::new(Inner {
                capacity,
                available: capacity,
                ..Inner::default()
            }),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn client(&self) -> u64 {
        self.client
    }

    pub fn generation(&self) -> u32 {
        self.inner.lock().unwrap().generation
    }

    pub fn capacity(&self) -> i64 {
        self.inner.lock().unwrap().capacity
    }

    pub fn available(&self) -> i64 {
        self.inner.lock().unwrap().available
    }

    pub fn items(&self) -> usize {
        self.inner.lock().unwrap().items
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().unwrap().frozen
    }

    /// Inserts `id`, evicting from the LRU tail until the size fits.
    ///
    /// Evicted ids are appended to `evictions` together with their serial
    /// vectors; the caller owns publishing them to its peer. An entry
    /// whose serial for `client_index` equals `serial` has not been
    /// acknowledged by that receiver yet and blocks the insert instead of
    /// being evicted.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        client_index: usize,
        client_generation: u32,
        serial: u64,
        id: u64,
        size: u64,
        lossy: bool,
        evictions: &mut Vec<Eviction>,
    ) -> AddOutcome {
        debug_assert!(size > 0);
        let mut g = self.inner.lock().unwrap();

        if g.generation != client_generation {
            return AddOutcome::StaleGeneration;
        }

        g.available -= size as i64;
        while g.available < 0 {
            let Some(tail) = g.lru_tail else {
                g.available += size as i64;
                return AddOutcome::Blocked;
            };
            if g.entry(tail).sync[client_index] == serial {
                g.available += size as i64;
                return AddOutcome::Blocked;
            }

            let (tail_id, tail_size, tail_sync) = {
                let e = g.entry(tail);
                (e.id, e.size, e.sync)
            };
            g.unlink(tail);
            g.hash.remove(&tail_id);
            g.release_slot(tail);
            g.available += tail_size as i64;
            g.items -= 1;
            g.sync[client_index] = serial;
            evictions.push(Eviction {
                id: tail_id,
                sync: tail_sync,
            });
        }

        let mut sync = SyncVector::default();
        sync[client_index] = serial;
        let idx = g.alloc(Entry {
            id,
            size,
            lossy,
            sync,
            prev: None,
            next: None,
        });
        if let Some(old) = g.hash.insert(id, idx) {
            // Duplicate id published by the peer: drop the older entry so
            // hash and ring stay one-to-one.
            let old_size = g.entry(old).size;
            g.unlink(old);
            g.release_slot(old);
            g.available += old_size as i64;
            g.items -= 1;
        }
        g.push_front(idx);
        g.items += 1;
        g.sync[client_index] = serial;
        AddOutcome::Added
    }

    /// Marks a hit on `id` for a sender, refreshing LRU position and the
    /// receiver's serial. Returns the entry's lossy flag.
    pub fn hit(&self, client_index: usize, serial: u64, id: u64) -> Option<bool> {
        let mut g = self.inner.lock().unwrap();
        let idx = *g.hash.get(&id)?;
        g.unlink(idx);
        g.push_front(idx);
        let e = g.entry_mut(idx);
        e.sync[client_index] = serial;
        let lossy = e.lossy;
        g.sync[client_index] = serial;
        Some(lossy)
    }

    /// Toggles the lossy flag on an existing entry.
    pub fn set_lossy(&self, id: u64, lossy: bool) -> bool {
        let mut g = self.inner.lock().unwrap();
        match g.hash.get(&id).copied() {
            Some(idx) => {
                g.entry_mut(idx).lossy = lossy;
                true
            }
            None => false,
        }
    }

    /// Detaches the live ring behind saved endpoints and blocks all adds
    /// until [`PixmapCache::clear`]. Returns false when already frozen.
    pub fn freeze(&self) -> bool {
        let mut g = self.inner.lock().unwrap();
        if g.frozen {
            return false;
        }
        g.frozen_head = g.lru_head;
        g.frozen_tail = g.lru_tail;
        g.lru_head = None;
        g.lru_tail = None;
        g.hash.clear();
        g.available = -1;
        g.frozen = true;
        true
    }

    /// Empties the cache, reattaching the frozen ring first if needed,
    /// and restores `available = capacity`.
    pub fn clear(&self) {
        let mut g = self.inner.lock().unwrap();
        if g.frozen {
            g.lru_head = g.frozen_head.take();
            g.lru_tail = g.frozen_tail.take();
            g.frozen = false;
        }
        g.drop_ring();
        g.hash.clear();
        g.items = 0;
        g.available = g.capacity;
    }

    /// Clears and bumps the generation; returns the new generation.
    pub fn reset(&self, capacity: i64) -> u32 {
        self.clear();
        let mut g = self.inner.lock().unwrap();
        g.capacity = capacity;
        g.available = capacity;
        g.generation = g.generation.wrapping_add(1);
        g.generation
    }

    /// Sets the capacity without thawing; the freezing peer re-enables
    /// the cache later by triggering a reset.
    pub fn set_capacity(&self, capacity: i64) {
        self.inner.lock().unwrap().capacity = capacity;
    }

    /// Element-wise max merge of migrated per-peer serials.
    pub fn merge_sync_vector(&self, other: &SyncVector) {
        let mut g = self.inner.lock().unwrap();
        let mut sync = g.sync;
        merge_sync(&mut sync, other);
        g.sync = sync;
    }

    pub fn sync_vector(&self) -> SyncVector {
        self.inner.lock().unwrap().sync
    }

    /// Structural invariants, used by the test suites: hash and ring are
    /// one-to-one, and the byte accounting balances when not frozen.
    pub fn check_invariants(&self) {
        let g = self.inner.lock().unwrap();
        let mut ring = 0usize;
        let mut bytes = 0i64;
        let mut cur = g.lru_head;
        let mut last = None;
        while let Some(idx) = cur {
            let e = g.entry(idx);
            assert_eq!(g.hash.get(&e.id), Some(&idx), "ring entry missing in hash");
            ring += 1;
            bytes += e.size as i64;
            last = Some(idx);
            cur = e.next;
        }
        assert_eq!(g.lru_tail, last, "tail does not terminate the ring");
        assert_eq!(g.hash.len(), ring, "hash and ring disagree");
        assert_eq!(g.items, ring);
        if !g.frozen {
            assert_eq!(
                g.available + bytes,
                g.capacity,
                "byte accounting out of balance"
            );
        }
    }
}

#[derive(Default)]
struct Registry {
    caches: Vec<(u64, u8, Weak<PixmapCache>)>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(Mutex::default)
}

/// Looks up or creates the cache `(client, id)`; clients of the same
/// remote party share one instance.
pub fn pixmap_cache_get(client: u64, id: u8, capacity: i64) -> Arc<PixmapCache> {
    let mut reg = registry().lock().unwrap();
    reg.caches.retain(|(_, _, weak)| weak.strong_count() > 0);
    for (c, i, weak) in &reg.caches {
        if *c == client && *i == id {
            if let Some(cache) = weak.upgrade() {
                return cache;
            }
        }
    }
    debug!(client, id, capacity, "creating pixmap cache");
    let cache = Arc::new(PixmapCache::new(client, id, capacity));
    reg.caches.push((client, id, Arc::downgrade(&cache)));
    cache
}
