//! Per-client palette cache.
//!
//! A small id-keyed cache with byte-budgeted LRU eviction. The caller
//! learns whether an add actually inserted (so it can ask the client to
//! cache the palette) and which ids were evicted (so it can invalidate
//! them on the client).

use std::collections::HashMap;

/// Capacity budget of one client's palette cache.
pub const CLIENT_PALETTE_CACHE_SIZE: i64 = 1024;

#[derive(Debug)]
struct Entry {
    size: u64,
}

#[derive(Debug)]
pub struct PaletteCache {
    entries: HashMap<u64, Entry>,
    /// Most recently used last.
    order: Vec<u64>,
    capacity: i64,
    available: i64,
}

impl Default for PaletteCache {
    fn default() -> Self {
        Self::new(CLIENT_PALETTE_CACHE_SIZE)
    }
}

impl PaletteCache {
    pub fn new(capacity: i64) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            capacity,
            available: capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used(&self) -> i64 {
        self.capacity - self.available
    }

    /// Looks `id` up, refreshing its LRU position on a hit.
    pub fn find(&mut self, id: u64) -> bool {
        if !self.entries.contains_key(&id) {
            return false;
        }
        self.touch(id);
        true
    }

    /// Inserts `id`, evicting least-recently-used entries until `size`
    /// fits. Returns whether the entry was inserted so the caller can set
    /// the cache-me wire flag; evicted ids land in `evicted`.
    pub fn add(&mut self, id: u64, size: u64, evicted: &mut Vec<u64>) -> bool {
        if size as i64 > self.capacity {
            return false;
        }
        if self.entries.contains_key(&id) {
            self.touch(id);
            return false;
        }
        while self.available < size as i64 {
            let oldest = self.order.first().copied().expect("budget exceeds capacity");
            let e = self.entries.remove(&oldest).expect("ordered entry exists");
            self.order.remove(0);
            self.available += e.size as i64;
            evicted.push(oldest);
        }
        self.entries.insert(id, Entry { size });
        self.order.push(id);
        self.available -= size as i64;
        true
    }

    /// Empties the cache and resets the byte budget.
    pub fn reset(&mut self, capacity: i64) {
        self.entries.clear();
        self.order.clear();
        self.capacity = capacity;
        self.available = capacity;
    }

    fn touch(&mut self, id: u64) {
        if let Some(pos) = self.order.iter().position(|&o| o == id) {
            self.order.remove(pos);
            self.order.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_find() {
        let mut c = PaletteCache::new(16);
        let mut ev = Vec::new();
        assert!(c.add(1, 1, &mut ev));
        assert!(c.find(1));
        assert!(!c.find(2));
        // Re-adding an existing id is not a fresh insert.
        assert!(!c.add(1, 1, &mut ev));
    }

    #[test]
    fn eviction_follows_lru_order() {
        let mut c = PaletteCache::new(3);
        let mut ev = Vec::new();
        assert!(c.add(1, 1, &mut ev));
        assert!(c.add(2, 1, &mut ev));
        assert!(c.add(3, 1, &mut ev));
        // Touch 1 so 2 becomes the eviction candidate.
        assert!(c.find(1));
        assert!(c.add(4, 1, &mut ev));
        assert_eq!(ev, vec![2]);
        assert!(c.find(1));
        assert!(!c.find(2));
    }

    #[test]
    fn used_bytes_never_exceed_capacity() {
        let mut c = PaletteCache::new(CLIENT_PALETTE_CACHE_SIZE);
        let mut ev = Vec::new();
        for id in 0..4096u64 {
            c.add(id, 1, &mut ev);
            assert!(c.used() <= CLIENT_PALETTE_CACHE_SIZE);
        }
    }

    #[test]
    fn oversized_entry_is_refused() {
        let mut c = PaletteCache::new(8);
        let mut ev = Vec::new();
        assert!(!c.add(1, 9, &mut ev));
        assert!(ev.is_empty());
        assert!(c.is_empty());
    }

    #[test]
    fn reset_empties_everything() {
        let mut c = PaletteCache::new(16);
        let mut ev = Vec::new();
        c.add(1, 4, &mut ev);
        c.reset(32);
        assert!(c.is_empty());
        assert_eq!(c.used(), 0);
    }
}
