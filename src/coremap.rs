//! Open-addressed hash map with entry-embedded hashes.
//!
//! Callers supply the 32-bit hash alongside each operation and a
//! closure deciding entry equality, which allows lookups keyed by an
//! external key shape without constructing a full entry first.

/// Initial (and minimum) bucket count. The table never shrinks below
/// this floor.
const INITIAL_BUCKETS: usize = 64;

enum Slot<E> {
    Empty,
    Tombstone,
    Full { hash: u32, entry: E },
}

impl<E> Slot<E> {
    fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }
}

/// Generic open-addressed map: power-of-two bucket count, linear
/// probing, each occupied slot carrying the entry's 32-bit hash.
///
/// Duplicate keys are explicit: [`CoreMap::put`] replaces an existing
/// entry with the same key and returns it, while [`CoreMap::add`]
/// inserts a second entry under the same key.
pub struct CoreMap<E> {
    slots: Vec<Slot<E>>,
    len: usize,
    used: usize,
}

impl<E> Default for CoreMap<E> {
    fn default() -> Self {
        CoreMap::new()
    }
}

impl<E> CoreMap<E> {
    pub fn new() -> CoreMap<E> {
        let mut slots = Vec::with_capacity(INITIAL_BUCKETS);
        slots.resize_with(INITIAL_BUCKETS, || Slot::Empty);
        CoreMap {
            slots,
            len: 0,
            used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Find the first entry with `hash` accepted by `matches`.
    pub fn get(&self, hash: u32, mut matches: impl FnMut(&E) -> bool) -> Option<&E> {
        let mask = self.slots.len() - 1;
        let mut idx = (hash as usize) & mask;
        loop {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Full { hash: h, entry } => {
                    if *h == hash && matches(entry) {
                        return Some(entry);
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Insert `entry`, replacing and returning any existing entry with
    /// the same key (as decided by `same_key`).
    pub fn put(&mut self, hash: u32, entry: E, mut same_key: impl FnMut(&E) -> bool) -> Option<E> {
        let mask = self.slots.len() - 1;
        let mut idx = (hash as usize) & mask;
        loop {
            match &mut self.slots[idx] {
                Slot::Empty => break,
                Slot::Tombstone => {}
                Slot::Full { hash: h, entry: e } => {
                    if *h == hash && same_key(e) {
                        return Some(std::mem::replace(e, entry));
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
        self.insert_slot(hash, entry);
        self.maybe_grow();
        None
    }

    /// Insert `entry` unconditionally; an entry with the same key may
    /// already be present, and both will be found by probing.
    pub fn add(&mut self, hash: u32, entry: E) {
        self.insert_slot(hash, entry);
        self.maybe_grow();
    }

    /// Remove and return the first entry with `hash` accepted by
    /// `matches`.
    pub fn remove(&mut self, hash: u32, mut matches: impl FnMut(&E) -> bool) -> Option<E> {
        let mask = self.slots.len() - 1;
        let mut idx = (hash as usize) & mask;
        loop {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Full { hash: h, entry } => {
                    if *h == hash && matches(entry) {
                        let slot = std::mem::replace(&mut self.slots[idx], Slot::Tombstone);
                        self.len -= 1;
                        self.maybe_shrink();
                        match slot {
                            Slot::Full { entry, .. } => return Some(entry),
                            _ => unreachable!(),
                        }
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Full { entry, .. } => Some(entry),
            _ => None,
        })
    }

    fn insert_slot(&mut self, hash: u32, entry: E) {
        let mask = self.slots.len() - 1;
        let mut idx = (hash as usize) & mask;
        loop {
            match &self.slots[idx] {
                Slot::Empty => {
                    self.used += 1;
                    self.slots[idx] = Slot::Full { hash, entry };
                    self.len += 1;
                    return;
                }
                Slot::Tombstone => {
                    self.slots[idx] = Slot::Full { hash, entry };
                    self.len += 1;
                    return;
                }
                Slot::Full { .. } => idx = (idx + 1) & mask,
            }
        }
    }

    // Grow at >= 80% occupancy (tombstones count against the table).
    fn maybe_grow(&mut self) {
        if self.used * 5 >= self.slots.len() * 4 {
            self.rehash(self.slots.len() * 2);
        }
    }

    // Shrink at <= 16% live entries, never below the initial floor.
    fn maybe_shrink(&mut self) {
        if self.slots.len() > INITIAL_BUCKETS && self.len * 100 <= self.slots.len() * 16 {
            let mut target = self.slots.len() / 2;
            while target > INITIAL_BUCKETS && self.len * 100 <= target * 16 {
                target /= 2;
            }
            self.rehash(target.max(INITIAL_BUCKETS));
        }
    }

    fn rehash(&mut self, new_size: usize) {
        let mut old = Vec::with_capacity(new_size);
        old.resize_with(new_size, || Slot::Empty);
        std::mem::swap(&mut self.slots, &mut old);
        self.len = 0;
        self.used = 0;
        for slot in old {
            if let Slot::Full { hash, entry } = slot {
                self.insert_slot(hash, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ent {
        key: u32,
        val: &'static str,
    }

    fn h(key: u32) -> u32 {
        key.wrapping_mul(0x9e3779b9)
    }

    #[test]
    fn test_put_get_replace() {
        let mut map = CoreMap::new();
        assert!(map
            .put(h(1), Ent { key: 1, val: "a" }, |e| e.key == 1)
            .is_none());
        let old = map.put(h(1), Ent { key: 1, val: "b" }, |e| e.key == 1);
        assert_eq!(old.unwrap().val, "a");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(h(1), |e| e.key == 1).unwrap().val, "b");
        assert!(map.get(h(2), |e| e.key == 2).is_none());
    }

    #[test]
    fn test_add_allows_duplicates() {
        let mut map = CoreMap::new();
        map.add(h(7), Ent { key: 7, val: "x" });
        map.add(h(7), Ent { key: 7, val: "y" });
        assert_eq!(map.len(), 2);
        let vals: Vec<_> = map.iter().filter(|e| e.key == 7).map(|e| e.val).collect();
        assert_eq!(vals.len(), 2);
    }

    #[test]
    fn test_remove() {
        let mut map = CoreMap::new();
        map.add(h(3), Ent { key: 3, val: "z" });
        assert_eq!(map.remove(h(3), |e| e.key == 3).unwrap().val, "z");
        assert!(map.remove(h(3), |e| e.key == 3).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_growth_keeps_entries_reachable() {
        let mut map = CoreMap::new();
        for key in 0..1000u32 {
            map.add(h(key), Ent { key, val: "v" });
        }
        assert_eq!(map.len(), 1000);
        for key in 0..1000u32 {
            assert!(map.get(h(key), |e| e.key == key).is_some(), "key {key}");
        }
    }

    #[test]
    fn test_shrink_after_mass_removal() {
        let mut map = CoreMap::new();
        for key in 0..1000u32 {
            map.add(h(key), Ent { key, val: "v" });
        }
        for key in 0..995u32 {
            map.remove(h(key), |e| e.key == key);
        }
        assert_eq!(map.len(), 5);
        for key in 995..1000u32 {
            assert!(map.get(h(key), |e| e.key == key).is_some());
        }
    }
}
