//! Map heap objects — open addressing with tombstones.
//!
//! Each slot's `key` is either a live `Value`, or `undefined` marking a
//! free-or-tombstone slot, with the slot's `value` distinguishing which
//! (`false` = free, `true` = tombstone). Lookup probes linearly until it
//! hits a genuinely free slot;
//! a remembered tombstone is reused by the next `set` that probes past it,
//! which keeps long-lived maps from wasting slots after churn.
//!
//! Keys must be hashable (`Value::hash` returns `None` for lists and maps);
//! `get`/`set`/`remove` all reject an unhashable key with
//! `MapError::Unhashable` before doing any probing.

use crate::value::Value;
use pocket_core::pow2::ceil_pow2;

const MIN_CAPACITY: usize = 8;
const LOAD_FACTOR_NUM: usize = 3; // resize when count+1 > capacity * 3/4
const LOAD_FACTOR_DEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    Unhashable,
}

#[derive(Debug, Clone)]
enum Slot {
    Free,
    Tombstone,
    Occupied(Value, Value),
}

#[derive(Debug, Clone)]
pub struct PkMap {
    slots: Vec<Slot>,
    count: usize,
    tombstones: usize,
}

impl PkMap {
    pub fn new() -> Self {
        PkMap {
            slots: (0..MIN_CAPACITY).map(|_| Slot::Free).collect(),
            count: 0,
            tombstones: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn probe_for_get(&self, key: Value) -> Result<Option<usize>, MapError> {
        let hash = key.hash().ok_or(MapError::Unhashable)?;
        let mask = self.slots.len() - 1;
        let mut index = (hash as usize) & mask;
        for _ in 0..self.slots.len() {
            match &self.slots[index] {
                Slot::Free => return Ok(None),
                Slot::Tombstone => {}
                Slot::Occupied(k, _) if k.is_equal(key) => return Ok(Some(index)),
                Slot::Occupied(_, _) => {}
            }
            index = (index + 1) & mask;
        }
        Ok(None)
    }

    /// Probe for `set`: like `probe_for_get`, but remembers the first
    /// tombstone seen so the caller can reuse it instead of the eventual
    /// free slot.
    fn probe_for_set(&self, key: Value) -> Result<(Option<usize>, Option<usize>), MapError> {
        let hash = key.hash().ok_or(MapError::Unhashable)?;
        let mask = self.slots.len() - 1;
        let mut index = (hash as usize) & mask;
        let mut first_tombstone = None;
        for _ in 0..self.slots.len() {
            match &self.slots[index] {
                Slot::Free => return Ok((None, first_tombstone.or(Some(index)))),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) if k.is_equal(key) => return Ok((Some(index), None)),
                Slot::Occupied(_, _) => {}
            }
            index = (index + 1) & mask;
        }
        Ok((None, first_tombstone))
    }

    pub fn get(&self, key: Value) -> Result<Option<Value>, MapError> {
        match self.probe_for_get(key)? {
            Some(idx) => match &self.slots[idx] {
                Slot::Occupied(_, v) => Ok(Some(*v)),
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: Value) -> Result<bool, MapError> {
        Ok(self.probe_for_get(key)?.is_some())
    }

    pub fn set(&mut self, key: Value, value: Value) -> Result<(), MapError> {
        if (self.count + 1) * LOAD_FACTOR_DEN > self.slots.len() * LOAD_FACTOR_NUM {
            self.grow();
        }
        let (existing, free_or_tombstone) = self.probe_for_set(key)?;
        if let Some(idx) = existing {
            self.slots[idx] = Slot::Occupied(key, value);
            return Ok(());
        }
        let idx = free_or_tombstone.expect("table must have room after growth check");
        if matches!(self.slots[idx], Slot::Tombstone) {
            self.tombstones -= 1;
        }
        self.slots[idx] = Slot::Occupied(key, value);
        self.count += 1;
        Ok(())
    }

    pub fn remove(&mut self, key: Value) -> Result<Option<Value>, MapError> {
        let Some(idx) = self.probe_for_get(key)? else {
            return Ok(None);
        };
        let removed = match std::mem::replace(&mut self.slots[idx], Slot::Tombstone) {
            Slot::Occupied(_, v) => v,
            _ => unreachable!(),
        };
        self.count -= 1;
        self.tombstones += 1;
        self.maybe_shrink();
        Ok(Some(removed))
    }

    fn grow(&mut self) {
        let new_capacity = ceil_pow2(self.slots.len() * 2);
        self.rehash(new_capacity);
    }

    fn maybe_shrink(&mut self) {
        // Shrink to capacity/4 once load drops below 0.75/4.
        if self.slots.len() <= MIN_CAPACITY {
            return;
        }
        let threshold = (self.slots.len() * LOAD_FACTOR_NUM) / (LOAD_FACTOR_DEN * 4);
        if self.count < threshold {
            let new_capacity = (self.slots.len() / 4).max(MIN_CAPACITY);
            self.rehash(new_capacity);
        }
    }

    fn rehash(&mut self, new_capacity: usize) {
        let old_slots = std::mem::replace(
            &mut self.slots,
            (0..new_capacity).map(|_| Slot::Free).collect(),
        );
        self.count = 0;
        self.tombstones = 0;
        for slot in old_slots {
            if let Slot::Occupied(k, v) = slot {
                // Hashable by construction (it was inserted before), and
                // capacity is a power of two so masking is always valid.
                self.set(k, v).expect("previously-stored key must be hashable");
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied(k, v) => Some((*k, *v)),
            _ => None,
        })
    }
}

impl Default for PkMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(n: i32) -> Value {
        Value::int(n)
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut m = PkMap::new();
        m.set(k(1), k(100)).unwrap();
        assert_eq!(m.get(k(1)).unwrap(), Some(k(100)));
        assert_eq!(m.get(k(2)).unwrap(), None);
    }

    #[test]
    fn remove_then_reinsert() {
        let mut m = PkMap::new();
        m.set(k(1), k(10)).unwrap();
        m.set(k(2), k(20)).unwrap();
        m.set(k(3), k(30)).unwrap();
        m.remove(k(2)).unwrap();
        m.set(k(2), k(200)).unwrap();
        assert_eq!(m.get(k(1)).unwrap(), Some(k(10)));
        assert_eq!(m.get(k(2)).unwrap(), Some(k(200)));
        assert_eq!(m.get(k(3)).unwrap(), Some(k(30)));
        assert_eq!(m.count(), 3);
    }

    #[test]
    fn count_tracks_live_keys_through_churn() {
        let mut m = PkMap::new();
        for i in 0..50 {
            m.set(k(i), k(i)).unwrap();
        }
        assert_eq!(m.count(), 50);
        for i in 0..25 {
            m.remove(k(i)).unwrap();
        }
        assert_eq!(m.count(), 25);
    }

    #[test]
    fn load_factor_never_exceeds_75_percent() {
        let mut m = PkMap::new();
        for i in 0..200 {
            m.set(k(i), k(i)).unwrap();
            assert!(m.count() * 4 <= m.capacity() * 3);
        }
    }

    #[test]
    fn resizes_on_growth() {
        let mut m = PkMap::new();
        let initial_capacity = m.capacity();
        for i in 0..100 {
            m.set(k(i), k(i)).unwrap();
        }
        assert!(m.capacity() > initial_capacity);
    }
}
