//! Per-node vbucket-aware item store.
//!
//! A node keeps one [`VBucketStore`] holding every item it owns or
//! replicates. All mutations assign a fresh CAS from a node-wide counter and
//! advance the (uuid, seqno) coordinates of the item's vbucket under the
//! same lock, so concurrent connections observe both as a single step.
//!
//! Mutations never call out while the lock is held. Each operation returns
//! the [`StoreEvent`]s it produced inside an [`Applied`] and the caller
//! (see [`super::fabric`]) propagates them to replicas and the persisted
//! copy.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::error::ErrorCode;
use crate::core::time::{Clock, UnixTime};
use crate::storage::item::{clamp_lock_time, Item, KeySpec};

/// Position of a vbucket's history on one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct VBucketCoordinates {
    pub uuid: u64,
    pub seqno: u64,
}

impl VBucketCoordinates {
    pub const fn new(uuid: u64, seqno: u64) -> Self {
        Self { uuid, seqno }
    }

    /// Coordinates of a freshly (re)assigned vbucket.
    pub const fn fresh(uuid: u64) -> Self {
        Self { uuid, seqno: 1 }
    }
}

/// Change produced by a store operation, to be mirrored elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Mutated {
        item: Item,
        coords: VBucketCoordinates,
    },
    Deleted {
        key_spec: KeySpec,
        coords: VBucketCoordinates,
    },
}

impl StoreEvent {
    pub fn key_spec(&self) -> &KeySpec {
        match self {
            Self::Mutated { item, .. } => &item.key_spec,
            Self::Deleted { key_spec, .. } => key_spec,
        }
    }

    pub fn coords(&self) -> VBucketCoordinates {
        match self {
            Self::Mutated { coords, .. } | Self::Deleted { coords, .. } => *coords,
        }
    }
}

/// Result of a store operation plus the events it generated.
#[derive(Debug)]
pub struct Applied<T> {
    pub value: T,
    pub events: Vec<StoreEvent>,
}

impl<T> Applied<T> {
    fn new(value: T, events: Vec<StoreEvent>) -> Self {
        Self { value, events }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Applied<U> {
        Applied {
            value: f(self.value),
            events: self.events,
        }
    }
}

/// Successful mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutation {
    pub cas: u64,
    pub coords: VBucketCoordinates,
}

pub type MutationStatus = Result<Mutation, ErrorCode>;

/// Outcome of incr/decr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub value: u64,
    pub mutation: Mutation,
}

/// Parameters of an incr/decr request. `expiry` is absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArithmeticSpec {
    pub increment: bool,
    pub delta: u64,
    /// Seed used when the key is missing. `None` forbids creation.
    pub initial: Option<u64>,
    pub expiry: u32,
    pub cas: u64,
}

struct StoreInner {
    items: HashMap<KeySpec, Item>,
    coords: Vec<VBucketCoordinates>,
    history: HashMap<(u16, u64), VBucketCoordinates>,
    cas_counter: u64,
}

impl StoreInner {
    fn next_cas(&mut self) -> u64 {
        self.cas_counter += 1;
        self.cas_counter
    }

    fn incr_coords(&mut self, vbucket: u16) -> VBucketCoordinates {
        match self.coords.get_mut(vbucket as usize) {
            Some(c) => {
                c.seqno += 1;
                *c
            }
            None => VBucketCoordinates::default(),
        }
    }

    /// Live item for `ks`, purging it first if it has expired.
    fn live(&mut self, ks: &KeySpec, now: UnixTime, events: &mut Vec<StoreEvent>) -> Option<&mut Item> {
        let expired = self.items.get(ks)?.is_expired(now);
        if expired {
            self.items.remove(ks);
            let coords = self.incr_coords(ks.vbucket);
            tracing::trace!(key = %ks, "item expired");
            events.push(StoreEvent::Deleted {
                key_spec: ks.clone(),
                coords,
            });
            return None;
        }
        self.items.get_mut(ks)
    }

    /// Assign a new CAS, advance coordinates and put.
    fn store(&mut self, mut item: Item, events: &mut Vec<StoreEvent>) -> Mutation {
        item.cas = self.next_cas();
        item.lock_expiry = 0;
        let coords = self.incr_coords(item.key_spec.vbucket);
        let mutation = Mutation {
            cas: item.cas,
            coords,
        };
        events.push(StoreEvent::Mutated {
            item: item.clone(),
            coords,
        });
        self.items.insert(item.key_spec.clone(), item);
        mutation
    }

    fn replace(&mut self, item: Item, now: UnixTime, events: &mut Vec<StoreEvent>) -> MutationStatus {
        let old = self.live(&item.key_spec, now, events).ok_or(ErrorCode::KeyEnoent)?;
        if item.cas != 0 && item.cas != old.cas {
            return Err(ErrorCode::KeyEexists);
        }
        if !old.ensure_unlocked(item.cas, now) {
            return Err(ErrorCode::KeyEexists);
        }
        Ok(self.store(item, events))
    }

    fn concat(
        &mut self,
        item: Item,
        prepend: bool,
        max_len: usize,
        now: UnixTime,
        events: &mut Vec<StoreEvent>,
    ) -> MutationStatus {
        let old = self.live(&item.key_spec, now, events).ok_or(ErrorCode::KeyEnoent)?;
        if item.cas != 0 && item.cas != old.cas {
            return Err(ErrorCode::KeyEexists);
        }
        if old.value.len() + item.value.len() > max_len {
            return Err(ErrorCode::E2big);
        }
        if !old.ensure_unlocked(item.cas, now) {
            return Err(ErrorCode::KeyEexists);
        }
        let mut value = Vec::with_capacity(old.value.len() + item.value.len());
        if prepend {
            value.extend_from_slice(&item.value);
            value.extend_from_slice(&old.value);
        } else {
            value.extend_from_slice(&old.value);
            value.extend_from_slice(&item.value);
        }
        let mut merged = old.clone();
        merged.value = value.into();
        Ok(self.store(merged, events))
    }
}

/// Item store for one node.
pub struct VBucketStore {
    inner: Mutex<StoreInner>,
    clock: Arc<dyn Clock>,
}

impl VBucketStore {
    /// Create a store with one coordinate slot per entry of `uuids`.
    pub fn new(uuids: &[u64], clock: Arc<dyn Clock>) -> Self {
        let coords: Vec<VBucketCoordinates> =
            uuids.iter().map(|u| VBucketCoordinates::fresh(*u)).collect();
        let history = coords
            .iter()
            .enumerate()
            .map(|(vb, c)| ((vb as u16, c.uuid), *c))
            .collect();
        Self {
            inner: Mutex::new(StoreInner {
                items: HashMap::new(),
                coords,
                history,
                cas_counter: 0,
            }),
            clock,
        }
    }

    pub fn now(&self) -> UnixTime {
        self.clock.now()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Read an item, expiring it lazily.
    pub fn get(&self, ks: &KeySpec) -> Applied<Option<Item>> {
        let now = self.now();
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        let found = inner.live(ks, now, &mut events).map(|i| i.clone());
        Applied::new(found, events)
    }

    /// Store only if absent.
    pub fn add(&self, item: Item) -> Applied<MutationStatus> {
        let now = self.now();
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        let exists = inner.live(&item.key_spec, now, &mut events).is_some();
        let status = if exists || item.cas != 0 {
            Err(ErrorCode::KeyEexists)
        } else {
            Ok(inner.store(item, &mut events))
        };
        Applied::new(status, events)
    }

    /// Store only if present, honoring CAS and locks.
    pub fn replace(&self, item: Item) -> Applied<MutationStatus> {
        let now = self.now();
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        let status = inner.replace(item, now, &mut events);
        Applied::new(status, events)
    }

    /// Upsert. A non-zero CAS makes this a replace.
    pub fn set(&self, item: Item) -> Applied<MutationStatus> {
        let now = self.now();
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        let status = if item.cas != 0 {
            inner.replace(item, now, &mut events)
        } else {
            let locked = inner
                .live(&item.key_spec, now, &mut events)
                .is_some_and(|old| old.is_locked(now));
            if locked {
                Err(ErrorCode::KeyEexists)
            } else {
                Ok(inner.store(item, &mut events))
            }
        };
        Applied::new(status, events)
    }

    pub fn delete(&self, ks: &KeySpec, cas: u64) -> Applied<MutationStatus> {
        let now = self.now();
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        let removed_cas = match inner.live(ks, now, &mut events) {
            None => Err(ErrorCode::KeyEnoent),
            Some(old) => {
                if !old.ensure_unlocked(cas, now) {
                    Err(ErrorCode::Etmpfail)
                } else if cas != 0 && cas != old.cas {
                    Err(ErrorCode::KeyEexists)
                } else {
                    Ok(old.cas)
                }
            }
        };
        let status = removed_cas.map(|removed_cas| {
            inner.items.remove(ks);
            let coords = inner.incr_coords(ks.vbucket);
            events.push(StoreEvent::Deleted {
                key_spec: ks.clone(),
                coords,
            });
            Mutation {
                cas: removed_cas,
                coords,
            }
        });
        Applied::new(status, events)
    }

    /// Concatenate after the existing value. Flags and expiry are kept.
    pub fn append(&self, item: Item, max_len: usize) -> Applied<MutationStatus> {
        self.concat(item, false, max_len)
    }

    /// Concatenate before the existing value. Flags and expiry are kept.
    pub fn prepend(&self, item: Item, max_len: usize) -> Applied<MutationStatus> {
        self.concat(item, true, max_len)
    }

    /// The merged value may not exceed `max_len` bytes.
    fn concat(&self, item: Item, prepend: bool, max_len: usize) -> Applied<MutationStatus> {
        let now = self.now();
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        let status = inner.concat(item, prepend, max_len, now, &mut events);
        Applied::new(status, events)
    }

    /// Get-and-lock. Returns the locked item carrying the CAS that unlocks it.
    pub fn lock(&self, ks: &KeySpec, lock_time: u32) -> Applied<Result<Item, ErrorCode>> {
        let now = self.now();
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        let result = match inner.live(ks, now, &mut events) {
            None => Err(ErrorCode::KeyEnoent),
            Some(old) if old.is_locked(now) => Err(ErrorCode::Etmpfail),
            Some(old) => {
                let current = old.clone();
                inner.store(current, &mut events);
                // store() clears the lock, set it on the stored copy
                let deadline = now.add_secs(clamp_lock_time(lock_time)).secs();
                match inner.items.get_mut(ks) {
                    Some(stored) => {
                        stored.lock_expiry = deadline;
                        Ok(stored.clone())
                    }
                    None => Err(ErrorCode::Einternal),
                }
            }
        };
        Applied::new(result, events)
    }

    pub fn unlock(&self, ks: &KeySpec, cas: u64) -> Applied<Result<(), ErrorCode>> {
        let now = self.now();
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        let result = match inner.live(ks, now, &mut events) {
            None => Err(ErrorCode::KeyEnoent),
            Some(old) if !old.is_locked(now) || old.cas != cas => Err(ErrorCode::Etmpfail),
            Some(old) => {
                old.lock_expiry = 0;
                Ok(())
            }
        };
        Applied::new(result, events)
    }

    /// Update an item's expiry. `expiry` is absolute.
    pub fn touch(&self, ks: &KeySpec, expiry: u32) -> Applied<Result<Item, ErrorCode>> {
        let now = self.now();
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        let touched = match inner.live(ks, now, &mut events) {
            None => Err(ErrorCode::KeyEnoent),
            Some(old) if old.is_locked(now) => Err(ErrorCode::Etmpfail),
            Some(old) => {
                old.expiry = expiry;
                Ok(old.clone())
            }
        };
        let result = touched.map(|item| {
            let coords = inner.incr_coords(ks.vbucket);
            events.push(StoreEvent::Mutated {
                item: item.clone(),
                coords,
            });
            item
        });
        Applied::new(result, events)
    }

    /// Increment or decrement a decimal counter, creating it when allowed.
    pub fn arithmetic(&self, ks: &KeySpec, spec: ArithmeticSpec) -> Applied<Result<Counter, ErrorCode>> {
        let now = self.now();
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        let result = match inner.live(ks, now, &mut events) {
            None => match spec.initial {
                None => Err(ErrorCode::KeyEnoent),
                Some(_) if spec.cas != 0 => Err(ErrorCode::KeyEnoent),
                Some(initial) => {
                    let item = Item::new(ks.clone(), 0, spec.expiry, initial.to_string(), 0);
                    let mutation = inner.store(item, &mut events);
                    Ok(Counter {
                        value: initial,
                        mutation,
                    })
                }
            },
            Some(old) if old.is_locked(now) => Err(ErrorCode::Etmpfail),
            Some(old) if spec.cas != 0 && spec.cas != old.cas => Err(ErrorCode::KeyEexists),
            Some(old) => match apply_delta(&old.value, &spec) {
                Err(code) => Err(code),
                Ok(value) => {
                    let mut next = old.clone();
                    next.value = value.to_string().into();
                    if spec.expiry > 0 {
                        next.expiry = spec.expiry;
                    }
                    let mutation = inner.store(next, &mut events);
                    Ok(Counter { value, mutation })
                }
            },
        };
        Applied::new(result, events)
    }

    /// Apply a mutation received from the vbucket's active node.
    pub fn force_mutation(&self, item: Item, coords: VBucketCoordinates) -> Applied<()> {
        let mut inner = self.inner.lock();
        inner.seek(item.key_spec.vbucket, coords);
        let event = StoreEvent::Mutated {
            item: item.clone(),
            coords,
        };
        inner.items.insert(item.key_spec.clone(), item);
        Applied::new((), vec![event])
    }

    /// Apply a deletion received from the vbucket's active node.
    pub fn force_delete(&self, ks: &KeySpec, coords: VBucketCoordinates) -> Applied<()> {
        let mut inner = self.inner.lock();
        inner.seek(ks.vbucket, coords);
        inner.items.remove(ks);
        let event = StoreEvent::Deleted {
            key_spec: ks.clone(),
            coords,
        };
        Applied::new((), vec![event])
    }

    /// Install new uuids for every vbucket. Previous coordinates stay queryable.
    pub fn update_coords(&self, uuids: &[u64]) {
        let mut inner = self.inner.lock();
        let StoreInner { coords, history, .. } = &mut *inner;
        for (vb, (slot, uuid)) in coords.iter_mut().zip(uuids).enumerate() {
            history.insert((vb as u16, slot.uuid), *slot);
            *slot = VBucketCoordinates::fresh(*uuid);
            history.insert((vb as u16, slot.uuid), *slot);
        }
    }

    pub fn current_coords(&self, vbucket: u16) -> VBucketCoordinates {
        let inner = self.inner.lock();
        inner.coords.get(vbucket as usize).copied().unwrap_or_default()
    }

    /// Coordinates recorded for `uuid`, live if it is the current one.
    pub fn find_coords(&self, vbucket: u16, uuid: u64) -> Option<VBucketCoordinates> {
        let inner = self.inner.lock();
        match inner.coords.get(vbucket as usize) {
            Some(current) if current.uuid == uuid => Some(*current),
            _ => inner.history.get(&(vbucket, uuid)).copied(),
        }
    }

    /// Raw read without expiry processing.
    pub fn peek(&self, ks: &KeySpec) -> Option<Item> {
        self.inner.lock().items.get(ks).cloned()
    }

    /// Raw write that bypasses CAS, coordinates and propagation.
    pub fn put_raw(&self, item: Item) {
        self.inner.lock().items.insert(item.key_spec.clone(), item);
    }

    /// Raw removal that bypasses coordinates and propagation.
    pub fn remove_raw(&self, ks: &KeySpec) -> Option<Item> {
        self.inner.lock().items.remove(ks)
    }

    /// Snapshot of all unexpired items.
    pub fn live_items(&self) -> Vec<Item> {
        let now = self.now();
        self.inner
            .lock()
            .items
            .values()
            .filter(|i| !i.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) {
        self.inner.lock().items.clear();
    }
}

impl StoreInner {
    /// Adopt the active node's coordinates for a vbucket.
    fn seek(&mut self, vbucket: u16, coords: VBucketCoordinates) {
        if let Some(slot) = self.coords.get_mut(vbucket as usize) {
            if slot.uuid != coords.uuid {
                self.history.insert((vbucket, slot.uuid), *slot);
            }
            *slot = coords;
        }
    }
}

/// Parse a stored counter and apply a delta without wrapping.
fn apply_delta(current: &[u8], spec: &ArithmeticSpec) -> Result<u64, ErrorCode> {
    let text = std::str::from_utf8(current).map_err(|_| ErrorCode::DeltaBadval)?;
    let value: u64 = text.trim().parse().map_err(|_| ErrorCode::DeltaBadval)?;
    let next = if spec.increment {
        value.checked_add(spec.delta)
    } else {
        value.checked_sub(spec.delta)
    };
    next.ok_or(ErrorCode::DeltaBadval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::SystemClock;

    fn store() -> (VBucketStore, Arc<SystemClock>) {
        let clock = Arc::new(SystemClock::new());
        (VBucketStore::new(&[11, 22, 33, 44], clock.clone()), clock)
    }

    fn item(key: &str, value: &str) -> Item {
        Item::new(KeySpec::new(key.to_string(), 1), 0, 0, value.to_string(), 0)
    }

    fn with_cas(mut it: Item, cas: u64) -> Item {
        it.cas = cas;
        it
    }

    #[test]
    fn test_cas_strictly_increases() {
        let (s, _) = store();
        let a = s.set(item("a", "1")).value.unwrap();
        let b = s.set(item("b", "1")).value.unwrap();
        let c = s.set(item("a", "2")).value.unwrap();
        assert!(a.cas < b.cas && b.cas < c.cas);
        assert_eq!(s.get(&KeySpec::new("a", 1)).value.unwrap().cas, c.cas);
    }

    #[test]
    fn test_seqno_starts_after_one() {
        let (s, _) = store();
        let m = s.set(item("a", "1")).value.unwrap();
        assert_eq!(m.coords, VBucketCoordinates::new(22, 2));
        let m = s.delete(&KeySpec::new("a", 1), 0).value.unwrap();
        assert_eq!(m.coords.seqno, 3);
    }

    #[test]
    fn test_add_twice() {
        let (s, _) = store();
        assert!(s.add(item("k", "v")).value.is_ok());
        assert_eq!(s.add(item("k", "v")).value, Err(ErrorCode::KeyEexists));
        assert_eq!(
            s.add(with_cas(item("other", "v"), 5)).value,
            Err(ErrorCode::KeyEexists)
        );
    }

    #[test]
    fn test_replace_and_delete_with_stale_cas() {
        let (s, _) = store();
        let m = s.set(item("k", "v")).value.unwrap();
        assert_eq!(
            s.replace(with_cas(item("k", "x"), m.cas + 100)).value,
            Err(ErrorCode::KeyEexists)
        );
        assert_eq!(
            s.delete(&KeySpec::new("k", 1), m.cas + 100).value,
            Err(ErrorCode::KeyEexists)
        );
        assert_eq!(s.get(&KeySpec::new("k", 1)).value.unwrap().value, "v");
        assert_eq!(s.replace(item("missing", "x")).value, Err(ErrorCode::KeyEnoent));
    }

    #[test]
    fn test_append_prepend() {
        let (s, _) = store();
        let m0 = s.set(item("k", "M")).value.unwrap();
        let m1 = s.append(item("k", "X"), 1024).value.unwrap();
        let m2 = s.prepend(item("k", "Y"), 1024).value.unwrap();
        assert!(m0.cas < m1.cas && m1.cas < m2.cas);
        assert_eq!(s.get(&KeySpec::new("k", 1)).value.unwrap().value, "YMX");
        assert_eq!(s.append(item("nope", "X"), 1024).value, Err(ErrorCode::KeyEnoent));
    }

    #[test]
    fn test_concat_checks_merged_length() {
        let (s, _) = store();
        let m = s.set(item("k", "1234")).value.unwrap();
        let refused = s.append(item("k", "567"), 6);
        assert_eq!(refused.value, Err(ErrorCode::E2big));
        assert!(refused.events.is_empty());
        assert_eq!(s.prepend(item("k", "0"), 5).value.map(|_| ()), Ok(()));

        let stored = s.get(&KeySpec::new("k", 1)).value.unwrap();
        assert_eq!(stored.value, "01234");
        assert!(stored.cas > m.cas);
    }

    #[test]
    fn test_lock_blocks_set_until_cas() {
        let (s, _) = store();
        s.set(item("k", "v"));
        let ks = KeySpec::new("k", 1);
        let locked = s.lock(&ks, 0).value.unwrap();
        assert!(locked.lock_expiry > 0);
        assert_eq!(s.lock(&ks, 5).value, Err(ErrorCode::Etmpfail));
        assert_eq!(s.set(item("k", "x")).value, Err(ErrorCode::KeyEexists));
        assert_eq!(s.delete(&ks, 0).value, Err(ErrorCode::Etmpfail));
        assert!(s.set(with_cas(item("k", "x"), locked.cas)).value.is_ok());
        let now = s.now();
        assert!(!s.get(&ks).value.unwrap().is_locked(now));
    }

    #[test]
    fn test_unlock() {
        let (s, _) = store();
        let ks = KeySpec::new("k", 1);
        assert_eq!(s.unlock(&ks, 1).value, Err(ErrorCode::KeyEnoent));
        let m = s.set(item("k", "v")).value.unwrap();
        assert_eq!(s.unlock(&ks, m.cas).value, Err(ErrorCode::Etmpfail));
        let locked = s.lock(&ks, 10).value.unwrap();
        assert_eq!(s.unlock(&ks, locked.cas + 1).value, Err(ErrorCode::Etmpfail));
        assert!(s.unlock(&ks, locked.cas).value.is_ok());
        assert!(s.set(item("k", "x")).value.is_ok());
    }

    #[test]
    fn test_lock_lapses_with_time() {
        let (s, clock) = store();
        s.set(item("k", "v"));
        let ks = KeySpec::new("k", 1);
        s.lock(&ks, 2);
        clock.time_travel(5);
        assert!(s.set(item("k", "x")).value.is_ok());
    }

    #[test]
    fn test_lazy_expiry_emits_delete() {
        let (s, clock) = store();
        let now = s.now().secs();
        let mut it = item("k", "v");
        it.expiry = now + 10;
        s.set(it);
        clock.time_travel(11);
        let got = s.get(&KeySpec::new("k", 1));
        assert!(got.value.is_none());
        assert!(matches!(got.events.as_slice(), [StoreEvent::Deleted { .. }]));
        assert!(s.is_empty());
    }

    #[test]
    fn test_touch_sets_expiry() {
        let (s, _) = store();
        s.set(item("k", "v"));
        let ks = KeySpec::new("k", 1);
        let touched = s.touch(&ks, 12345).value.unwrap();
        assert_eq!(touched.expiry, 12345);
        assert_eq!(s.touch(&KeySpec::new("x", 1), 5).value, Err(ErrorCode::KeyEnoent));
    }

    #[test]
    fn test_arithmetic() {
        let (s, _) = store();
        let ks = KeySpec::new("n", 1);
        let spec = ArithmeticSpec {
            increment: true,
            delta: 5,
            initial: None,
            expiry: 0,
            cas: 0,
        };
        assert_eq!(s.arithmetic(&ks, spec).value, Err(ErrorCode::KeyEnoent));

        let create = ArithmeticSpec {
            initial: Some(10),
            ..spec
        };
        assert_eq!(s.arithmetic(&ks, create).value.unwrap().value, 10);
        assert_eq!(s.arithmetic(&ks, create).value.unwrap().value, 15);

        let down = ArithmeticSpec {
            increment: false,
            delta: 20,
            ..spec
        };
        assert_eq!(s.arithmetic(&ks, down).value, Err(ErrorCode::DeltaBadval));
        assert_eq!(s.get(&ks).value.unwrap().value, "15");
    }

    #[test]
    fn test_arithmetic_rejects_overflow_and_text() {
        let (s, _) = store();
        s.set(item("big", &u64::MAX.to_string()));
        s.set(item("txt", "abc"));
        let spec = ArithmeticSpec {
            increment: true,
            delta: 1,
            initial: None,
            expiry: 0,
            cas: 0,
        };
        assert_eq!(
            s.arithmetic(&KeySpec::new("big", 1), spec).value,
            Err(ErrorCode::DeltaBadval)
        );
        assert_eq!(
            s.arithmetic(&KeySpec::new("txt", 1), spec).value,
            Err(ErrorCode::DeltaBadval)
        );
    }

    #[test]
    fn test_coordinate_history() {
        let (s, _) = store();
        s.set(item("k", "v"));
        let before = s.current_coords(1);
        assert_eq!(before, VBucketCoordinates::new(22, 2));
        s.update_coords(&[111, 222, 333, 444]);
        assert_eq!(s.current_coords(1), VBucketCoordinates::fresh(222));
        assert_eq!(s.find_coords(1, 22), Some(before));
        assert_eq!(s.find_coords(1, 222), Some(VBucketCoordinates::fresh(222)));
        assert_eq!(s.find_coords(1, 999), None);
    }

    #[test]
    fn test_force_mutation_adopts_coords() {
        let (s, _) = store();
        let coords = VBucketCoordinates::new(77, 40);
        let mut it = item("k", "v");
        it.cas = 99;
        let applied = s.force_mutation(it, coords);
        assert_eq!(applied.events.len(), 1);
        assert_eq!(s.current_coords(1), coords);
        assert_eq!(s.find_coords(1, 22), Some(VBucketCoordinates::fresh(22)));
        assert_eq!(s.peek(&KeySpec::new("k", 1)).unwrap().cas, 99);
        s.force_delete(&KeySpec::new("k", 1), VBucketCoordinates::new(77, 41));
        assert!(s.peek(&KeySpec::new("k", 1)).is_none());
        assert_eq!(s.current_coords(1).seqno, 41);
    }
}
