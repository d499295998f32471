//! Simulated on-disk copy.
//!
//! Nothing here touches a disk. The persisted store is a second item map per
//! vbucket that only changes when the node "persists" a mutation, so tests
//! can observe the gap between cache and disk.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::storage::item::{Item, KeySpec};
use crate::storage::vbucket_store::VBucketCoordinates;

#[derive(Debug, Default)]
struct Slot {
    coords: VBucketCoordinates,
    items: HashMap<KeySpec, Item>,
}

impl Slot {
    /// Record the coordinates of a write. Zero coordinates come from
    /// control commands and leave the slot position untouched.
    fn advance(&mut self, coords: VBucketCoordinates) {
        if coords.uuid != 0 && coords.seqno != 0 {
            self.coords = coords;
        }
    }
}

/// Persisted copies for one node.
#[derive(Debug)]
pub struct PersistedStore {
    slots: Mutex<Vec<Slot>>,
}

impl PersistedStore {
    pub fn new(num_vbuckets: usize) -> Self {
        Self {
            slots: Mutex::new((0..num_vbuckets).map(|_| Slot::default()).collect()),
        }
    }

    pub fn put(&self, item: Item, coords: VBucketCoordinates) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(item.key_spec.vbucket as usize) {
            slot.advance(coords);
            slot.items.insert(item.key_spec.clone(), item);
        }
    }

    pub fn remove(&self, ks: &KeySpec, coords: VBucketCoordinates) -> Option<Item> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(ks.vbucket as usize)?;
        slot.advance(coords);
        slot.items.remove(ks)
    }

    pub fn get(&self, ks: &KeySpec) -> Option<Item> {
        self.slots
            .lock()
            .get(ks.vbucket as usize)
            .and_then(|s| s.items.get(ks).cloned())
    }

    /// Position of the last persisted mutation of a vbucket.
    pub fn coords(&self, vbucket: u16) -> VBucketCoordinates {
        self.slots
            .lock()
            .get(vbucket as usize)
            .map(|s| s.coords)
            .unwrap_or_default()
    }

    /// Reset a vbucket's position after an ownership change.
    pub fn update_coords(&self, vbucket: u16, coords: VBucketCoordinates) {
        if let Some(slot) = self.slots.lock().get_mut(vbucket as usize) {
            slot.coords = coords;
        }
    }

    pub fn items(&self) -> Vec<Item> {
        self.slots
            .lock()
            .iter()
            .flat_map(|s| s.items.values().cloned())
            .collect()
    }

    pub fn clear(&self) {
        for slot in self.slots.lock().iter_mut() {
            slot.items.clear();
        }
    }
}
