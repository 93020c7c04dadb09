//! COMDAT group deduplication. Groups with the same signature across input files must contribute
//! their sections exactly once; files race to claim each group and the file with the lowest
//! priority number wins.

use crate::hash::HashMap;
use crate::hash::hash_bytes;
use colosseum::sync::Arena;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

const NUM_SHARDS: usize = 16;

pub(crate) struct ComdatGroup {
    /// Priority of the owning file. `u32::MAX` until any file claims the group.
    owner: AtomicU32,
}

impl ComdatGroup {
    fn new() -> Self {
        Self {
            owner: AtomicU32::new(u32::MAX),
        }
    }

    /// Offers `priority` as the owner. The numerically lowest priority wins regardless of the
    /// order in which claims arrive.
    pub(crate) fn claim(&self, priority: u32) {
        self.owner.fetch_min(priority, Ordering::Relaxed);
    }

    pub(crate) fn owned_by(&self, priority: u32) -> bool {
        self.owner.load(Ordering::Relaxed) == priority
    }
}

/// Interns COMDAT groups by signature name, process-wide.
pub(crate) struct ComdatRegistry<'data> {
    shards: Vec<Mutex<HashMap<&'data [u8], &'data ComdatGroup>>>,
    arena: &'data Arena<ComdatGroup>,
}

impl<'data> ComdatRegistry<'data> {
    pub(crate) fn new(arena: &'data Arena<ComdatGroup>) -> Self {
        let mut shards = Vec::with_capacity(NUM_SHARDS);
        shards.resize_with(NUM_SHARDS, || Mutex::new(HashMap::default()));
        Self { shards, arena }
    }

    pub(crate) fn intern(&self, signature: &'data [u8]) -> &'data ComdatGroup {
        let shard = &self.shards[(hash_bytes(signature) as usize) % NUM_SHARDS];
        let mut map = shard.lock().unwrap();
        map.entry(signature)
            .or_insert_with(|| &*self.arena.alloc(ComdatGroup::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_priority_wins() {
        let arena = Arena::new();
        let registry = ComdatRegistry::new(&arena);
        let group = registry.intern(b"_ZN3fooC1Ev");
        group.claim(7);
        group.claim(3);
        group.claim(5);
        assert!(group.owned_by(3));
        assert!(!group.owned_by(7));
    }

    #[test]
    fn test_same_signature_same_group() {
        let arena = Arena::new();
        let registry = ComdatRegistry::new(&arena);
        let a = registry.intern(b"sig");
        let b = registry.intern(b"sig");
        assert!(std::ptr::eq(a, b));
        assert!(!std::ptr::eq(a, registry.intern(b"other")));
    }
}
