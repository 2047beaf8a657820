use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use concurrent_map::ConcurrentMap;
use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::{Lsa, Vpid};

/// Non-owning reference to a slot in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotRef {
    pub block_no: usize,
    pub position_in_block: usize,
    pub lsa: Lsa,
}

impl SlotRef {
    fn same_slot(&self, block_no: usize, position_in_block: usize) -> bool {
        self.block_no == block_no && self.position_in_block == position_in_block
    }
}

#[derive(Debug)]
struct EntryState {
    slot: SlotRef,
    // set under the entry lock right before the entry leaves the map
    removed: bool,
}

#[derive(Debug, Clone)]
struct Entry(Arc<Mutex<EntryState>>);

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// What happened to the index on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inserted {
    New,
    /// The entry now points at the new slot. `previous` was the slot it
    /// pointed at before.
    Replaced { previous: SlotRef },
    /// An already indexed slot carries a newer LSA and stays.
    Kept,
}

type Map = ConcurrentMap<Vpid, Entry>;

static NEXT_INDEX_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// This thread's handles, one per live index. A handle pins its
    /// own epochs, so it is never shared between threads.
    static HANDLES: RefCell<FnvHashMap<u64, (Weak<()>, Map)>> =
        RefCell::new(FnvHashMap::default());
}

/// Maps a page to the slot holding its most recent buffered image.
pub(crate) struct SlotsHash {
    id: u64,
    // every thread clones its handle from here on first use
    origin: Mutex<Map>,
    alive: Arc<()>,
}

impl Default for SlotsHash {
    fn default() -> SlotsHash {
        SlotsHash {
            id: NEXT_INDEX_ID.fetch_add(1, Ordering::Relaxed),
            origin: Mutex::new(Map::default()),
            alive: Arc::new(()),
        }
    }
}

impl std::fmt::Debug for SlotsHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotsHash").field("len", &self.len()).finish()
    }
}

impl SlotsHash {
    fn with_map<F, R>(&self, mut f: F) -> R
    where
        F: FnMut(&Map) -> R,
    {
        HANDLES
            .try_with(|handles| {
                if !handles.borrow().contains_key(&self.id) {
                    let map = self.origin.lock().clone();
                    let mut handles = handles.borrow_mut();
                    // drop handles of indexes that are gone
                    handles.retain(|_, (alive, _)| alive.strong_count() > 0);
                    handles.insert(self.id, (Arc::downgrade(&self.alive), map));
                }
                let handles = handles.borrow();
                match handles.get(&self.id) {
                    Some((_, map)) => f(map),
                    None => f(&self.origin.lock().clone()),
                }
            })
            .unwrap_or_else(|_| f(&self.origin.lock().clone()))
    }

    /// Indexes `slot` for `vpid` unless a slot with a higher LSA is
    /// already indexed.
    ///
    /// When the indexed slot carries the very same LSA and lives in
    /// the same block, the page was flushed without logging in
    /// between. The physically later slot becomes authoritative and
    /// `invalidate` runs on the earlier one while the entry is still
    /// locked, so no reader can observe it in between.
    pub fn insert<F>(&self, vpid: Vpid, slot: SlotRef, invalidate: F) -> Inserted
    where
        F: FnOnce(SlotRef),
    {
        let mut invalidate = Some(invalidate);
        loop {
            if let Some(entry) = self.with_map(|map| map.get(&vpid)) {
                let mut state = entry.0.lock();
                if state.removed {
                    // raced with a flush removing it, look again
                    continue;
                }

                let previous = state.slot;
                if previous.lsa > slot.lsa {
                    return Inserted::Kept;
                }

                if previous.lsa == slot.lsa
                    && previous.block_no == slot.block_no
                    && previous.position_in_block < slot.position_in_block
                {
                    if let Some(f) = invalidate.take() {
                        f(previous);
                    }
                }

                state.slot = slot;
                return Inserted::Replaced { previous };
            }

            let entry =
                Entry(Arc::new(Mutex::new(EntryState { slot, removed: false })));
            let installed = self.with_map(|map| {
                let expected: Option<&Entry> = None;
                map.cas(vpid, expected, Some(entry.clone())).is_ok()
            });
            if installed {
                return Inserted::New;
            }
        }
    }

    /// Runs `f` against the slot indexed for `vpid` with the entry
    /// locked, so the slot cannot be reassigned underneath it.
    pub fn with_slot<F, R>(&self, vpid: Vpid, f: F) -> Option<R>
    where
        F: FnOnce(SlotRef) -> R,
    {
        loop {
            let entry = self.with_map(|map| map.get(&vpid))?;
            let state = entry.0.lock();
            if state.removed {
                continue;
            }
            return Some(f(state.slot));
        }
    }

    pub fn get(&self, vpid: Vpid) -> Option<SlotRef> {
        self.with_slot(vpid, |slot| slot)
    }

    /// Removes the entry for `vpid` only if it still points at the
    /// given slot. A newer copy buffered meanwhile stays indexed.
    pub fn remove_if_slot(
        &self,
        vpid: Vpid,
        block_no: usize,
        position_in_block: usize,
    ) -> bool {
        let entry = match self.with_map(|map| map.get(&vpid)) {
            Some(entry) => entry,
            None => return false,
        };

        let mut state = entry.0.lock();
        if state.removed || !state.slot.same_slot(block_no, position_in_block) {
            return false;
        }

        state.removed = true;
        let removed =
            self.with_map(|map| map.cas(vpid, Some(&entry), None).is_ok());
        debug_assert!(removed, "entry for {vpid} replaced while locked");
        removed
    }

    pub fn clear(&self) {
        let vpids: Vec<Vpid> =
            self.with_map(|map| map.iter().map(|(vpid, _)| vpid).collect());
        for vpid in vpids {
            if let Some(entry) = self.with_map(|map| map.get(&vpid)) {
                let mut state = entry.0.lock();
                state.removed = true;
                let _ = self.with_map(|map| map.cas(vpid, Some(&entry), None).is_ok());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.with_map(|map| map.len())
    }

    pub fn is_empty(&self) -> bool {
        self.with_map(|map| map.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    const V: Vpid = Vpid { volid: 1, pageid: 10 };

    fn slot(block_no: usize, position_in_block: usize, lsa: i64) -> SlotRef {
        SlotRef { block_no, position_in_block, lsa: Lsa::new(lsa, 0) }
    }

    #[test]
    fn keeps_highest_lsa() {
        let hash = SlotsHash::default();
        assert_eq!(hash.insert(V, slot(0, 0, 5), |_| panic!()), Inserted::New);
        assert_eq!(
            hash.insert(V, slot(0, 1, 7), |_| panic!()),
            Inserted::Replaced { previous: slot(0, 0, 5) }
        );
        assert_eq!(hash.insert(V, slot(1, 0, 6), |_| panic!()), Inserted::Kept);
        assert_eq!(hash.get(V), Some(slot(0, 1, 7)));
    }

    #[test]
    fn identical_lsa_same_block_invalidates_earlier() {
        let hash = SlotsHash::default();
        hash.insert(V, slot(2, 0, 9), |_| panic!());

        let mut invalidated = None;
        hash.insert(V, slot(2, 3, 9), |s| invalidated = Some(s));
        assert_eq!(invalidated, Some(slot(2, 0, 9)));
        assert_eq!(hash.get(V), Some(slot(2, 3, 9)));

        // a different block does not invalidate in place
        let mut invalidated = None;
        hash.insert(V, slot(3, 0, 9), |s| invalidated = Some(s));
        assert_eq!(invalidated, None);
        assert_eq!(hash.get(V), Some(slot(3, 0, 9)));
    }

    #[test]
    fn remove_only_matching_slot() {
        let hash = SlotsHash::default();
        hash.insert(V, slot(0, 0, 1), |_| {});
        hash.insert(V, slot(1, 0, 2), |_| {});

        assert!(!hash.remove_if_slot(V, 0, 0));
        assert_eq!(hash.len(), 1);
        assert!(hash.remove_if_slot(V, 1, 0));
        assert!(hash.is_empty());
        assert_eq!(hash.get(V), None);
    }

    #[test]
    fn threads_share_one_index() {
        let hash = Arc::new(SlotsHash::default());
        let other = SlotsHash::default();
        hash.insert(V, slot(0, 0, 3), |_| {});

        let seen = {
            let hash = hash.clone();
            thread::spawn(move || {
                let seen = hash.get(V);
                hash.insert(V, slot(0, 1, 4), |_| {});
                seen
            })
            .join()
            .unwrap()
        };
        assert_eq!(seen, Some(slot(0, 0, 3)));
        assert_eq!(hash.get(V), Some(slot(0, 1, 4)));
        assert!(other.is_empty());

        hash.clear();
        assert!(hash.is_empty());
    }

    #[test]
    fn concurrent_inserts_keep_max() {
        let hash = Arc::new(SlotsHash::default());
        let mut threads = vec![];
        for t in 0..4_usize {
            let hash = hash.clone();
            threads.push(thread::spawn(move || {
                for i in 0..500_usize {
                    let lsa = (i * 4 + t) as i64;
                    hash.insert(V, slot(t, i, lsa), |_| {});
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(hash.get(V).unwrap().lsa, Lsa::new(499 * 4 + 3, 0));
    }
}
