use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

use super::page::Page;
use crate::types::Result;

/// Smallest slot array a table is ever sized to
pub const MIN_TABLE_SIZE: usize = 16;

/// Table shrinks once it is this many times larger than needed
const SHRINK_FACTOR: usize = 2;

/// Extra room given on top of `count / load_factor` when resizing
const RESIZE_HEADROOM: f32 = 1.5;

/// Maps a page index to the start of its probe sequence
pub type PageIndexHash = fn(u32) -> u32;

/// Default hash: golden-ratio multiply with a high-bits fold
pub fn mix_hash(page_index: u32) -> u32 {
    let h = page_index.wrapping_mul(0x9E37_79B9);
    h ^ (h >> 16)
}

/// Page index used as is: consecutive pages land in consecutive slots
pub fn identity_hash(page_index: u32) -> u32 {
    page_index
}

struct Slots {
    pages: Box<[Atomic<Arc<Page>>]>,
}

impl Slots {
    fn with_len(len: usize) -> Self {
        Self {
            pages: (0..len).map(|_| Atomic::null()).collect(),
        }
    }
}

impl Drop for Slots {
    fn drop(&mut self) {
        // SAFETY: an array is dropped only once unreachable by any reader
        let guard = unsafe { epoch::unprotected() };
        for slot in self.pages.iter() {
            let entry = slot.load(Ordering::Relaxed, guard);
            if !entry.is_null() {
                drop(unsafe { entry.into_owned() });
            }
        }
    }
}

/// Concurrent open-addressing directory of the pages of one storage
///
/// Point lookups are lock-free: they read an epoch-protected slot array.
/// Inserts and resizes are serialized by one structural lock, which also
/// guards the count of occupied (live + tombstoned) slots. Probing is linear
/// with step 1; an insert reuses the first tombstone met on its probe.
pub struct PagesTable {
    slots: Atomic<Slots>,

    /// Structural lock around the occupied slot count
    structure: Mutex<usize>,

    load_factor: f32,
    hash: PageIndexHash,
}

impl PagesTable {
    /// Table sized to hold `expected_pages` within `load_factor`
    pub fn new(expected_pages: usize, load_factor: f32) -> Self {
        let len = ((expected_pages as f32 / load_factor).ceil() as usize).max(MIN_TABLE_SIZE);
        Self::with_slots(len, load_factor, mix_hash)
    }

    /// Table with exactly `len` slots and a custom hash
    pub fn with_slots(len: usize, load_factor: f32, hash: PageIndexHash) -> Self {
        assert!(len > 0, "table needs at least one slot");
        assert!(
            load_factor > 0.0 && load_factor < 1.0,
            "load_factor(={load_factor}) must be in (0, 1)"
        );
        Self {
            slots: Atomic::new(Slots::with_len(len)),
            structure: Mutex::new(0),
            load_factor,
            hash,
        }
    }

    /// Current number of slots
    pub fn table_size(&self) -> usize {
        let guard = &epoch::pin();
        self.current_slots(guard).pages.len()
    }

    /// Slots holding a page, tombstones included
    pub fn occupied_slots(&self) -> usize {
        *self.structure.lock()
    }

    /// Live (non-tombstone) page for `page_index`, without locking
    pub fn lookup_if_exist(&self, page_index: u32) -> Option<Arc<Page>> {
        let guard = &epoch::pin();
        let slots = self.current_slots(guard);
        let len = slots.pages.len();
        let mut i = self.home_slot(page_index, len);
        for _ in 0..len {
            let entry = slots.pages[i].load(Ordering::Acquire, guard);
            // SAFETY: entries are freed through the epoch collector only
            match unsafe { entry.as_ref() } {
                None => return None,
                Some(page) if page.page_index() == page_index && !page.is_tombstone() => {
                    return Some(Arc::clone(page));
                }
                Some(_) => {}
            }
            i = (i + 1) % len;
        }
        None
    }

    /// Live page for `page_index`, inserting `factory(page_index)` if none
    ///
    /// The new page is inserted as is (NOT_READY_YET) and loaded by the
    /// caller outside the structural lock.
    pub fn lookup_or_create(&self, page_index: u32, factory: impl FnOnce(u32) -> Page) -> Arc<Page> {
        if let Some(page) = self.lookup_if_exist(page_index) {
            return page;
        }

        let mut occupied = self.structure.lock();
        let mut factory = Some(factory);
        loop {
            let guard = &epoch::pin();
            let slots = self.current_slots(guard);
            let len = slots.pages.len();

            let mut insertion: Option<(usize, bool)> = None;
            let mut i = self.home_slot(page_index, len);
            for _ in 0..len {
                let entry = slots.pages[i].load(Ordering::Acquire, guard);
                // SAFETY: see lookup_if_exist
                match unsafe { entry.as_ref() } {
                    None => {
                        insertion.get_or_insert((i, false));
                        break;
                    }
                    Some(page) if page.is_tombstone() => {
                        insertion.get_or_insert((i, true));
                    }
                    Some(page) if page.page_index() == page_index => {
                        // inserted concurrently before we took the lock
                        return Arc::clone(page);
                    }
                    Some(_) => {}
                }
                i = (i + 1) % len;
            }

            let needs_room = match insertion {
                None => true,
                Some((_, reuses_tombstone)) => {
                    !reuses_tombstone && (*occupied + 1) as f32 > len as f32 * self.load_factor
                }
            };
            if needs_room {
                let new_size = self.resized_for(*occupied + 1);
                if !self.rehash_locked(&mut occupied, new_size, guard) {
                    panic!("Bug: growing table of {len} slots to {new_size} failed");
                }
                continue;
            }

            let Some((slot, reuses_tombstone)) = insertion else {
                unreachable!("needs_room covers missing insertion slot");
            };
            let Some(factory) = factory.take() else {
                unreachable!("factory is consumed only by a successful insert");
            };
            let page = Arc::new(factory(page_index));
            let previous = slots.pages[slot].swap(
                Owned::new(Arc::clone(&page)),
                Ordering::AcqRel,
                guard,
            );
            if reuses_tombstone {
                // SAFETY: unlinked above, readers may still hold it until unpinned
                unsafe { guard.defer_destroy(previous) };
            } else {
                *occupied += 1;
            }
            return page;
        }
    }

    /// Rebuild the slot array with `new_size` slots, dropping tombstones
    ///
    /// Returns false, leaving the table as is, if `new_size` cannot fit every
    /// live page.
    pub fn rehash_to_size(&self, new_size: usize) -> bool {
        let mut occupied = self.structure.lock();
        let guard = &epoch::pin();
        self.rehash_locked(&mut occupied, new_size, guard)
    }

    /// Shrink if the table is much larger than `alive_estimate` pages need
    ///
    /// The estimate comes from an unlocked scan and may undershoot; a rehash
    /// that cannot fit the pages actually alive is abandoned. Returns whether
    /// the table was shrunk.
    pub fn shrink_if_needed(&self, alive_estimate: usize) -> bool {
        let expected = (alive_estimate as f32 / self.load_factor) as usize;
        if expected < MIN_TABLE_SIZE || expected * SHRINK_FACTOR >= self.table_size() {
            return false;
        }
        let target = self.resized_for(alive_estimate);
        if target >= self.table_size() {
            return false;
        }
        let shrunk = self.rehash_to_size(target);
        if !shrunk {
            debug!(
                alive_estimate,
                target_size = target,
                "page_cache.table.shrink_abandoned"
            );
        }
        shrunk
    }

    /// Flush every dirty live page, best effort
    ///
    /// Not linearizable with concurrent inserts or writes: pages inserted or
    /// dirtied while this runs may or may not be flushed. Keeps going after a
    /// failure and returns the first error.
    pub fn flush_all(&self) -> Result<()> {
        let mut first_error = None;
        for page in self.pages_snapshot() {
            if !page.is_dirty() {
                continue;
            }
            if let Err(e) = page.flush() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Every non-tombstone page currently in the table
    pub fn pages_snapshot(&self) -> Vec<Arc<Page>> {
        let guard = &epoch::pin();
        let slots = self.current_slots(guard);
        slots
            .pages
            .iter()
            .filter_map(|slot| {
                // SAFETY: see lookup_if_exist
                let page = unsafe { slot.load(Ordering::Acquire, guard).as_ref() }?;
                (!page.is_tombstone()).then(|| Arc::clone(page))
            })
            .collect()
    }

    /// Number of live pages by probe length (0 = found in its home slot)
    pub fn probe_lengths_histogram(&self) -> BTreeMap<usize, usize> {
        let guard = &epoch::pin();
        let slots = self.current_slots(guard);
        let len = slots.pages.len();
        let mut histogram = BTreeMap::new();
        for (i, slot) in slots.pages.iter().enumerate() {
            // SAFETY: see lookup_if_exist
            let Some(page) = (unsafe { slot.load(Ordering::Acquire, guard).as_ref() }) else {
                continue;
            };
            if page.is_tombstone() {
                continue;
            }
            let home = self.home_slot(page.page_index(), len);
            *histogram.entry((i + len - home) % len).or_insert(0) += 1;
        }
        histogram
    }

    fn current_slots<'g>(&self, guard: &'g Guard) -> &'g Slots {
        let slots = self.slots.load(Ordering::Acquire, guard);
        // SAFETY: never null; replaced arrays are freed through the epoch collector
        unsafe { slots.deref() }
    }

    #[inline]
    fn home_slot(&self, page_index: u32, len: usize) -> usize {
        (self.hash)(page_index) as usize % len
    }

    fn resized_for(&self, count: usize) -> usize {
        let size = (count as f32 / self.load_factor).ceil() * RESIZE_HEADROOM;
        (size.ceil() as usize).max(MIN_TABLE_SIZE)
    }

    fn rehash_locked(&self, occupied: &mut usize, new_size: usize, guard: &Guard) -> bool {
        let old = self.slots.load(Ordering::Acquire, guard);
        // SAFETY: never null, structural lock held
        let old_slots = unsafe { old.deref() };
        let alive: Vec<Arc<Page>> = old_slots
            .pages
            .iter()
            .filter_map(|slot| {
                let page = unsafe { slot.load(Ordering::Acquire, guard).as_ref() }?;
                (!page.is_tombstone()).then(|| Arc::clone(page))
            })
            .collect();
        if alive.len() >= new_size {
            return false;
        }

        let new_slots = Slots::with_len(new_size);
        for page in &alive {
            let mut i = self.home_slot(page.page_index(), new_size);
            while !new_slots.pages[i].load(Ordering::Relaxed, guard).is_null() {
                i = (i + 1) % new_size;
            }
            new_slots.pages[i].store(Owned::new(Arc::clone(page)), Ordering::Relaxed);
        }

        let old_len = old_slots.pages.len();
        let replaced: Shared<'_, Slots> =
            self.slots.swap(Owned::new(new_slots), Ordering::AcqRel, guard);
        // SAFETY: unlinked, lookups still reading it hold a guard
        unsafe { guard.defer_destroy(replaced) };

        debug!(
            old_size = old_len,
            new_size,
            alive = alive.len(),
            tombstones_dropped = occupied.saturating_sub(alive.len()),
            "page_cache.table.rehashed"
        );
        *occupied = alive.len();
        true
    }

    #[cfg(test)]
    fn slot_of(&self, page_index: u32) -> Option<usize> {
        let guard = &epoch::pin();
        let slots = self.current_slots(guard);
        slots.pages.iter().position(|slot| {
            unsafe { slot.load(Ordering::Acquire, guard).as_ref() }
                .map_or(false, |page| page.page_index() == page_index && !page.is_tombstone())
        })
    }
}

impl Drop for PagesTable {
    fn drop(&mut self) {
        // SAFETY: `&mut self`, no reader can be pinned on this table anymore
        unsafe {
            let guard = epoch::unprotected();
            let slots = self.slots.load(Ordering::Relaxed, guard);
            if !slots.is_null() {
                drop(slots.into_owned());
            }
        }
    }
}

impl std::fmt::Debug for PagesTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagesTable")
            .field("table_size", &self.table_size())
            .field("occupied_slots", &self.occupied_slots())
            .field("load_factor", &self.load_factor)
            .finish()
    }
}
