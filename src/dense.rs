//! The dense engine (spec §4.3): single indirection, one paged array of
//! `{Meta, Value}` slots.
//!
//! Grounded on the teacher's `Page`/`Table` in `src/table.rs`, generalized
//! from a raw-pointer/vtable arena (which relies on `unsafe`) to a safe
//! `Vec<Option<V>>` store — this crate follows the no-`unsafe` discipline
//! the pack's `enso` workspace enforces (`rust.unsafe_code = "deny"`) rather
//! than the teacher's unsafe typed arena, since a slot map's value type has
//! no type-erasure requirement to justify it.

use crate::config::SlotMapConfig;
use crate::diagnostics::{debug, trace};
use crate::error::{ErrorKind, Result, SlotMapError};
use crate::free_list::FreeList;
use crate::key::Key;
use crate::meta::Meta;
use crate::paging::{self, PagedAddress};
use crate::state::State;
use crate::version::Version;

struct DensePage<V> {
    meta: Vec<Meta>,
    values: Vec<Option<V>>,
}

impl<V> DensePage<V> {
    fn new(page_size: usize) -> Self {
        DensePage {
            meta: vec![Meta::EMPTY; page_size],
            values: std::iter::repeat_with(|| None).take(page_size).collect(),
        }
    }

    fn clear(&mut self) {
        for m in &mut self.meta {
            *m = Meta::EMPTY;
        }
        for v in &mut self.values {
            *v = None;
        }
    }
}

/// Single-indirection slot map: each slot holds its `Meta` and value inline
/// in the same page.
pub struct DenseSlotMap<V> {
    page_size: u32,
    free_indices_limit: u32,
    pages: Vec<DensePage<V>>,
    next_fresh_index: u32,
    free_list: FreeList,
    slot_count: u32,
    tombstone_count: u32,
    mutation_version: u64,
}

impl<V> DenseSlotMap<V> {
    /// Builds an engine with the default configuration (spec §6:
    /// `page_size = 1024`, `free_indices_limit = 32`).
    pub fn new() -> Self {
        Self::with_config(SlotMapConfig::default()).expect("default config is always valid")
    }

    pub fn with_config(config: SlotMapConfig) -> Result<Self> {
        paging::validate_page_size(config.page_size)?;
        let (free_indices_limit, clamped) =
            paging::clamp_free_indices_limit(config.free_indices_limit, config.page_size);
        if clamped {
            tracing::warn!(
                requested = config.free_indices_limit,
                page_size = config.page_size,
                clamped_to = free_indices_limit,
                "free_indices_limit exceeds page_size; clamping"
            );
        }
        Ok(DenseSlotMap {
            page_size: config.page_size,
            free_indices_limit,
            pages: Vec::new(),
            next_fresh_index: 0,
            free_list: FreeList::new(),
            slot_count: 0,
            tombstone_count: 0,
            mutation_version: 0,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn tombstone_count(&self) -> u32 {
        self.tombstone_count
    }

    pub fn free_indices_limit(&self) -> u32 {
        self.free_indices_limit
    }

    pub fn len(&self) -> u32 {
        self.slot_count
    }

    pub fn is_empty(&self) -> bool {
        self.slot_count == 0
    }

    /// A read-only view of one page's metadata, for inspection/debugging.
    pub fn page_meta(&self, page: u32) -> Option<&[Meta]> {
        self.pages.get(page as usize).map(|p| p.meta.as_slice())
    }

    /// A read-only view of one page's value slots, for inspection/debugging.
    pub fn page_values(&self, page: u32) -> Option<&[Option<V>]> {
        self.pages.get(page as usize).map(|p| p.values.as_slice())
    }

    pub(crate) fn mutation_version(&self) -> u64 {
        self.mutation_version
    }

    fn bump_mutation(&mut self) {
        self.mutation_version = self.mutation_version.wrapping_add(1);
    }

    fn push_page(&mut self) -> Result<()> {
        let max_pages = paging::max_page_count(self.page_size);
        if self.pages.len() as u32 >= max_pages {
            return Err(SlotMapError::new(ErrorKind::CapacityExhausted {
                page_count: self.pages.len() as u32,
            }));
        }
        self.pages.push(DensePage::new(self.page_size as usize));
        trace!(page_count = self.pages.len(), "dense engine grew a page");
        Ok(())
    }

    fn acquire_slot(&mut self) -> Result<Key> {
        if let Some(retired) = self.free_list.try_recycle(self.free_indices_limit) {
            let new_version = retired
                .version()
                .next()
                .expect("a free-listed key's version is always below MAX");
            trace!(index = retired.index(), "recycling retired key");
            return Ok(retired.with_version(new_version));
        }
        let index = self.next_fresh_index;
        let addr = paging::from_linear(index, self.page_size);
        if addr.page as usize >= self.pages.len() {
            self.push_page()?;
        }
        self.next_fresh_index += 1;
        Ok(Key::new(index, Version::FIRST))
    }

    fn slot_mut(&mut self, addr: PagedAddress) -> (&mut Meta, &mut Option<V>) {
        let page = &mut self.pages[addr.page as usize];
        (&mut page.meta[addr.offset as usize], &mut page.values[addr.offset as usize])
    }

    fn slot(&self, addr: PagedAddress) -> (Meta, &Option<V>) {
        let page = &self.pages[addr.page as usize];
        (page.meta[addr.offset as usize], &page.values[addr.offset as usize])
    }

    fn find(&self, key: Key) -> Result<PagedAddress> {
        paging::find_paged_address(self.pages.len() as u32, self.page_size, key)
    }

    /// Inserts `value`, returning a fresh [`Key`]. Fails only if the page
    /// cap has been reached.
    pub fn add(&mut self, value: V) -> Result<Key> {
        let key = self.acquire_slot()?;
        let addr = paging::from_linear(key.index(), self.page_size);
        let (meta, slot_value) = self.slot_mut(addr);
        *meta = Meta::new(key.version(), State::Occupied);
        *slot_value = Some(value);
        self.slot_count += 1;
        self.bump_mutation();
        Ok(key)
    }

    pub fn try_add(&mut self, value: V) -> Option<Key> {
        self.add(value).ok()
    }

    pub fn get(&self, key: Key) -> Result<&V> {
        let addr = self.find(key)?;
        let (meta, value) = self.slot(addr);
        match meta.state() {
            State::Occupied if meta.version() == key.version() => {
                Ok(value.as_ref().expect("occupied slot always holds a value"))
            }
            State::Occupied => Err(SlotMapError::new(ErrorKind::StaleKey {
                key,
                current: key.with_version(meta.version()),
            })),
            State::Empty => Err(SlotMapError::new(ErrorKind::EmptySlot { key })),
            State::Tombstone => Err(SlotMapError::new(ErrorKind::DeadSlot { key })),
        }
    }

    pub fn try_get(&self, key: Key) -> Option<&V> {
        self.get(key).ok()
    }

    pub fn get_mut(&mut self, key: Key) -> Result<&mut V> {
        let addr = self.find(key)?;
        let (meta, value) = {
            let page = &mut self.pages[addr.page as usize];
            (page.meta[addr.offset as usize], &mut page.values[addr.offset as usize])
        };
        match meta.state() {
            State::Occupied if meta.version() == key.version() => {
                Ok(value.as_mut().expect("occupied slot always holds a value"))
            }
            State::Occupied => Err(SlotMapError::new(ErrorKind::StaleKey {
                key,
                current: key.with_version(meta.version()),
            })),
            State::Empty => Err(SlotMapError::new(ErrorKind::EmptySlot { key })),
            State::Tombstone => Err(SlotMapError::new(ErrorKind::DeadSlot { key })),
        }
    }

    pub fn try_get_mut(&mut self, key: Key) -> Option<&mut V> {
        self.get_mut(key).ok()
    }

    pub fn contains(&self, key: Key) -> bool {
        match self.find(key) {
            Ok(addr) => {
                let (meta, _) = self.slot(addr);
                meta.state().is_occupied() && meta.version() == key.version()
            }
            Err(_) => false,
        }
    }

    /// Overwrites the value at `key`, bumping its version. Any previously
    /// issued key at this slot becomes stale.
    pub fn replace(&mut self, key: Key, value: V) -> Result<Key> {
        let addr = self.find(key)?;
        let (meta, slot_value) = self.slot_mut(addr);
        match meta.state() {
            State::Occupied if meta.version() == key.version() => {
                let new_version = meta.version().next().ok_or_else(|| {
                    SlotMapError::new(ErrorKind::VersionExhausted { key })
                })?;
                *meta = meta.with_version(new_version);
                *slot_value = Some(value);
                let new_key = key.with_version(new_version);
                self.bump_mutation();
                Ok(new_key)
            }
            State::Occupied => Err(SlotMapError::new(ErrorKind::StaleKey {
                key,
                current: key.with_version(meta.version()),
            })),
            State::Empty => Err(SlotMapError::new(ErrorKind::EmptySlot { key })),
            State::Tombstone => Err(SlotMapError::new(ErrorKind::DeadSlot { key })),
        }
    }

    pub fn try_replace(&mut self, key: Key, value: V) -> Option<Key> {
        self.replace(key, value).ok()
    }

    /// Removes the value at `key`. Removing an already-tombstoned slot is
    /// idempotent: it returns `Ok(true)` without touching state.
    pub fn remove(&mut self, key: Key) -> Result<bool> {
        let addr = self.find(key)?;
        let (meta, slot_value) = self.slot_mut(addr);
        match meta.state() {
            State::Tombstone => {
                debug!(?key, "remove of an already-tombstoned slot is a no-op");
                Ok(true)
            }
            State::Empty => Err(SlotMapError::new(ErrorKind::EmptySlot { key })),
            State::Occupied if meta.version() != key.version() => {
                Err(SlotMapError::new(ErrorKind::StaleKey {
                    key,
                    current: key.with_version(meta.version()),
                }))
            }
            State::Occupied => {
                *slot_value = None;
                if meta.version().is_max() {
                    *meta = meta.with_state(State::Tombstone);
                    self.tombstone_count += 1;
                } else {
                    *meta = meta.with_state(State::Empty);
                    self.free_list.push(key);
                }
                self.slot_count -= 1;
                self.bump_mutation();
                Ok(true)
            }
        }
    }

    pub fn try_remove(&mut self, key: Key) -> bool {
        self.remove(key).unwrap_or(false)
    }

    /// Refreshes `key` to the slot's current version, iff that slot is
    /// `Occupied`.
    pub fn update_version(&self, key: Key) -> Result<Key> {
        let addr = self.find(key)?;
        let (meta, _) = self.slot(addr);
        match meta.state() {
            State::Occupied => Ok(key.with_version(meta.version())),
            State::Empty => Err(SlotMapError::new(ErrorKind::EmptySlot { key })),
            State::Tombstone => Err(SlotMapError::new(ErrorKind::DeadSlot { key })),
        }
    }

    pub fn try_update_version(&self, key: Key) -> Option<Key> {
        self.update_version(key).ok()
    }

    pub fn add_range(&mut self, values: impl IntoIterator<Item = V>) -> Result<Vec<Key>> {
        values.into_iter().map(|v| self.add(v)).collect()
    }

    pub fn try_add_range(&mut self, values: impl IntoIterator<Item = V>) -> Vec<Key> {
        values.into_iter().filter_map(|v| self.try_add(v)).collect()
    }

    pub fn get_range(&self, keys: &[Key]) -> Result<Vec<&V>> {
        keys.iter().map(|&k| self.get(k)).collect()
    }

    pub fn try_get_range(&self, keys: &[Key]) -> Vec<Option<&V>> {
        keys.iter().map(|&k| self.try_get(k)).collect()
    }

    pub fn remove_range(&mut self, keys: &[Key]) -> Result<()> {
        for &key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    pub fn try_replace_range(&mut self, pairs: impl IntoIterator<Item = (Key, V)>) -> Vec<Option<Key>> {
        pairs
            .into_iter()
            .map(|(key, value)| self.try_replace(key, value))
            .collect()
    }

    /// Clears the first page in place, drops every other page, and empties
    /// the free queue and counters.
    pub fn reset(&mut self) {
        debug!("resetting dense engine");
        self.pages.truncate(1);
        if let Some(first) = self.pages.first_mut() {
            first.clear();
        }
        self.free_list.clear();
        self.slot_count = 0;
        self.tombstone_count = 0;
        self.next_fresh_index = 0;
        self.bump_mutation();
    }

    pub fn iter(&self) -> DenseIter<'_, V> {
        DenseIter {
            enumerator: DenseEnumerator::new(self),
        }
    }

    pub fn enumerator(&self) -> DenseEnumerator<'_, V> {
        DenseEnumerator::new(self)
    }
}

impl<V> Default for DenseSlotMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum CursorState {
    NotStarted,
    Positioned,
    Exhausted,
}

/// A version-guarded, forward-only walk over occupied slots (spec §4.6).
///
/// Snapshots the engine's mutation counter at construction; any mutation
/// observed before the next `step()` fails that step with
/// `EnumerationInvalidated`.
pub struct DenseEnumerator<'a, V> {
    map: &'a DenseSlotMap<V>,
    mutation_at_start: u64,
    page: u32,
    offset: u32,
    state: CursorState,
}

impl<'a, V> DenseEnumerator<'a, V> {
    fn new(map: &'a DenseSlotMap<V>) -> Self {
        DenseEnumerator {
            map,
            mutation_at_start: map.mutation_version(),
            page: 0,
            offset: 0,
            state: CursorState::NotStarted,
        }
    }

    /// Guards against a mutation occurring since the enumerator's snapshot.
    /// Compiled out entirely when the `strict-checks` feature is disabled
    /// (spec §6's release-build toggle); the enumerator then walks the
    /// current page/offset state without comparing mutation counters.
    fn check_fresh(&self) -> Result<()> {
        #[cfg(feature = "strict-checks")]
        if self.map.mutation_version() != self.mutation_at_start {
            return Err(SlotMapError::new(ErrorKind::EnumerationInvalidated));
        }
        Ok(())
    }

    /// Advances to the next occupied slot. Returns `Ok(false)` once
    /// exhausted.
    pub fn step(&mut self) -> Result<bool> {
        if let Err(err) = self.check_fresh() {
            self.state = CursorState::Exhausted;
            return Err(err);
        }
        if self.state == CursorState::Positioned {
            self.offset += 1;
        }
        loop {
            if self.page as usize >= self.map.pages.len() {
                self.state = CursorState::Exhausted;
                return Ok(false);
            }
            let page = &self.map.pages[self.page as usize];
            if self.offset as usize >= page.meta.len() {
                self.page += 1;
                self.offset = 0;
                continue;
            }
            if page.meta[self.offset as usize].state().is_occupied() {
                self.state = CursorState::Positioned;
                return Ok(true);
            }
            self.offset += 1;
        }
    }

    /// The pair at the current cursor position.
    pub fn current(&self) -> Result<(Key, &'a V)> {
        if self.state != CursorState::Positioned {
            return Err(SlotMapError::new(ErrorKind::EnumerationMisuse));
        }
        let page = &self.map.pages[self.page as usize];
        let meta = page.meta[self.offset as usize];
        let index = paging::to_linear(
            PagedAddress {
                page: self.page,
                offset: self.offset,
            },
            self.map.page_size,
        );
        let key = Key::new(index, meta.version());
        let value = page.values[self.offset as usize]
            .as_ref()
            .expect("occupied slot always holds a value");
        Ok((key, value))
    }

    /// Restarts the cursor from the beginning. If a mutation has occurred
    /// since construction, the *next* `step()` will still fail — `reset`
    /// does not re-synchronize the snapshot.
    pub fn reset(&mut self) -> Result<()> {
        self.check_fresh()?;
        self.page = 0;
        self.offset = 0;
        self.state = CursorState::NotStarted;
        Ok(())
    }
}

/// Convenience [`Iterator`] over `(Key, &V)`, built on [`DenseEnumerator`].
///
/// Panics if the map is mutated while iteration is in progress, since
/// `Iterator::next` has no channel to propagate `EnumerationInvalidated`.
/// Use [`DenseSlotMap::enumerator`] directly if you need to handle that
/// case without panicking.
pub struct DenseIter<'a, V> {
    enumerator: DenseEnumerator<'a, V>,
}

impl<'a, V> Iterator for DenseIter<'a, V> {
    type Item = (Key, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        match self.enumerator.step() {
            Ok(true) => Some(self.enumerator.current().expect("just positioned")),
            Ok(false) => None,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<'a, V> IntoIterator for &'a DenseSlotMap<V> {
    type Item = (Key, &'a V);
    type IntoIter = DenseIter<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_map() -> DenseSlotMap<i32> {
        DenseSlotMap::with_config(SlotMapConfig::new(4, 2)).unwrap()
    }

    #[test]
    fn basic_add_remove_contains() {
        let mut map = small_map();
        let k1 = map.add(8).unwrap();
        let k2 = map.add(9).unwrap();
        let k3 = map.add(22).unwrap();
        assert!(map.remove(k2).unwrap());
        assert!(!map.contains(k2));
        assert!(map.contains(k3));
        assert_eq!(*map.get(k3).unwrap(), 22);
        let _ = k1;
    }

    #[test]
    fn replace_invalidates_old_key() {
        let mut map = small_map();
        let k1 = map.add(1).unwrap();
        let k2 = map.replace(k1, 53).unwrap();
        assert_eq!(*map.get(k2).unwrap(), 53);
        let err = map.get(k1).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::StaleKey { .. }));
        assert!(map.try_get(k1).is_none());
    }

    #[test]
    fn recycling_honours_threshold() {
        let mut map = DenseSlotMap::with_config(SlotMapConfig::new(8, 2)).unwrap();
        let keys: Vec<Key> = (0..5).map(|i| map.add(i).unwrap()).collect();
        map.remove(keys[0]).unwrap();
        map.remove(keys[1]).unwrap();
        // queue len == 2, limit == 2: not eligible yet.
        let next = map.add(100).unwrap();
        assert_eq!(next.index(), 5);

        map.remove(keys[2]).unwrap();
        // queue len == 3 > 2: head (keys[0]'s retired slot) gets reused.
        let recycled = map.add(200).unwrap();
        assert_eq!(recycled.index(), keys[0].index());
        assert_eq!(recycled.version(), keys[0].version().next().unwrap());
    }

    #[test]
    fn tombstone_at_max_version() {
        let mut map = small_map();
        let key = map.add(0).unwrap();
        // Seed the slot at `Version::MAX` directly instead of looping a
        // billion `replace` calls to get there.
        let addr = paging::from_linear(key.index(), map.page_size());
        map.pages[addr.page as usize].meta[addr.offset as usize] =
            Meta::new(Version::MAX, State::Occupied);
        let key = key.with_version(Version::MAX);

        assert!(map.remove(key).unwrap());
        assert_eq!(map.tombstone_count(), 1);
        let err = map.get(key).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DeadSlot { .. }));
        // Idempotent dead-slot remove.
        assert!(map.try_remove(key));
    }

    #[test]
    fn page_boundary() {
        let mut map = small_map();
        let keys: Vec<Key> = (0..9).map(|i| map.add(i).unwrap()).collect();
        assert_eq!(map.page_count(), 3);
        assert_eq!(map.slot_count(), 9);
        for key in keys {
            map.remove(key).unwrap();
        }
        assert_eq!(map.page_count(), 3);
        assert_eq!(map.slot_count(), 0);
    }

    #[test]
    fn iteration_yields_live_values() {
        let mut map = small_map();
        let k1 = map.add(1).unwrap();
        let k2 = map.add(2).unwrap();
        map.remove(k1).unwrap();
        let collected: Vec<(Key, i32)> = map.iter().map(|(k, v)| (k, *v)).collect();
        assert_eq!(collected, vec![(k2, 2)]);
    }

    #[test]
    fn enumerator_fails_fast_on_mutation() {
        let mut map = small_map();
        map.add(1).unwrap();
        map.add(2).unwrap();
        let mut en = map.enumerator();
        assert!(en.step().unwrap());
        map.add(3).unwrap();
        assert!(matches!(
            en.step().unwrap_err().kind(),
            ErrorKind::EnumerationInvalidated
        ));
    }

    #[test]
    fn round_trip_multiset() {
        let mut map = DenseSlotMap::<i32>::new();
        let keys: Vec<Key> = (0..50).map(|i| map.add(i).unwrap()).collect();
        for &key in &keys {
            map.remove(key).unwrap();
        }
        assert_eq!(map.slot_count(), 0);
        for key in keys {
            assert!(map.try_get(key).is_none());
        }
    }
}
