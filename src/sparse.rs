//! The sparse engine (spec §4.4): double indirection, a sparse paged array
//! of `{Meta, denseIndex}` plus a packed dense paged array of
//! `{sparseIndex, Value}`. Iteration walks the dense side, so its cost is
//! `O(live)` regardless of deletion history.
//!
//! Grounded on the same `table.rs` paging discipline as [`crate::dense`],
//! with the swap-remove bookkeeping worked out from spec §4.4's six
//! numbered steps rather than from the teacher (the teacher's `Table` has no
//! double-indirection/compaction variant).

use crate::config::SlotMapConfig;
use crate::diagnostics::{debug, trace};
use crate::error::{ErrorKind, Result, SlotMapError};
use crate::free_list::FreeList;
use crate::key::Key;
use crate::meta::Meta;
use crate::paging::{self, PagedAddress};
use crate::state::State;
use crate::version::Version;

struct SparsePage {
    meta: Vec<Meta>,
    dense_index: Vec<u32>,
}

impl SparsePage {
    fn new(page_size: usize) -> Self {
        SparsePage {
            meta: vec![Meta::EMPTY; page_size],
            dense_index: vec![0; page_size],
        }
    }

    fn clear(&mut self) {
        for m in &mut self.meta {
            *m = Meta::EMPTY;
        }
    }
}

struct DensePage<V> {
    sparse_index: Vec<u32>,
    values: Vec<Option<V>>,
}

impl<V> DensePage<V> {
    fn new(page_size: usize) -> Self {
        DensePage {
            sparse_index: vec![0; page_size],
            values: std::iter::repeat_with(|| None).take(page_size).collect(),
        }
    }

    fn clear(&mut self) {
        for v in &mut self.values {
            *v = None;
        }
    }
}

/// Double-indirection slot map: a sparse side addressed by `Key::index`
/// pointing at a packed dense side that holds the values contiguously.
pub struct SparseSlotMap<V> {
    page_size: u32,
    free_indices_limit: u32,
    sparse_pages: Vec<SparsePage>,
    dense_pages: Vec<DensePage<V>>,
    next_fresh_index: u32,
    free_list: FreeList,
    slot_count: u32,
    tombstone_count: u32,
    /// `slot_count - 1` once non-empty; the highest occupied dense index.
    last_dense_index: Option<u32>,
    mutation_version: u64,
}

impl<V> SparseSlotMap<V> {
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
        Ok(SparseSlotMap {
            page_size: config.page_size,
            free_indices_limit,
            sparse_pages: Vec::new(),
            dense_pages: Vec::new(),
            next_fresh_index: 0,
            free_list: FreeList::new(),
            slot_count: 0,
            tombstone_count: 0,
            last_dense_index: None,
            mutation_version: 0,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.sparse_pages.len() as u32
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

    /// A read-only view of one sparse page's metadata.
    pub fn page_meta(&self, page: u32) -> Option<&[Meta]> {
        self.sparse_pages.get(page as usize).map(|p| p.meta.as_slice())
    }

    /// A read-only view of one dense page's back-reference slice
    /// (`sparseIndex` per spec §4.4).
    pub fn dense_page_sparse_index(&self, page: u32) -> Option<&[u32]> {
        self.dense_pages.get(page as usize).map(|p| p.sparse_index.as_slice())
    }

    /// A read-only view of one dense page's value slots, for
    /// inspection/debugging.
    pub fn page_values(&self, page: u32) -> Option<&[Option<V>]> {
        self.dense_pages.get(page as usize).map(|p| p.values.as_slice())
    }

    pub(crate) fn mutation_version(&self) -> u64 {
        self.mutation_version
    }

    fn bump_mutation(&mut self) {
        self.mutation_version = self.mutation_version.wrapping_add(1);
    }

    fn push_page(&mut self) -> Result<()> {
        let max_pages = paging::max_page_count(self.page_size);
        if self.sparse_pages.len() as u32 >= max_pages {
            return Err(SlotMapError::new(ErrorKind::CapacityExhausted {
                page_count: self.sparse_pages.len() as u32,
            }));
        }
        self.sparse_pages.push(SparsePage::new(self.page_size as usize));
        self.dense_pages.push(DensePage::new(self.page_size as usize));
        trace!(page_count = self.sparse_pages.len(), "sparse engine grew a page");
        Ok(())
    }

    fn acquire_sparse_slot(&mut self) -> Result<Key> {
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
        if addr.page as usize >= self.sparse_pages.len() {
            self.push_page()?;
        }
        self.next_fresh_index += 1;
        Ok(Key::new(index, Version::FIRST))
    }

    fn sparse_addr(&self, key: Key) -> Result<PagedAddress> {
        paging::find_paged_address(self.sparse_pages.len() as u32, self.page_size, key)
    }

    fn sparse_meta(&self, addr: PagedAddress) -> Meta {
        self.sparse_pages[addr.page as usize].meta[addr.offset as usize]
    }

    fn dense_addr(&self, dense_index: u32) -> PagedAddress {
        paging::from_linear(dense_index, self.page_size)
    }

    /// Inserts `value`, appending it to the dense side.
    pub fn add(&mut self, value: V) -> Result<Key> {
        let key = self.acquire_sparse_slot()?;
        let sparse_addr = paging::from_linear(key.index(), self.page_size);

        let dense_index = match self.last_dense_index {
            Some(i) => i + 1,
            None => 0,
        };
        let dense_addr = self.dense_addr(dense_index);
        debug_assert!(
            dense_addr.page as usize < self.dense_pages.len(),
            "dense index always stays within the sparse side's allocated pages"
        );

        self.sparse_pages[sparse_addr.page as usize].meta[sparse_addr.offset as usize] =
            Meta::new(key.version(), State::Occupied);
        self.sparse_pages[sparse_addr.page as usize].dense_index[sparse_addr.offset as usize] =
            dense_index;

        self.dense_pages[dense_addr.page as usize].sparse_index[dense_addr.offset as usize] =
            key.index();
        self.dense_pages[dense_addr.page as usize].values[dense_addr.offset as usize] = Some(value);

        self.last_dense_index = Some(dense_index);
        self.slot_count += 1;
        self.bump_mutation();
        Ok(key)
    }

    pub fn try_add(&mut self, value: V) -> Option<Key> {
        self.add(value).ok()
    }

    pub fn get(&self, key: Key) -> Result<&V> {
        let sparse_addr = self.sparse_addr(key)?;
        let meta = self.sparse_meta(sparse_addr);
        match meta.state() {
            State::Occupied if meta.version() == key.version() => {
                let dense_index =
                    self.sparse_pages[sparse_addr.page as usize].dense_index[sparse_addr.offset as usize];
                let dense_addr = self.dense_addr(dense_index);
                Ok(self.dense_pages[dense_addr.page as usize].values[dense_addr.offset as usize]
                    .as_ref()
                    .expect("occupied slot always has a dense value"))
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
        let sparse_addr = self.sparse_addr(key)?;
        let meta = self.sparse_meta(sparse_addr);
        match meta.state() {
            State::Occupied if meta.version() == key.version() => {
                let dense_index =
                    self.sparse_pages[sparse_addr.page as usize].dense_index[sparse_addr.offset as usize];
                let dense_addr = self.dense_addr(dense_index);
                Ok(self.dense_pages[dense_addr.page as usize].values[dense_addr.offset as usize]
                    .as_mut()
                    .expect("occupied slot always has a dense value"))
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
        match self.sparse_addr(key) {
            Ok(addr) => {
                let meta = self.sparse_meta(addr);
                meta.state().is_occupied() && meta.version() == key.version()
            }
            Err(_) => false,
        }
    }

    /// Overwrites the value in place; the dense back-reference is
    /// untouched.
    pub fn replace(&mut self, key: Key, value: V) -> Result<Key> {
        let sparse_addr = self.sparse_addr(key)?;
        let meta = self.sparse_meta(sparse_addr);
        match meta.state() {
            State::Occupied if meta.version() == key.version() => {
                let new_version = meta
                    .version()
                    .next()
                    .ok_or_else(|| SlotMapError::new(ErrorKind::VersionExhausted { key }))?;
                self.sparse_pages[sparse_addr.page as usize].meta[sparse_addr.offset as usize] =
                    meta.with_version(new_version);
                let dense_index =
                    self.sparse_pages[sparse_addr.page as usize].dense_index[sparse_addr.offset as usize];
                let dense_addr = self.dense_addr(dense_index);
                self.dense_pages[dense_addr.page as usize].values[dense_addr.offset as usize] =
                    Some(value);
                self.bump_mutation();
                Ok(key.with_version(new_version))
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

    /// The swap-remove algorithm of spec §4.4, steps 1-6.
    pub fn remove(&mut self, key: Key) -> Result<bool> {
        let sparse_addr = self.sparse_addr(key)?;
        let meta = self.sparse_meta(sparse_addr);

        // Step 1: locate sparse slot S; verify Occupied + version match.
        match meta.state() {
            State::Tombstone => {
                debug!(?key, "remove of an already-tombstoned slot is a no-op");
                return Ok(true);
            }
            State::Empty => return Err(SlotMapError::new(ErrorKind::EmptySlot { key })),
            State::Occupied if meta.version() != key.version() => {
                return Err(SlotMapError::new(ErrorKind::StaleKey {
                    key,
                    current: key.with_version(meta.version()),
                }))
            }
            State::Occupied => {}
        }

        // Step 2: d = S.denseIndex; L = lastDenseIndex.
        let d = self.sparse_pages[sparse_addr.page as usize].dense_index[sparse_addr.offset as usize];
        let last = self
            .last_dense_index
            .expect("a live slot implies a non-empty dense side");

        // Step 3: if d != L, move the last dense element into d's slot and
        // fix up its sparse back-reference.
        if d != last {
            let last_addr = self.dense_addr(last);
            let d_addr = self.dense_addr(d);
            let moved_value = self.dense_pages[last_addr.page as usize].values[last_addr.offset as usize]
                .take();
            let moved_sparse_index =
                self.dense_pages[last_addr.page as usize].sparse_index[last_addr.offset as usize];

            self.dense_pages[d_addr.page as usize].values[d_addr.offset as usize] = moved_value;
            self.dense_pages[d_addr.page as usize].sparse_index[d_addr.offset as usize] =
                moved_sparse_index;

            let moved_sparse_addr = paging::from_linear(moved_sparse_index, self.page_size);
            self.sparse_pages[moved_sparse_addr.page as usize].dense_index
                [moved_sparse_addr.offset as usize] = d;
        }

        // Step 4: clear the vacated last dense slot. When `d != L` step 3's
        // `take()` already did this; when `d == L` this is the only clear.
        let last_addr = self.dense_addr(last);
        self.dense_pages[last_addr.page as usize].values[last_addr.offset as usize] = None;

        // Step 5: transition sparse slot S.
        if meta.version().is_max() {
            self.sparse_pages[sparse_addr.page as usize].meta[sparse_addr.offset as usize] =
                meta.with_state(State::Tombstone);
            self.tombstone_count += 1;
        } else {
            self.sparse_pages[sparse_addr.page as usize].meta[sparse_addr.offset as usize] =
                meta.with_state(State::Empty);
            self.free_list.push(key);
        }

        // Step 6: decrement lastDenseIndex and slotCount.
        self.last_dense_index = last.checked_sub(1);
        self.slot_count -= 1;
        self.bump_mutation();
        Ok(true)
    }

    pub fn try_remove(&mut self, key: Key) -> bool {
        self.remove(key).unwrap_or(false)
    }

    pub fn update_version(&self, key: Key) -> Result<Key> {
        let addr = self.sparse_addr(key)?;
        let meta = self.sparse_meta(addr);
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

    pub fn reset(&mut self) {
        debug!("resetting sparse engine");
        self.sparse_pages.truncate(1);
        self.dense_pages.truncate(1);
        if let Some(first) = self.sparse_pages.first_mut() {
            first.clear();
        }
        if let Some(first) = self.dense_pages.first_mut() {
            first.clear();
        }
        self.free_list.clear();
        self.slot_count = 0;
        self.tombstone_count = 0;
        self.last_dense_index = None;
        self.next_fresh_index = 0;
        self.bump_mutation();
    }

    pub fn iter(&self) -> SparseIter<'_, V> {
        SparseIter {
            enumerator: SparseEnumerator::new(self),
        }
    }

    pub fn enumerator(&self) -> SparseEnumerator<'_, V> {
        SparseEnumerator::new(self)
    }
}

impl<V> Default for SparseSlotMap<V> {
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

/// A version-guarded walk over dense indices `0..=last_dense_index`
/// (spec §4.4/§4.6). Because the dense side is packed, this is `O(live)`
/// regardless of how many tombstones exist on the sparse side.
pub struct SparseEnumerator<'a, V> {
    map: &'a SparseSlotMap<V>,
    mutation_at_start: u64,
    next_dense_index: u32,
    current_dense_index: Option<u32>,
    state: CursorState,
}

impl<'a, V> SparseEnumerator<'a, V> {
    fn new(map: &'a SparseSlotMap<V>) -> Self {
        SparseEnumerator {
            map,
            mutation_at_start: map.mutation_version(),
            next_dense_index: 0,
            current_dense_index: None,
            state: CursorState::NotStarted,
        }
    }

    /// Guards against a mutation occurring since the enumerator's snapshot.
    /// Compiled out entirely when the `strict-checks` feature is disabled
    /// (spec §6's release-build toggle); the enumerator then walks the
    /// current dense-index state without comparing mutation counters.
    fn check_fresh(&self) -> Result<()> {
        #[cfg(feature = "strict-checks")]
        if self.map.mutation_version() != self.mutation_at_start {
            return Err(SlotMapError::new(ErrorKind::EnumerationInvalidated));
        }
        Ok(())
    }

    pub fn step(&mut self) -> Result<bool> {
        if let Err(err) = self.check_fresh() {
            self.state = CursorState::Exhausted;
            return Err(err);
        }
        let within_range = match self.map.last_dense_index {
            Some(last) => self.next_dense_index <= last,
            None => false,
        };
        if !within_range {
            self.state = CursorState::Exhausted;
            return Ok(false);
        }
        self.current_dense_index = Some(self.next_dense_index);
        self.next_dense_index += 1;
        self.state = CursorState::Positioned;
        Ok(true)
    }

    pub fn current(&self) -> Result<(Key, &'a V)> {
        if self.state != CursorState::Positioned {
            return Err(SlotMapError::new(ErrorKind::EnumerationMisuse));
        }
        let dense_index = self
            .current_dense_index
            .expect("positioned cursor always has a dense index");
        let dense_addr = self.map.dense_addr(dense_index);
        let sparse_index =
            self.map.dense_pages[dense_addr.page as usize].sparse_index[dense_addr.offset as usize];
        let sparse_addr = paging::from_linear(sparse_index, self.map.page_size);
        let meta = self.map.sparse_meta(sparse_addr);
        let key = Key::new(sparse_index, meta.version());
        let value = self.map.dense_pages[dense_addr.page as usize].values[dense_addr.offset as usize]
            .as_ref()
            .expect("live dense slot always holds a value");
        Ok((key, value))
    }

    pub fn reset(&mut self) -> Result<()> {
        self.check_fresh()?;
        self.next_dense_index = 0;
        self.current_dense_index = None;
        self.state = CursorState::NotStarted;
        Ok(())
    }
}

pub struct SparseIter<'a, V> {
    enumerator: SparseEnumerator<'a, V>,
}

impl<'a, V> Iterator for SparseIter<'a, V> {
    type Item = (Key, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        match self.enumerator.step() {
            Ok(true) => Some(self.enumerator.current().expect("just positioned")),
            Ok(false) => None,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<'a, V> IntoIterator for &'a SparseSlotMap<V> {
    type Item = (Key, &'a V);
    type IntoIter = SparseIter<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_map() -> SparseSlotMap<char> {
        SparseSlotMap::with_config(SlotMapConfig::new(4, 2)).unwrap()
    }

    #[test]
    fn swap_remove_preserves_packing() {
        let mut map = small_map();
        let a = map.add('A').unwrap();
        let b = map.add('B').unwrap();
        let c = map.add('C').unwrap();
        let d = map.add('D').unwrap();
        let e = map.add('E').unwrap();

        map.remove(b).unwrap();

        assert_eq!(map.last_dense_index, Some(3));
        let values: Vec<char> = map.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec!['A', 'E', 'C', 'D']);

        let _ = (a, c, d, e);
    }

    #[test]
    fn enumerator_fails_fast_on_mutation() {
        let mut map = small_map();
        map.add('X').unwrap();
        map.add('Y').unwrap();
        map.add('Z').unwrap();
        let mut en = map.enumerator();
        assert!(en.step().unwrap());
        map.add('W').unwrap();
        assert!(matches!(
            en.step().unwrap_err().kind(),
            ErrorKind::EnumerationInvalidated
        ));
    }

    #[test]
    fn dense_packing_invariant_holds() {
        let mut map = small_map();
        let keys: Vec<Key> = (0..6)
            .map(|i| map.add((b'a' + i) as char).unwrap())
            .collect();
        map.remove(keys[1]).unwrap();
        map.remove(keys[3]).unwrap();

        for dense_index in 0..=map.last_dense_index.unwrap() {
            let dense_addr = map.dense_addr(dense_index);
            let sparse_index =
                map.dense_pages[dense_addr.page as usize].sparse_index[dense_addr.offset as usize];
            let sparse_addr = paging::from_linear(sparse_index, map.page_size);
            assert_eq!(
                map.sparse_pages[sparse_addr.page as usize].dense_index[sparse_addr.offset as usize],
                dense_index
            );
            assert!(map.sparse_meta(sparse_addr).state().is_occupied());
        }
    }

    #[test]
    fn iteration_count_matches_slot_count() {
        let mut map = small_map();
        for i in 0..7 {
            map.add(('a' as u8 + i) as char).unwrap();
        }
        assert_eq!(map.iter().count() as u32, map.slot_count());
    }
}
