//! A lock-free hash map with per-bucket separate chaining.
//!
//! Each bucket owns an atomic head pointer to a singly-linked chain of
//! entries; readers never block and never take a lock. Writers retry on
//! CAS failure instead of locking a bucket. Node reclamation is handled
//! by an epoch-based garbage collector (`crossbeam::epoch`) so that a
//! reader mid-traversal can never observe a freed entry.
//!
//! Iteration order is unspecified and not supported: this map answers
//! point queries (`get`/`insert`/`erase`/`contains`), nothing more.
use crossbeam::epoch::{self, Atomic, Owned, Shared};
use crossbeam::utils::{Backoff, CachePadded};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const DEFAULT_BUCKET_COUNT: usize = 1024;

/// Outcome of [`ConcurrentHashMap::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// No entry for the key existed; a new one was created.
    Inserted,
    /// An entry for the key already existed; its value was replaced.
    Updated,
}

struct Entry<K, V> {
    key: K,
    value: Atomic<V>,
    next: Atomic<Entry<K, V>>,
    tombstone: AtomicBool,
}

impl<K, V> Entry<K, V> {
    fn new(key: K, value: V) -> Owned<Self> {
        Owned::new(Entry {
            key,
            value: Atomic::new(value),
            next: Atomic::null(),
            tombstone: AtomicBool::new(false),
        })
    }
}

/// A lock-free concurrent mapping from `K` to `V`.
///
/// The bucket array is fixed at construction time (see §3 of the design:
/// dynamic resizing is explicitly out of scope). Choose a bucket count
/// appropriate to the expected key cardinality up front.
pub struct ConcurrentHashMap<K, V, S = RandomState> {
    buckets: Box<[CachePadded<Atomic<Entry<K, V>>>]>,
    mask: usize,
    size: AtomicUsize,
    hash_builder: S,
}

unsafe impl<K: Send + Sync, V: Send + Sync, S: Send> Send for ConcurrentHashMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for ConcurrentHashMap<K, V, S> {}

impl<K, V> Default for ConcurrentHashMap<K, V, RandomState>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ConcurrentHashMap<K, V, RandomState>
where
    K: Hash + Eq,
{
    /// Creates a map with the default bucket count (1024).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUCKET_COUNT)
    }

    /// Creates a map whose bucket array has at least `capacity` buckets
    /// (rounded up to the next power of two so the bucket index can be
    /// computed with a mask instead of a division).
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, S> ConcurrentHashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates a map with a custom [`BuildHasher`].
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let mut buckets = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            buckets.push(CachePadded::new(Atomic::null()));
        }
        tracing::debug!(bucket_count = capacity, "concurrent hash map created");
        ConcurrentHashMap {
            buckets: buckets.into_boxed_slice(),
            mask: capacity - 1,
            size: AtomicUsize::new(0),
            hash_builder,
        }
    }

    fn bucket_index(&self, key: &K) -> usize {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & self.mask
    }

    fn bucket(&self, key: &K) -> &Atomic<Entry<K, V>> {
        &self.buckets[self.bucket_index(key)]
    }

    /// Inserts `value` for `key`, or replaces the value of an existing,
    /// live entry for `key`. Returns whether a new entry was created or
    /// an existing one was updated.
    pub fn insert(&self, key: K, value: V) -> InsertOutcome
    where
        K: Clone,
    {
        let bucket = self.bucket(&key);
        let guard = &epoch::pin();
        let backoff = Backoff::new();

        let head = bucket.load(Ordering::Acquire, guard);
        if let Some(existing) = self.find_live(head, &key, guard) {
            self.swap_value(existing, value, guard);
            return InsertOutcome::Updated;
        }

        // Key was absent at this observation. Build the entry once and
        // keep retrying the head CAS with a freshly observed `next` link
        // until it succeeds; `Owned<Entry<_>>` is handed back to us on a
        // failed CAS (crossbeam never drops the value you offered it), so
        // no allocation is repeated across retries.
        let mut new_entry = Entry::new(key.clone(), value);
        loop {
            let head = bucket.load(Ordering::Acquire, guard);
            new_entry.next.store(head, Ordering::Relaxed);

            match bucket.compare_exchange_weak(
                head,
                new_entry,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(new_shared) => {
                    self.size.fetch_add(1, Ordering::Relaxed);
                    return self.resolve_duplicate_race(bucket, &key, new_shared, guard);
                }
                Err(e) => {
                    new_entry = e.new;
                    backoff.spin();
                }
            }
        }
    }

    /// After winning the head CAS, repeatedly re-walk the chain: as long
    /// as any other live entry for the same key exists, the entries race
    /// to converge on a single survivor by pointer address, lowest wins.
    /// If `mine` is not the lowest address among the duplicates currently
    /// visible, it self-evicts and lets whichever entry *is* the lowest
    /// clean up the rest. If `mine` is the lowest, it claims and folds in
    /// one other duplicate per pass and re-walks, since more duplicates
    /// (or a new lower-address contender) may still be racing in. This
    /// converges to exactly one live entry regardless of how many threads
    /// raced to insert the same previously-absent key, which a single
    /// one-shot comparison against only the first duplicate found cannot
    /// guarantee once three or more inserts race simultaneously.
    fn resolve_duplicate_race<'g>(
        &self,
        bucket: &Atomic<Entry<K, V>>,
        key: &K,
        mine: Shared<'g, Entry<K, V>>,
        guard: &'g epoch::Guard,
    ) -> InsertOutcome {
        let backoff = Backoff::new();
        let mine_ref = unsafe { mine.as_ref() }.unwrap();

        loop {
            if mine_ref.tombstone.load(Ordering::Acquire) {
                // A lower-address duplicate's pass already claimed and
                // folded us in; nothing left for us to do.
                return InsertOutcome::Updated;
            }

            let head = bucket.load(Ordering::Acquire, guard);
            let mut current = head;
            let mut other = None;
            let mut mine_is_lowest = true;
            while let Some(entry) = unsafe { current.as_ref() } {
                if !entry.tombstone.load(Ordering::Acquire) && entry.key == *key && current != mine {
                    if (current.as_raw() as usize) < (mine.as_raw() as usize) {
                        mine_is_lowest = false;
                    }
                    other = Some(current);
                }
                current = entry.next.load(Ordering::Acquire, guard);
            }

            let other = match other {
                None => return InsertOutcome::Inserted,
                Some(o) => o,
            };

            if !mine_is_lowest {
                tracing::trace!("resolving duplicate-key insert race by self-eviction");
                if mine_ref
                    .tombstone
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Raced with whoever is the true survivor's own pass
                    // claiming us first; either way we are out.
                    return InsertOutcome::Updated;
                }
                self.unlink(bucket, mine, guard);
                self.size.fetch_sub(1, Ordering::Relaxed);
                return InsertOutcome::Updated;
            }

            // We are the lowest address seen so far: claim this one
            // duplicate and fold its value in, then loop to check for any
            // further duplicates (or a lower-address contender that
            // appeared since our last walk).
            let other_ref = unsafe { other.as_ref() }.unwrap();
            if other_ref
                .tombstone
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let other_value = other_ref.value.swap(Shared::null(), Ordering::AcqRel, guard);
                if !other_value.is_null() {
                    let old = mine_ref.value.swap(other_value, Ordering::AcqRel, guard);
                    if !old.is_null() {
                        unsafe { guard.defer_destroy(old) };
                    }
                }
                self.unlink(bucket, other, guard);
                self.size.fetch_sub(1, Ordering::Relaxed);
            }
            // Else someone else already claimed `other` first; just
            // re-walk, our own status is unaffected either way.
            backoff.spin();
        }
    }

    fn find_live<'g>(
        &self,
        mut current: Shared<'g, Entry<K, V>>,
        key: &K,
        guard: &'g epoch::Guard,
    ) -> Option<Shared<'g, Entry<K, V>>> {
        while let Some(entry) = unsafe { current.as_ref() } {
            if !entry.tombstone.load(Ordering::Acquire) && &entry.key == key {
                return Some(current);
            }
            current = entry.next.load(Ordering::Acquire, guard);
        }
        None
    }

    fn swap_value<'g>(&self, entry: Shared<'g, Entry<K, V>>, value: V, guard: &'g epoch::Guard) {
        let entry_ref = unsafe { entry.as_ref() }.unwrap();
        let new_value = Owned::new(value).into_shared(guard);
        let old = entry_ref.value.swap(new_value, Ordering::AcqRel, guard);
        if !old.is_null() {
            unsafe { guard.defer_destroy(old) };
        }
    }

    /// Unlinks `target` from `bucket`'s chain. `target` must already be
    /// tombstoned. A no-op if the structure changed enough that `target`
    /// is no longer reachable (it was already unlinked by a racing
    /// thread, e.g. a concurrent `erase`).
    fn unlink<'g>(&self, bucket: &Atomic<Entry<K, V>>, target: Shared<'g, Entry<K, V>>, guard: &'g epoch::Guard) {
        let backoff = Backoff::new();
        loop {
            let head = bucket.load(Ordering::Acquire, guard);
            if head == target {
                let next = unsafe { target.as_ref() }.unwrap().next.load(Ordering::Acquire, guard);
                match bucket.compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, guard) {
                    Ok(_) => {
                        self.retire(target, guard);
                        return;
                    }
                    Err(_) => {
                        backoff.spin();
                        continue;
                    }
                }
            }

            let mut prev = head;
            let mut found = false;
            loop {
                let prev_ref = match unsafe { prev.as_ref() } {
                    None => break,
                    Some(r) => r,
                };
                let next = prev_ref.next.load(Ordering::Acquire, guard);
                if next == target {
                    let after = unsafe { target.as_ref() }.unwrap().next.load(Ordering::Acquire, guard);
                    match prev_ref.next.compare_exchange(
                        target,
                        after,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(_) => {
                            self.retire(target, guard);
                            return;
                        }
                        Err(_) => {
                            found = true;
                            break;
                        }
                    }
                }
                if next.is_null() {
                    // Not found: already unlinked by someone else.
                    return;
                }
                prev = next;
            }
            if !found {
                return;
            }
            backoff.spin();
        }
    }

    /// Defers reclamation of an unlinked entry and, if it still owns a
    /// live value holder, the holder too (a self-evicted duplicate
    /// transplants its holder onto the survivor first and nulls its own
    /// copy, so this is a no-op for that path).
    fn retire<'g>(&self, target: Shared<'g, Entry<K, V>>, guard: &'g epoch::Guard) {
        let value_ptr = unsafe { target.as_ref() }.unwrap().value.load(Ordering::Acquire, guard);
        if !value_ptr.is_null() {
            unsafe { guard.defer_destroy(value_ptr) };
        }
        unsafe { guard.defer_destroy(target) };
    }

    /// Returns a snapshot copy of the current value for `key`, or `None`
    /// if absent or tombstoned.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let guard = &epoch::pin();
        let head = self.bucket(key).load(Ordering::Acquire, guard);
        let entry = self.find_live(head, key, guard)?;
        let value = unsafe { entry.as_ref() }
            .unwrap()
            .value
            .load(Ordering::Acquire, guard);
        unsafe { value.as_ref() }.cloned()
    }

    /// `true` iff a live entry for `key` exists at the instant of the
    /// check.
    pub fn contains(&self, key: &K) -> bool {
        let guard = &epoch::pin();
        let head = self.bucket(key).load(Ordering::Acquire, guard);
        self.find_live(head, key, guard).is_some()
    }

    /// Removes the live entry for `key` if one exists. Returns `true`
    /// iff `key` was live at the linearization point (the tombstoning
    /// CAS).
    pub fn erase(&self, key: &K) -> bool {
        let bucket = self.bucket(key);
        let guard = &epoch::pin();

        loop {
            let head = bucket.load(Ordering::Acquire, guard);
            let entry = match self.find_live(head, key, guard) {
                None => return false,
                Some(e) => e,
            };
            let tombstone = &unsafe { entry.as_ref() }.unwrap().tombstone;
            match tombstone.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    self.unlink(bucket, entry, guard);
                    self.size.fetch_sub(1, Ordering::Relaxed);
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    /// Live-entry count. Monotone between concurrent modifications, up
    /// to transient skew while an insert/erase race is still resolving.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// `size() == 0`.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The number of buckets backing this map (fixed at construction).
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl<K, V, S> Drop for ConcurrentHashMap<K, V, S> {
    fn drop(&mut self) {
        // `&mut self` means no concurrent access is possible; free
        // directly without pinning an epoch.
        unsafe {
            let guard = epoch::unprotected();
            for bucket in self.buckets.iter() {
                let mut current = bucket.load(Ordering::Relaxed, guard);
                while !current.is_null() {
                    let entry = current.deref();
                    let next = entry.next.load(Ordering::Relaxed, guard);
                    let value = entry.value.load(Ordering::Relaxed, guard);
                    if !value.is_null() {
                        drop(value.into_owned());
                    }
                    drop(current.into_owned());
                    current = next;
                }
            }
        }
    }
}

impl<K, V, S> std::fmt::Debug for ConcurrentHashMap<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentHashMap")
            .field("bucket_count", &self.bucket_count())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::thread;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[test]
    fn insert_then_get_returns_value() {
        let map = ConcurrentHashMap::new();
        assert_eq!(map.insert(1, 100), InsertOutcome::Inserted);
        assert_eq!(map.get(&1), Some(100));
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn second_insert_of_same_key_updates() {
        let map = ConcurrentHashMap::new();
        assert_eq!(map.insert(1, 100), InsertOutcome::Inserted);
        assert_eq!(map.insert(1, 200), InsertOutcome::Updated);
        assert_eq!(map.get(&1), Some(200));
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn erase_then_contains_is_false_and_second_erase_is_false() {
        let map = ConcurrentHashMap::new();
        map.insert(1, 100);
        assert!(map.erase(&1));
        assert!(!map.contains(&1));
        assert!(!map.erase(&1));
        assert_eq!(map.size(), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn erase_of_absent_key_is_false() {
        let map: ConcurrentHashMap<i32, i32> = ConcurrentHashMap::new();
        assert!(!map.erase(&42));
    }

    #[test]
    fn extreme_keys_behave_like_any_other_key() {
        let map = ConcurrentHashMap::new();
        map.insert(String::new(), 1);
        map.insert("x".repeat(10 * 1024), 2);
        assert_eq!(map.get(&String::new()), Some(1));
        assert_eq!(map.get(&"x".repeat(10 * 1024)), Some(2));

        let int_map: ConcurrentHashMap<i64, i64> = ConcurrentHashMap::new();
        int_map.insert(0, 1);
        int_map.insert(i64::MAX, 2);
        int_map.insert(i64::MIN, 3);
        assert_eq!(int_map.get(&0), Some(1));
        assert_eq!(int_map.get(&i64::MAX), Some(2));
        assert_eq!(int_map.get(&i64::MIN), Some(3));
    }

    #[test]
    fn concurrent_same_key_insert_leaves_a_single_live_entry() {
        init_tracing();
        let map: std::sync::Arc<ConcurrentHashMap<i32, i32>> =
            std::sync::Arc::new(ConcurrentHashMap::new());
        thread::scope(|s| {
            for v in 0..8 {
                let map = map.clone();
                s.spawn(move |_| {
                    map.insert(1, v);
                });
            }
        })
        .unwrap();

        assert_eq!(map.size(), 1);
        let value = map.get(&1).unwrap();
        assert!((0..8).contains(&value));
    }

    #[test]
    fn concurrent_same_key_insert_converges_across_repeated_trials() {
        // A single trial can pass by luck even with a broken resolver (the
        // race window is narrow); repeat with a fresh map each time so a
        // resolver that only handles two racing inserts is caught.
        for trial in 0..50 {
            let map: std::sync::Arc<ConcurrentHashMap<i32, i32>> =
                std::sync::Arc::new(ConcurrentHashMap::new());
            thread::scope(|s| {
                for v in 0..16 {
                    let map = map.clone();
                    s.spawn(move |_| {
                        map.insert(1, trial * 100 + v);
                    });
                }
            })
            .unwrap();

            assert_eq!(map.size(), 1, "trial {trial} left a duplicate live entry");
            assert!(map.get(&1).is_some());
        }
    }

    #[test]
    fn concurrent_writers_and_readers_converge() {
        const WRITERS: i32 = 8;
        const KEYS_PER_WRITER: i32 = 1000;

        let map: std::sync::Arc<ConcurrentHashMap<i32, i32>> =
            std::sync::Arc::new(ConcurrentHashMap::with_capacity(4096));
        thread::scope(|s| {
            for w in 0..WRITERS {
                let map = map.clone();
                s.spawn(move |_| {
                    for k in (w * KEYS_PER_WRITER)..(w * KEYS_PER_WRITER + KEYS_PER_WRITER) {
                        map.insert(k, k * 2);
                    }
                });
            }
            for _ in 0..WRITERS {
                let map = map.clone();
                s.spawn(move |_| {
                    for k in 0..(WRITERS * KEYS_PER_WRITER) {
                        let _ = map.get(&k);
                        let _ = map.contains(&k);
                    }
                });
            }
        })
        .unwrap();

        for k in 0..(WRITERS * KEYS_PER_WRITER) {
            assert_eq!(map.get(&k), Some(k * 2));
        }
        assert_eq!(map.size(), (WRITERS * KEYS_PER_WRITER) as usize);
    }

    proptest::proptest! {
        #[test]
        fn insert_get_roundtrip(k: i32, v1: i32, v2: i32) {
            let map = ConcurrentHashMap::new();
            map.insert(k, v1);
            proptest::prop_assert_eq!(map.get(&k), Some(v1));
            map.insert(k, v2);
            proptest::prop_assert_eq!(map.get(&k), Some(v2));
        }
    }
}
