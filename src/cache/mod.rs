//! C5 — the concurrent sector-page cache (spec.md §4.5).
//!
//! spec.md deliberately leaves the eviction policy open ("two implementations
//! satisfy the same contract"); this crate ships the LRU policy (see
//! [`lru`]) rather than CAR, since it gets the same pin/dirty/purge state
//! machine with a much smaller implementation surface. See DESIGN.md.

pub mod lru;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, VefsError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Loading,
    Clean,
    Dirty,
    Purging,
}

struct PageInner<V> {
    status: Status,
    value: Option<V>,
}

struct Page<V> {
    inner: Mutex<PageInner<V>>,
    condvar: Condvar,
    refcount: AtomicUsize,
    generation: AtomicU64,
}

impl<V> Page<V> {
    fn new_loading(generation: u64) -> Arc<Self> {
        Arc::new(Page {
            inner: Mutex::new(PageInner { status: Status::Loading, value: None }),
            condvar: Condvar::new(),
            refcount: AtomicUsize::new(0),
            generation: AtomicU64::new(generation),
        })
    }
}

/// A pinned reference to a cached page. Cloning increments the page's
/// refcount; dropping the last clone decrements it back to zero, at which
/// point the page becomes eligible for eviction or purge again.
pub struct Handle<K, V> {
    key: K,
    page: Arc<Page<V>>,
    generation: u64,
}

impl<K: Clone, V> Clone for Handle<K, V> {
    fn clone(&self) -> Self {
        self.page.refcount.fetch_add(1, Ordering::AcqRel);
        Handle { key: self.key.clone(), page: self.page.clone(), generation: self.generation }
    }
}

impl<K, V> Drop for Handle<K, V> {
    fn drop(&mut self) {
        self.page.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<K, V> Handle<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this handle's generation still matches the page's current
    /// one (a stale handle means the page was purged and reloaded since).
    pub fn is_current(&self) -> bool {
        self.page.generation.load(Ordering::Acquire) == self.generation
    }

    pub fn with_read<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        let guard = self.page.inner.lock();
        f(guard.value.as_ref().expect("pinned page always has a value"))
    }

    /// Marks the page dirty (idempotent) and runs `f` against a mutable
    /// view of the value.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut V) -> R) -> R {
        let mut guard = self.page.inner.lock();
        guard.status = Status::Dirty;
        f(guard.value.as_mut().expect("pinned page always has a value"))
    }

    pub fn is_dirty(&self) -> bool {
        self.page.inner.lock().status == Status::Dirty
    }
}

/// Fixed-capacity concurrent page cache keyed by `K`. `writeback` performs
/// the actual sync of a dirty page's value to its backing store; it is
/// invoked both by explicit [`Cache::sync`] calls and by eviction.
pub struct Cache<K, V> {
    capacity: usize,
    pages: Mutex<HashMap<K, Arc<Page<V>>>>,
    order: Mutex<std::collections::VecDeque<K>>,
    next_generation: AtomicU64,
    writeback: Arc<dyn Fn(&K, &V) -> Result<()> + Send + Sync>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(capacity: usize, writeback: impl Fn(&K, &V) -> Result<()> + Send + Sync + 'static) -> Self {
        Cache {
            capacity: capacity.max(1),
            pages: Mutex::new(HashMap::new()),
            order: Mutex::new(std::collections::VecDeque::new()),
            next_generation: AtomicU64::new(1),
            writeback: Arc::new(writeback),
        }
    }

    fn record_access(&self, key: &K) {
        let mut order = self.order.lock();
        order.push_back(key.clone());
        // Bound the lazily-deduplicated access log: a page's true position
        // is always its *last* occurrence, so trimming the front merely
        // forgets older, superseded entries rather than corrupting order.
        if order.len() > self.capacity * 4 {
            let drop_n = order.len() - self.capacity * 2;
            for _ in 0..drop_n {
                order.pop_front();
            }
        }
    }

    /// O(1) lookup plus atomic pin. Returns `None` if the key is absent,
    /// currently loading, or being purged — never blocks.
    pub fn try_pin(&self, key: &K) -> Option<Handle<K, V>> {
        let page = self.pages.lock().get(key)?.clone();
        let guard = page.inner.lock();
        if guard.status == Status::Loading || guard.status == Status::Purging {
            return None;
        }
        drop(guard);
        page.refcount.fetch_add(1, Ordering::AcqRel);
        let generation = page.generation.load(Ordering::Acquire);
        self.record_access(key);
        Some(Handle { key: key.clone(), page, generation })
    }

    /// Returns a pinned handle, loading the page via `load` if absent.
    /// At-most-one concurrent load per key: a second caller blocks on the
    /// first caller's load rather than running `load` itself.
    pub fn pin_or_load(&self, key: &K, load: impl FnOnce() -> Result<V>) -> Result<Handle<K, V>> {
        loop {
            let (page, is_new) = {
                let mut pages = self.pages.lock();
                if let Some(existing) = pages.get(key) {
                    (existing.clone(), false)
                } else {
                    let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
                    let page = Page::new_loading(generation);
                    pages.insert(key.clone(), page.clone());
                    (page, true)
                }
            };

            if is_new {
                match load() {
                    Ok(value) => {
                        let mut guard = page.inner.lock();
                        guard.status = Status::Clean;
                        guard.value = Some(value);
                        page.refcount.fetch_add(1, Ordering::AcqRel);
                        drop(guard);
                        page.condvar.notify_all();
                        self.record_access(key);
                        self.maybe_evict(key);
                        let generation = page.generation.load(Ordering::Acquire);
                        return Ok(Handle { key: key.clone(), page, generation });
                    }
                    Err(e) => {
                        self.pages.lock().remove(key);
                        page.condvar.notify_all();
                        return Err(e);
                    }
                }
            }

            let mut guard = page.inner.lock();
            loop {
                match guard.status {
                    Status::Loading => {
                        page.condvar.wait(&mut guard);
                    }
                    Status::Purging => {
                        drop(guard);
                        std::thread::yield_now();
                        break;
                    }
                    Status::Clean | Status::Dirty => {
                        page.refcount.fetch_add(1, Ordering::AcqRel);
                        let generation = page.generation.load(Ordering::Acquire);
                        drop(guard);
                        self.record_access(key);
                        return Ok(Handle { key: key.clone(), page, generation });
                    }
                }
                if self.pages.lock().get(key).map(Arc::as_ptr) != Some(Arc::as_ptr(&page)) {
                    // The loader we were waiting on failed and another
                    // caller's load already replaced this slot (or removed
                    // it); restart from scratch.
                    break;
                }
            }
        }
    }

    /// Removes and destroys a page. Fails with `still_in_use` if any handle
    /// is outstanding.
    pub fn purge(&self, key: &K) -> Result<()> {
        let page = {
            let pages = self.pages.lock();
            match pages.get(key) {
                Some(p) => p.clone(),
                None => return Ok(()),
            }
        };
        let mut guard = page.inner.lock();
        if page.refcount.load(Ordering::Acquire) > 0 {
            return Err(VefsError::StillInUse.into());
        }
        guard.status = Status::Purging;
        drop(guard);
        self.pages.lock().remove(key);
        page.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// If `handle`'s page is dirty, writes it back and clears the dirty
    /// flag.
    pub fn sync(&self, handle: &Handle<K, V>) -> Result<()> {
        self.sync_page(&handle.key, &handle.page)
    }

    fn sync_page(&self, key: &K, page: &Arc<Page<V>>) -> Result<()> {
        let mut guard = page.inner.lock();
        if guard.status != Status::Dirty {
            return Ok(());
        }
        let value = guard.value.as_ref().expect("dirty page always has a value");
        (self.writeback)(key, value)?;
        guard.status = Status::Clean;
        Ok(())
    }

    /// Chunked scan: snapshots a bounded batch of currently dirty pages and
    /// syncs each, repeating until no dirty pages remain.
    pub fn sync_all(&self) -> Result<()> {
        const BATCH: usize = 64;
        loop {
            let batch: Vec<(K, Arc<Page<V>>)> = {
                let pages = self.pages.lock();
                pages
                    .iter()
                    .filter(|(_, p)| p.inner.lock().status == Status::Dirty)
                    .take(BATCH)
                    .map(|(k, p)| (k.clone(), p.clone()))
                    .collect()
            };
            if batch.is_empty() {
                return Ok(());
            }
            for (key, page) in &batch {
                self.sync_page(key, page)?;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walks the LRU order, evicting clean-and-unpinned candidates (syncing
    /// dirty ones first) until the cache is back at or under capacity, or
    /// until a full pass finds nothing left evictable.
    fn maybe_evict(&self, _just_inserted: &K) {
        if self.len() <= self.capacity {
            return;
        }
        let candidates: Vec<K> = {
            let order = self.order.lock();
            order.iter().cloned().collect()
        };
        for key in candidates {
            if self.len() <= self.capacity {
                break;
            }
            let page = match self.pages.lock().get(&key).cloned() {
                Some(p) => p,
                None => continue,
            };
            if page.refcount.load(Ordering::Acquire) > 0 {
                continue;
            }
            {
                let status = page.inner.lock().status;
                if status == Status::Loading || status == Status::Purging {
                    continue;
                }
            }
            if self.sync_page(&key, &page).is_err() {
                continue;
            }
            if page.refcount.load(Ordering::Acquire) == 0 {
                self.pages.lock().remove(&key);
                page.generation.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Barrier;

    fn no_op_writeback() -> impl Fn(&u64, &Vec<u8>) -> Result<()> + Send + Sync {
        |_, _| Ok(())
    }

    #[test]
    fn pin_or_load_loads_once_per_key() {
        let cache = Cache::new(4, no_op_writeback());
        let load_count = Arc::new(StdAtomicUsize::new(0));
        let lc = load_count.clone();
        let handle = cache.pin_or_load(&1u64, || {
            lc.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1u8, 2, 3])
        }).unwrap();
        handle.with_read(|v| assert_eq!(v, &vec![1u8, 2, 3]));

        let lc2 = load_count.clone();
        let _handle2 = cache.pin_or_load(&1u64, || {
            lc2.fetch_add(1, Ordering::SeqCst);
            Ok(vec![9u8])
        }).unwrap();
        assert_eq!(load_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn try_pin_misses_on_absent_key() {
        let cache: Cache<u64, Vec<u8>> = Cache::new(4, no_op_writeback());
        assert!(cache.try_pin(&42).is_none());
    }

    #[test]
    fn write_then_sync_clears_dirty() {
        let cache = Cache::new(4, no_op_writeback());
        let handle = cache.pin_or_load(&1u64, || Ok(vec![0u8; 4])).unwrap();
        handle.with_write(|v| v[0] = 7);
        assert!(handle.is_dirty());
        cache.sync(&handle).unwrap();
        assert!(!handle.is_dirty());
    }

    #[test]
    fn purge_fails_while_handle_outstanding() {
        let cache = Cache::new(4, no_op_writeback());
        let handle = cache.pin_or_load(&1u64, || Ok(vec![0u8])).unwrap();
        assert!(cache.purge(&1u64).is_err());
        drop(handle);
        assert!(cache.purge(&1u64).is_ok());
    }

    #[test]
    fn eviction_keeps_cache_at_capacity() {
        let cache = Cache::new(2, no_op_writeback());
        for key in 0..10u64 {
            let handle = cache.pin_or_load(&key, || Ok(vec![0u8])).unwrap();
            drop(handle);
        }
        assert!(cache.len() <= 2);
    }

    #[test]
    fn concurrent_pin_or_load_on_cold_key_loads_exactly_once() {
        let cache = Arc::new(Cache::new(8, no_op_writeback()));
        let load_count = Arc::new(StdAtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let load_count = load_count.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                cache.pin_or_load(&99u64, || {
                    load_count.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    Ok(vec![1u8])
                }).unwrap()
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(load_count.load(Ordering::SeqCst), 1);
    }
}
