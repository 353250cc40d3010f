//! Archive-level tuning knobs (spec.md §D of `SPEC_FULL.md`): cache sizes,
//! host-file growth chunk size, background thread-pool size, and the
//! [`CryptoProvider`] implementation to use. spec.md leaves these
//! parametric; this crate expresses them as runtime configuration rather
//! than fixed compile-time constants, since this archive targets a hosted
//! desktop/server environment rather than a fixed embedded target.

use std::sync::Arc;

use crate::crypto::{Aes256GcmSivProvider, CryptoProvider};

/// Default number of leaf pages held by a user file's concurrent sector
/// tree cache (spec.md §4.5 names `N` in the 64-1024 range).
pub const DEFAULT_LEAF_CACHE_PAGES: usize = crate::cache::lru::DEFAULT_CAPACITY_PAGES;

/// Default host-file growth chunk, in sectors, for [`crate::allocator::SectorAllocator::alloc_one`]'s
/// bounded grow-on-exhaustion path.
pub const DEFAULT_GROWTH_CHUNK_SECTORS: u64 = 64;

/// Default size of the page-aligned I/O buffer pool (spec.md §9's
/// "Memory management strategy" note).
pub const DEFAULT_IO_POOL_SIZE: usize = 16;

/// Default background thread-pool size backing `Cache::sync_all`
/// write-back and `Archive::commit`'s per-file sync fan-out.
pub const DEFAULT_THREAD_POOL_SIZE: usize = 4;

/// Runtime tunables for an open or newly created archive. Construct via
/// [`ArchiveConfig::default`] and adjust with the builder methods, or
/// build one field at a time.
#[derive(Clone)]
pub struct ArchiveConfig {
    pub leaf_cache_pages: usize,
    pub growth_chunk_sectors: u64,
    pub io_pool_size: usize,
    pub thread_pool_size: usize,
    pub provider: Arc<dyn CryptoProvider>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            leaf_cache_pages: DEFAULT_LEAF_CACHE_PAGES,
            growth_chunk_sectors: DEFAULT_GROWTH_CHUNK_SECTORS,
            io_pool_size: DEFAULT_IO_POOL_SIZE,
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            provider: Arc::new(Aes256GcmSivProvider::new()),
        }
    }
}

impl ArchiveConfig {
    pub fn with_leaf_cache_pages(mut self, pages: usize) -> Self {
        self.leaf_cache_pages = pages.max(1);
        self
    }

    pub fn with_growth_chunk_sectors(mut self, sectors: u64) -> Self {
        self.growth_chunk_sectors = sectors.max(1);
        self
    }

    pub fn with_io_pool_size(mut self, size: usize) -> Self {
        self.io_pool_size = size.max(1);
        self
    }

    pub fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = size.max(1);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn CryptoProvider>) -> Self {
        self.provider = provider;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_minimums() {
        let cfg = ArchiveConfig::default();
        assert!(cfg.leaf_cache_pages >= 1);
        assert!(cfg.growth_chunk_sectors >= 1);
    }

    #[test]
    fn builder_methods_clamp_to_nonzero() {
        let cfg = ArchiveConfig::default().with_leaf_cache_pages(0).with_growth_chunk_sectors(0);
        assert_eq!(cfg.leaf_cache_pages, 1);
        assert_eq!(cfg.growth_chunk_sectors, 1);
    }
}
