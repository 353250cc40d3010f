//! The eviction policy chosen for [`super::Cache`]: plain least-recently-used.
//!
//! spec.md §9 notes the source ships two cache flavors, `cache<>` (CAR) and
//! `cache_car<>`/`cache_mt`, and leaves the choice to the implementer. CAR's
//! benefit over LRU is resistance to scan-pollution (a big sequential read
//! or `fsck`-style walk evicting the working set); this archive format's
//! access pattern is dominated by the index and a handful of open files, so
//! that advantage doesn't pay for CAR's extra ghost-list bookkeeping here.
//! The access log in [`super::Cache`] already gives every page a recency
//! position; this module only names the constant that tunes it.

/// Default cache capacity in pages, used by [`crate::config::ArchiveConfig`]
/// when the caller doesn't override it. ~32 MiB at the archive's 32 KiB
/// sector size.
pub const DEFAULT_CAPACITY_PAGES: usize = 1024;
