//! C7 — the sector allocator (spec.md §4.7): a run-length free-block
//! manager. Deallocations are staged and only published into the free map on
//! [`SectorAllocator::on_commit`]; this keeps a sector that is erased and
//! immediately reused within one archive commit from racing a concurrent
//! allocation for the same id.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::SectorDevice;
use crate::error::{Result, VefsError};

struct State {
    /// Free runs keyed by starting sector id, value = run length.
    free_runs: BTreeMap<u64, u64>,
    pending: Vec<(u64, u64)>,
}

impl State {
    fn insert_run(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = start;
        let mut len = len;

        if let Some((&prev_start, &prev_len)) = self.free_runs.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free_runs.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free_runs.get(&(start + len)) {
            self.free_runs.remove(&(start + len));
            len += next_len;
        }
        self.free_runs.insert(start, len);
    }

    fn take_smallest(&mut self) -> Option<u64> {
        let (&start, &len) = self.free_runs.iter().next()?;
        self.free_runs.remove(&start);
        if len > 1 {
            self.free_runs.insert(start + 1, len - 1);
        }
        Some(start)
    }

    fn take_contiguous(&mut self, n: u64) -> Option<u64> {
        let hit = self.free_runs.iter().find(|(_, &len)| len >= n).map(|(&s, &l)| (s, l));
        let (start, len) = hit?;
        self.free_runs.remove(&start);
        if len > n {
            self.free_runs.insert(start + n, len - n);
        }
        Some(start)
    }
}

pub struct SectorAllocator {
    device: Arc<SectorDevice>,
    state: Mutex<State>,
    chunk_size: u64,
}

impl SectorAllocator {
    /// Starts with an empty free map; the first `alloc_one` call grows the
    /// host file by `chunk_size` sectors.
    pub fn bootstrap(device: Arc<SectorDevice>, chunk_size: u64) -> Self {
        SectorAllocator { device, state: Mutex::new(State { free_runs: BTreeMap::new(), pending: Vec::new() }), chunk_size: chunk_size.max(1) }
    }

    /// Reconstructs an allocator from a persisted run list (decoded by the
    /// caller from the free-block-list meta-file).
    pub fn from_runs(device: Arc<SectorDevice>, runs: Vec<(u64, u64)>, chunk_size: u64) -> Self {
        let mut free_runs = BTreeMap::new();
        for (start, len) in runs {
            free_runs.insert(start, len);
        }
        SectorAllocator { device, state: Mutex::new(State { free_runs, pending: Vec::new() }), chunk_size: chunk_size.max(1) }
    }

    fn grow(&self, state: &mut State, at_least: u64) -> Result<()> {
        let amount = self.chunk_size.max(at_least);
        let first_new = self.device.grow_by_chunk(amount)?;
        state.insert_run(first_new, amount);
        Ok(())
    }

    pub fn alloc_one(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if let Some(id) = state.take_smallest() {
            return Ok(id);
        }
        self.grow(&mut state, 1)?;
        state.take_smallest().ok_or_else(|| VefsError::ResourceExhausted.into())
    }

    pub fn alloc_contiguous(&self, n: u64) -> Result<u64> {
        if n == 0 {
            return Err(VefsError::InvalidArgument.into());
        }
        let mut state = self.state.lock();
        if let Some(id) = state.take_contiguous(n) {
            return Ok(id);
        }
        self.grow(&mut state, n)?;
        state.take_contiguous(n).ok_or_else(|| VefsError::ResourceExhausted.into())
    }

    /// Tries to extend reservation `[begin, end)` by `n` sectors in place.
    /// Returns `1` if extended at the tail (`end..end+n`), `-1` if extended
    /// at the head (`begin-n..begin`), `0` if neither side has room.
    pub fn extend(&self, begin: u64, end: u64, n: u64) -> Result<i8> {
        let mut state = self.state.lock();
        if let Some(&len) = state.free_runs.get(&end) {
            if len >= n {
                state.free_runs.remove(&end);
                if len > n {
                    state.free_runs.insert(end + n, len - n);
                }
                return Ok(1);
            }
        }
        if begin >= n {
            if let Some((&run_start, &run_len)) = state.free_runs.range(..begin).next_back() {
                if run_start + run_len == begin && run_len >= n {
                    state.free_runs.remove(&run_start);
                    if run_len > n {
                        state.free_runs.insert(run_start, run_len - n);
                    }
                    return Ok(-1);
                }
            }
        }
        Ok(0)
    }

    pub fn dealloc_one(&self, id: u64) -> Result<()> {
        self.state.lock().pending.push((id, 1));
        Ok(())
    }

    pub fn dealloc_contiguous(&self, begin: u64, len: u64) -> Result<()> {
        if len > 0 {
            self.state.lock().pending.push((begin, len));
        }
        Ok(())
    }

    /// The reallocation policy used when a dirty sector is flushed: always
    /// keep the same sector id (an in-place rewrite rather than a fresh
    /// allocation). Simpler than copy-on-write and sufficient since every
    /// sector write is already authenticated and salted per write.
    pub fn realloc_or_keep(&self, current_id: u64) -> Result<u64> {
        Ok(current_id)
    }

    /// Publishes staged deallocations into the free map, then truncates the
    /// host file if a free run now reaches its tail.
    pub fn on_commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        for (start, len) in pending {
            state.insert_run(start, len);
        }
        let sector_count = self.device.sector_count()?;
        if let Some((&start, &len)) = state.free_runs.range(..).next_back() {
            if start + len == sector_count && start > 0 {
                state.free_runs.remove(&start);
                self.device.truncate_to_sectors(start)?;
            }
        }
        Ok(())
    }

    /// Reclaims any sector in `[1, sector_count)` that is neither in the
    /// free map nor referenced by `referenced` (the union of every file's
    /// tree edges, computed by the caller at archive open).
    pub fn recover_unused_sectors(&self, referenced: &HashSet<u64>) -> Result<()> {
        let sector_count = self.device.sector_count()?;
        let mut state = self.state.lock();
        let known_free: HashSet<u64> = state.free_runs.iter().flat_map(|(&start, &len)| start..start + len).collect();
        let mut leaked: Vec<u64> = (1..sector_count).filter(|id| !known_free.contains(id) && !referenced.contains(id)).collect();
        leaked.sort_unstable();
        let mut i = 0;
        while i < leaked.len() {
            let start = leaked[i];
            let mut len = 1u64;
            while i + 1 < leaked.len() && leaked[i + 1] == start + len {
                len += 1;
                i += 1;
            }
            state.insert_run(start, len);
            i += 1;
        }
        Ok(())
    }

    /// Snapshot of the current free runs, for persisting via C4 into the
    /// free-block-list meta-file.
    pub fn snapshot_runs(&self) -> Vec<(u64, u64)> {
        self.state.lock().free_runs.iter().map(|(&s, &l)| (s, l)).collect()
    }
}
