//! C9 — the virtual file (spec.md §4.9): a thin, user-facing random-access
//! byte stream façade over [`ConcurrentSectorTree`] (C6). Positions are
//! translated to sector indices via `position(offset) = offset / leaf_payload`;
//! each sector access copies the requested sub-range out of (or into) the
//! sector it maps to.

use std::sync::Arc;
use uuid::Uuid;

use crate::allocator::SectorAllocator;
use crate::descriptor::RootInfo;
use crate::device::SectorDevice;
use crate::error::Result;
use crate::file_crypto::FileCryptoContext;
use crate::tree::tree_cached::ConcurrentSectorTree;

pub struct VirtualFile {
    file_id: Uuid,
    tree: Arc<ConcurrentSectorTree>,
    leaf_payload_size: usize,
}

impl VirtualFile {
    pub fn create_new(
        file_id: Uuid,
        device: Arc<SectorDevice>,
        fctx: FileCryptoContext,
        allocator: Arc<SectorAllocator>,
        leaf_payload_size: usize,
        leaf_cache_capacity: usize,
    ) -> Result<Arc<Self>> {
        let tree = ConcurrentSectorTree::create_new(device, fctx, allocator, leaf_payload_size, leaf_cache_capacity)?;
        Ok(Arc::new(VirtualFile { file_id, tree, leaf_payload_size }))
    }

    pub fn open_existing(
        file_id: Uuid,
        device: Arc<SectorDevice>,
        fctx: FileCryptoContext,
        allocator: Arc<SectorAllocator>,
        root: RootInfo,
        leaf_payload_size: usize,
        leaf_cache_capacity: usize,
    ) -> Result<Arc<Self>> {
        let tree = ConcurrentSectorTree::open_existing(device, fctx, allocator, root, leaf_payload_size, leaf_cache_capacity)?;
        Ok(Arc::new(VirtualFile { file_id, tree, leaf_payload_size }))
    }

    pub fn file_id(&self) -> Uuid {
        self.file_id
    }

    pub fn maximum_extent(&self) -> u64 {
        self.tree.maximum_extent()
    }

    pub fn root_info(&self) -> RootInfo {
        self.tree.root_info()
    }

    pub fn file_secret(&self) -> &[u8; 32] {
        self.tree.file_secret()
    }

    pub fn secret_counter_snapshot(&self) -> crate::counter::CounterState {
        self.tree.secret_counter_snapshot()
    }

    fn position(&self, offset: u64) -> (u64, usize) {
        let leaf = offset / self.leaf_payload_size as u64;
        let within = (offset % self.leaf_payload_size as u64) as usize;
        (leaf, within)
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, stopping early
    /// (and returning the short count) at the file's current extent. Bytes
    /// beyond the extent are never materialized as a sparse-read zero-fill;
    /// spec.md's "sparse, resizable byte extent" applies within a file's
    /// existing leaves, not past `maximum_extent`.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let extent = self.maximum_extent();
        if offset >= extent {
            return Ok(0);
        }
        let want = buf.len().min((extent - offset) as usize);
        let mut done = 0usize;
        while done < want {
            let (leaf, within) = self.position(offset + done as u64);
            let handle = self.tree.access(leaf)?;
            let n = (self.leaf_payload_size - within).min(want - done);
            handle.with_read(|l| buf[done..done + n].copy_from_slice(&l.bytes[within..within + n]));
            done += n;
        }
        Ok(done)
    }

    /// Writes `buf` at `offset`, growing the tree (and `maximum_extent`) as
    /// needed; never leaves a gap unaddressed (intervening never-written
    /// leaves read back as zero, since every leaf is zero-filled on
    /// allocation).
    ///
    /// `maximum_extent` is advanced to the exact byte count
    /// `offset + buf.len()` when that exceeds the current extent — never
    /// leaf-rounded, so a write that only fills part of a leaf (including
    /// the whole of a depth-0 file, which `descend` never touches the
    /// extent for on its own) is still reflected in `query`/`read`.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut done = 0usize;
        while done < buf.len() {
            let (leaf, within) = self.position(offset + done as u64);
            let handle = self.tree.access_or_create(leaf)?;
            let n = (self.leaf_payload_size - within).min(buf.len() - done);
            handle.with_write(|l| l.bytes[within..within + n].copy_from_slice(&buf[done..done + n]));
            done += n;
        }
        let new_extent = offset + buf.len() as u64;
        if new_extent > self.maximum_extent() {
            self.tree.set_maximum_extent(new_extent);
        }
        Ok(())
    }

    /// Grows or shrinks the file to exactly `size` bytes. Growing allocates
    /// (zero-filled) leaves up to the new extent without writing into them;
    /// shrinking erases every leaf past the new last one.
    pub fn truncate(&self, size: u64) -> Result<()> {
        let current = self.maximum_extent();
        if size == current {
            return Ok(());
        }
        if size > current {
            if size > 0 {
                let last_leaf = (size - 1) / self.leaf_payload_size as u64;
                let first_new = if current == 0 { 0 } else { (current - 1) / self.leaf_payload_size as u64 + 1 };
                for leaf in first_new..=last_leaf {
                    drop(self.tree.access_or_create(leaf)?);
                }
            }
            return Ok(());
        }
        let old_last_leaf = if current == 0 { None } else { Some((current - 1) / self.leaf_payload_size as u64) };
        let new_last_leaf = if size == 0 { None } else { Some((size - 1) / self.leaf_payload_size as u64) };
        if let Some(old_last) = old_last_leaf {
            let start = new_last_leaf.map(|l| l + 1).unwrap_or(0);
            for leaf in (start..=old_last).rev() {
                if leaf == 0 && new_last_leaf.is_none() && size == 0 {
                    // Position 0 is never erased (spec.md §4.6); a zero-size
                    // file keeps its single, now-cleared leaf.
                    let handle = self.tree.access(leaf)?;
                    handle.with_write(|l| l.bytes.iter_mut().for_each(|b| *b = 0));
                    continue;
                }
                self.tree.erase_leaf(leaf)?;
            }
        }
        self.tree.set_maximum_extent(size);
        Ok(())
    }

    pub fn commit(&self) -> Result<RootInfo> {
        self.tree.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmSivProvider;

    fn setup() -> (Arc<SectorDevice>, FileCryptoContext, Arc<SectorAllocator>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vfile.vefs");
        let provider: Arc<dyn crate::crypto::CryptoProvider> = Arc::new(Aes256GcmSivProvider::new());
        let (device, fs_ctx, _free_ctx) = SectorDevice::create(&path, &[2u8; 32], provider, 8).unwrap();
        let device = Arc::new(device);
        let allocator = Arc::new(SectorAllocator::bootstrap(device.clone(), 4));
        std::mem::forget(dir);
        (device, fs_ctx, allocator)
    }

    const LEAF_PAYLOAD: usize = crate::device::layout::SECTOR_PAYLOAD_SIZE;

    #[test]
    fn write_then_read_round_trips() {
        let (device, fctx, allocator) = setup();
        let file = VirtualFile::create_new(Uuid::nil(), device, fctx, allocator, LEAF_PAYLOAD, 16).unwrap();
        let data = b"hello vefs".to_vec();
        file.write(&data, 100).unwrap();
        let mut out = vec![0u8; data.len()];
        let n = file.read(&mut out, 100).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn write_spanning_two_leaves_round_trips() {
        let (device, fctx, allocator) = setup();
        let file = VirtualFile::create_new(Uuid::nil(), device, fctx, allocator, LEAF_PAYLOAD, 16).unwrap();
        let offset = LEAF_PAYLOAD as u64 - 4;
        let data: Vec<u8> = (0..16u8).collect();
        file.write(&data, offset).unwrap();
        let mut out = vec![0u8; data.len()];
        file.read(&mut out, offset).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn truncate_grows_then_shrinks() {
        let (device, fctx, allocator) = setup();
        let file = VirtualFile::create_new(Uuid::nil(), device, fctx, allocator, LEAF_PAYLOAD, 16).unwrap();
        file.truncate(LEAF_PAYLOAD as u64 * 3).unwrap();
        assert_eq!(file.maximum_extent(), LEAF_PAYLOAD as u64 * 3);
        file.truncate(0).unwrap();
        assert_eq!(file.maximum_extent(), 0);
    }

    #[test]
    fn read_past_extent_returns_short_count() {
        let (device, fctx, allocator) = setup();
        let file = VirtualFile::create_new(Uuid::nil(), device, fctx, allocator, LEAF_PAYLOAD, 16).unwrap();
        file.write(b"abcd", 0).unwrap();
        let mut out = vec![0u8; 100];
        let n = file.read(&mut out, 0).unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn commit_persists_writes_across_reopen() {
        let (device, fctx, allocator) = setup();
        let file = VirtualFile::create_new(Uuid::nil(), device.clone(), fctx.fork(), allocator.clone(), LEAF_PAYLOAD, 16).unwrap();
        file.write(b"durable", 0).unwrap();
        let root = file.commit().unwrap();

        let reopened = VirtualFile::open_existing(Uuid::nil(), device, fctx.fork(), allocator, root, LEAF_PAYLOAD, 16).unwrap();
        let mut out = vec![0u8; 7];
        reopened.read(&mut out, 0).unwrap();
        assert_eq!(&out, b"durable");
    }
}
