//! C6 — the concurrent sector tree (spec.md §4.6): the same radix tree as
//! [`super::sequential`], but safe for many readers and writers to share one
//! file's tree at once.
//!
//! Internal/root nodes are bounded tightly by `MAX_DEPTH = 5` (at most
//! `1 + FANOUT + FANOUT^2 + ...` of them regardless of how large the file
//! grows) so this tree keeps them in a small always-resident table rather
//! than cycling them through [`crate::cache::Cache`]; only leaf pages, which
//! dominate a large file's memory footprint, go through the evicting cache.
//! This sidesteps the classic hazard of an evicted ancestor losing the
//! in-flight mac update a dirty descendant needs to propagate upward — see
//! DESIGN.md.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::allocator::SectorAllocator;
use crate::cache::{Cache, Handle};
use crate::descriptor::RootInfo;
use crate::device::layout::SECTOR_PAYLOAD_SIZE;
use crate::device::SectorDevice;
use crate::error::Result;
use crate::error::VefsError;
use crate::file_crypto::FileCryptoContext;
use crate::tree::position::{TreePosition, MAX_DEPTH};
use crate::tree::record::{RecordTable, RecordTableMut, SectorRef, ENTRIES_PER_SECTOR, SECTOR_REF_SIZE};

struct InnerNode {
    sector_id: u64,
    mac: [u8; 16],
    bytes: Vec<u8>,
    dirty: bool,
}

/// A cached leaf page: the value type the evicting [`Cache`] stores.
pub struct LeafNode {
    pub sector_id: u64,
    pub bytes: Vec<u8>,
}

pub type LeafHandle = Handle<TreePosition, LeafNode>;

pub struct ConcurrentSectorTree {
    device: Arc<SectorDevice>,
    fctx: FileCryptoContext,
    allocator: Arc<SectorAllocator>,
    leaf_payload_size: usize,
    root: Mutex<RootInfo>,
    inner: Mutex<HashMap<TreePosition, InnerNode>>,
    leaves: Cache<TreePosition, LeafNode>,
}

impl ConcurrentSectorTree {
    pub fn create_new(
        device: Arc<SectorDevice>,
        fctx: FileCryptoContext,
        allocator: Arc<SectorAllocator>,
        leaf_payload_size: usize,
        leaf_cache_capacity: usize,
    ) -> Result<Arc<Self>> {
        let leaf_id = allocator.alloc_one()?;
        let bytes = vec![0u8; leaf_payload_size];
        let mac = device.write_sector(&fctx, leaf_id, &bytes)?;
        let root = RootInfo { sector: leaf_id, mac, depth: 0, maximum_extent: 0 };
        Ok(Self::new_arc(device, fctx, allocator, leaf_payload_size, root, leaf_cache_capacity))
    }

    pub fn open_existing(
        device: Arc<SectorDevice>,
        fctx: FileCryptoContext,
        allocator: Arc<SectorAllocator>,
        root: RootInfo,
        leaf_payload_size: usize,
        leaf_cache_capacity: usize,
    ) -> Result<Arc<Self>> {
        Ok(Self::new_arc(device, fctx, allocator, leaf_payload_size, root, leaf_cache_capacity))
    }

    fn new_arc(
        device: Arc<SectorDevice>,
        fctx: FileCryptoContext,
        allocator: Arc<SectorAllocator>,
        leaf_payload_size: usize,
        root: RootInfo,
        leaf_cache_capacity: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            ConcurrentSectorTree {
                device,
                fctx,
                allocator,
                leaf_payload_size,
                root: Mutex::new(root),
                inner: Mutex::new(HashMap::new()),
                leaves: Cache::new(leaf_cache_capacity, move |pos, leaf| {
                    let Some(tree) = weak.upgrade() else { return Ok(()) };
                    let mac = tree.device.write_sector(&tree.fctx, leaf.sector_id, &leaf.bytes)?;
                    tree.propagate_leaf_mac(*pos, mac)
                }),
            }
        })
    }

    pub fn depth(&self) -> u8 {
        self.root.lock().depth
    }

    pub fn maximum_extent(&self) -> u64 {
        self.root.lock().maximum_extent
    }

    pub fn root_info(&self) -> RootInfo {
        self.root.lock().clone()
    }

    /// Overrides `maximum_extent` directly. The tree itself has no notion of
    /// how many bytes within a leaf are meaningful, so every caller that
    /// changes the file's logical size — `VirtualFile::write` growing it,
    /// `VirtualFile::truncate` growing or shrinking it — computes the exact
    /// byte count and sets it here explicitly.
    pub fn set_maximum_extent(&self, extent: u64) {
        self.root.lock().maximum_extent = extent;
    }

    /// The file secret this tree's sectors are sealed under. Unchanging for
    /// the life of the file; persisted verbatim in its descriptor.
    pub fn file_secret(&self) -> &[u8; 32] {
        self.fctx.secret()
    }

    /// A snapshot of the file's nonce counter, to persist into the
    /// descriptor at commit time so the next session resumes past every
    /// nonce this one has used.
    pub fn secret_counter_snapshot(&self) -> crate::counter::CounterState {
        self.fctx.counter_snapshot()
    }

    fn read_bytes(&self, sector_id: u64, mac: &[u8; 16], payload_size: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; payload_size];
        self.device.read_sector(&self.fctx, sector_id, mac, &mut bytes)?;
        Ok(bytes)
    }

    /// Grows the tree (serialized by holding `root`'s lock for the whole
    /// operation) until it can address `leaf_index`, then returns the
    /// resulting depth.
    fn ensure_depth(&self, leaf_index: u64, create: bool) -> Result<u8> {
        let required = TreePosition::minimum_depth_for(leaf_index);
        let mut root = self.root.lock();
        if required <= root.depth {
            return Ok(root.depth);
        }
        if !create {
            return Err(VefsError::SectorReferenceOutOfRange.into());
        }
        if required > MAX_DEPTH {
            return Err(VefsError::ResourceExhausted.into());
        }
        while root.depth < required {
            let new_root_id = self.allocator.alloc_one()?;
            let mut bytes = vec![0u8; SECTOR_PAYLOAD_SIZE];
            {
                let mut table = RecordTableMut::new(&mut bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
                table.set(0, SectorRef { sector_id: root.sector, mac: root.mac });
            }
            let mac = self.device.write_sector(&self.fctx, new_root_id, &bytes)?;
            let new_depth = root.depth + 1;
            self.inner.lock().insert(TreePosition::root(new_depth), InnerNode { sector_id: new_root_id, mac, bytes, dirty: false });
            *root = RootInfo { sector: new_root_id, mac, depth: new_depth, maximum_extent: root.maximum_extent };
        }
        Ok(root.depth)
    }

    fn ensure_inner_resident(&self, pos: TreePosition) -> Result<()> {
        if self.inner.lock().contains_key(&pos) {
            return Ok(());
        }
        let (sector, mac) = {
            let root = self.root.lock();
            debug_assert_eq!(pos, TreePosition::root(root.depth));
            (root.sector, root.mac)
        };
        let bytes = self.read_bytes(sector, &mac, SECTOR_PAYLOAD_SIZE)?;
        self.inner.lock().entry(pos).or_insert(InnerNode { sector_id: sector, mac, bytes, dirty: false });
        Ok(())
    }

    fn ensure_inner_child_loaded(&self, pos: TreePosition, r: SectorRef) -> Result<()> {
        if self.inner.lock().contains_key(&pos) {
            return Ok(());
        }
        let bytes = self.read_bytes(r.sector_id, &r.mac, SECTOR_PAYLOAD_SIZE)?;
        self.inner.lock().entry(pos).or_insert(InnerNode { sector_id: r.sector_id, mac: r.mac, bytes, dirty: false });
        Ok(())
    }

    fn descend(&self, leaf_index: u64, create: bool) -> Result<LeafHandle> {
        let depth = self.ensure_depth(leaf_index, create)?;
        if depth == 0 {
            let root = self.root.lock().clone();
            return self.leaves.pin_or_load(&TreePosition::leaf(0), || {
                Ok(LeafNode { sector_id: root.sector, bytes: self.read_bytes(root.sector, &root.mac, self.leaf_payload_size)? })
            });
        }

        let leaf_to_root = TreePosition::leaf(leaf_index).chain_to_root(depth);
        let root_to_leaf: Vec<(TreePosition, usize)> = leaf_to_root.into_iter().rev().collect();
        self.ensure_inner_resident(root_to_leaf[0].0)?;

        for i in 1..root_to_leaf.len() {
            let parent_pos = root_to_leaf[i - 1].0;
            let (node_pos, offset) = root_to_leaf[i];
            let is_leaf = node_pos.layer == 0;

            let child_ref = {
                let mut inner = self.inner.lock();
                let parent = inner.get_mut(&parent_pos).expect("parent resident by construction");
                let existing = RecordTable::new(&parent.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]).get(offset);
                if existing.is_null() {
                    if !create {
                        return Err(VefsError::SectorReferenceOutOfRange.into());
                    }
                    None
                } else {
                    Some(existing)
                }
            };

            let child_ref = match child_ref {
                Some(r) => r,
                None => {
                    let new_id = self.allocator.alloc_one()?;
                    let payload = if is_leaf { self.leaf_payload_size } else { SECTOR_PAYLOAD_SIZE };
                    let zeros = vec![0u8; payload];
                    let mac = self.device.write_sector(&self.fctx, new_id, &zeros)?;
                    let r = SectorRef { sector_id: new_id, mac };
                    let mut inner = self.inner.lock();
                    let parent = inner.get_mut(&parent_pos).expect("parent resident by construction");
                    let mut table = RecordTableMut::new(&mut parent.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
                    table.set(offset, r);
                    parent.dirty = true;
                    r
                }
            };

            if is_leaf {
                // `maximum_extent` is the true logical byte size, not a
                // leaf-rounded figure; only the caller (`VirtualFile::write`/
                // `truncate`) knows the exact byte count being written, so it
                // alone updates it via `set_maximum_extent`. Touching it here
                // from the leaf index would over-report the size of any
                // partial-leaf write.
                return self.leaves.pin_or_load(&node_pos, || {
                    Ok(LeafNode { sector_id: child_ref.sector_id, bytes: self.read_bytes(child_ref.sector_id, &child_ref.mac, self.leaf_payload_size)? })
                });
            }
            self.ensure_inner_child_loaded(node_pos, child_ref)?;
        }
        unreachable!("chain_to_root always terminates at a leaf")
    }

    pub fn access(&self, leaf_index: u64) -> Result<LeafHandle> {
        self.descend(leaf_index, false)
    }

    pub fn access_or_create(&self, leaf_index: u64) -> Result<LeafHandle> {
        self.descend(leaf_index, true)
    }

    fn propagate_leaf_mac(&self, leaf_pos: TreePosition, mac: [u8; 16]) -> Result<()> {
        let depth = self.root.lock().depth;
        if depth == 0 {
            self.root.lock().mac = mac;
            return Ok(());
        }
        let (parent_pos, offset) = leaf_pos.parent();
        let mut inner = self.inner.lock();
        match inner.get_mut(&parent_pos) {
            Some(parent) => {
                let sector_id = RecordTable::new(&parent.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]).get(offset).sector_id;
                let mut table = RecordTableMut::new(&mut parent.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
                table.set(offset, SectorRef { sector_id, mac });
                parent.dirty = true;
                Ok(())
            }
            // An ancestor of a dirty leaf is never supposed to be absent: it
            // was loaded into `inner` (and never evicted from it) the moment
            // this leaf was first reached. If this fires, a caller is
            // sharing a handle across trees or something else has gone
            // stale; surface it as the internal retry sentinel.
            None => Err(VefsError::DeviceBusy.into()),
        }
    }

    /// Removes the leaf at `leaf_index` and any ancestor left with no other
    /// children, without ever purging the root itself (root collapse is
    /// [`Self::shrink_on_commit`]'s job, run once per commit rather than per
    /// erase).
    pub fn erase_leaf(&self, leaf_index: u64) -> Result<()> {
        let leaf_handle = self.descend(leaf_index, false)?;
        let leaf_sector_id = leaf_handle.with_read(|l| l.sector_id);
        let leaf_pos = *leaf_handle.key();
        drop(leaf_handle);
        self.leaves.purge(&leaf_pos)?;
        self.allocator.dealloc_one(leaf_sector_id)?;

        let depth = self.root.lock().depth;
        if depth == 0 {
            return Ok(());
        }

        let mut pos = TreePosition::leaf(leaf_index);
        loop {
            let (parent_pos, offset) = pos.parent();
            let (all_null, parent_sector_id) = {
                let mut inner = self.inner.lock();
                let node = inner.get_mut(&parent_pos).expect("parent resident by construction");
                let mut table = RecordTableMut::new(&mut node.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
                table.clear(offset);
                node.dirty = true;
                (RecordTable::new(&node.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]).all_null(), node.sector_id)
            };
            if parent_pos.layer == depth || !all_null {
                break;
            }
            self.inner.lock().remove(&parent_pos);
            self.allocator.dealloc_one(parent_sector_id)?;
            pos = parent_pos;
        }
        Ok(())
    }

    fn flush_inner_bottom_up(&self) -> Result<()> {
        loop {
            let next = {
                let inner = self.inner.lock();
                inner.iter().find(|(_, n)| n.dirty).map(|(p, n)| (*p, n.sector_id, n.bytes.clone()))
            };
            let Some((pos, sector_id, bytes)) = next else { return Ok(()) };
            let mac = self.device.write_sector(&self.fctx, sector_id, &bytes)?;
            {
                let mut inner = self.inner.lock();
                if let Some(n) = inner.get_mut(&pos) {
                    n.mac = mac;
                    n.dirty = false;
                }
            }
            let depth = self.root.lock().depth;
            if pos.layer == depth {
                self.root.lock().mac = mac;
                continue;
            }
            let (parent_pos, offset) = pos.parent();
            let mut inner = self.inner.lock();
            if let Some(parent) = inner.get_mut(&parent_pos) {
                let mut table = RecordTableMut::new(&mut parent.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
                table.set(offset, SectorRef { sector_id, mac });
                parent.dirty = true;
            }
        }
    }

    fn shrink_on_commit(&self) -> Result<()> {
        loop {
            let (depth, maximum_extent) = {
                let r = self.root.lock();
                (r.depth, r.maximum_extent)
            };
            if depth == 0 {
                return Ok(());
            }
            let needed = TreePosition::minimum_depth_for(maximum_extent.saturating_sub(1) / self.leaf_payload_size.max(1) as u64);
            if needed >= depth {
                return Ok(());
            }
            let root_pos = TreePosition::root(depth);
            self.ensure_inner_resident(root_pos)?;
            let (only_child, rest_null) = {
                let inner = self.inner.lock();
                let node = inner.get(&root_pos).expect("just ensured resident");
                let table = RecordTable::new(&node.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
                let oc = table.get(0);
                let rn = (1..ENTRIES_PER_SECTOR).all(|i| table.get(i).is_null());
                (oc, rn)
            };
            if !rest_null {
                return Ok(());
            }
            let old_sector = { self.root.lock().sector };
            self.inner.lock().remove(&root_pos);
            self.allocator.dealloc_one(old_sector)?;
            if only_child.is_null() {
                // Every leaf under this root was erased (spec.md §8 S5): there
                // is no surviving child to descend into, so collapse straight
                // to a fresh depth-0 leaf rather than getting stuck one layer
                // above an entirely empty subtree.
                let leaf_id = self.allocator.alloc_one()?;
                let zeros = vec![0u8; self.leaf_payload_size];
                let mac = self.device.write_sector(&self.fctx, leaf_id, &zeros)?;
                let mut root = self.root.lock();
                *root = RootInfo { sector: leaf_id, mac, depth: 0, maximum_extent };
                continue;
            }
            let mut root = self.root.lock();
            *root = RootInfo { sector: only_child.sector_id, mac: only_child.mac, depth: depth - 1, maximum_extent };
        }
    }

    /// Syncs every dirty leaf (which bubbles macs into `inner`), flushes
    /// `inner` bottom-up, collapses the root if it now has only one child,
    /// and returns the resulting `root_info` to persist in the file's
    /// descriptor.
    pub fn commit(&self) -> Result<RootInfo> {
        self.leaves.sync_all()?;
        self.flush_inner_bottom_up()?;
        self.shrink_on_commit()?;
        Ok(self.root.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmSivProvider;
    use crate::tree::position::FANOUT;

    fn setup() -> (Arc<SectorDevice>, FileCryptoContext, Arc<SectorAllocator>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concurrent.vefs");
        let provider: Arc<dyn crate::crypto::CryptoProvider> = Arc::new(Aes256GcmSivProvider::new());
        let (device, fs_ctx, _free_ctx) = SectorDevice::create(&path, &[9u8; 32], provider, 8).unwrap();
        let device = Arc::new(device);
        let allocator = Arc::new(SectorAllocator::bootstrap(device.clone(), 2));
        std::mem::forget(dir);
        (device, fs_ctx, allocator)
    }

    const LEAF_PAYLOAD: usize = crate::device::layout::SECTOR_PAYLOAD_SIZE;

    #[test]
    fn create_new_has_depth_zero() {
        let (device, fctx, allocator) = setup();
        let tree = ConcurrentSectorTree::create_new(device, fctx, allocator, LEAF_PAYLOAD, 16).unwrap();
        assert_eq!(tree.depth(), 0);
    }

    #[test]
    fn writing_past_fanout_grows_depth_to_two() {
        let (device, fctx, allocator) = setup();
        let tree = ConcurrentSectorTree::create_new(device, fctx, allocator, LEAF_PAYLOAD, 16).unwrap();
        let handle = tree.access_or_create(FANOUT).unwrap();
        drop(handle);
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn written_bytes_survive_commit_and_access() {
        let (device, fctx, allocator) = setup();
        let tree = ConcurrentSectorTree::create_new(device, fctx.fork(), allocator, LEAF_PAYLOAD, 16).unwrap();
        let handle = tree.access_or_create(0).unwrap();
        handle.with_write(|leaf| leaf.bytes[0] = 0xCD);
        drop(handle);
        tree.commit().unwrap();

        let handle = tree.access(0).unwrap();
        handle.with_read(|leaf| assert_eq!(leaf.bytes[0], 0xCD));
    }

    #[test]
    fn erase_then_commit_collapses_depth_back_to_zero() {
        let (device, fctx, allocator) = setup();
        let tree = ConcurrentSectorTree::create_new(device, fctx, allocator, LEAF_PAYLOAD, 64).unwrap();
        drop(tree.access_or_create(FANOUT).unwrap());
        assert_eq!(tree.depth(), 2);
        tree.erase_leaf(FANOUT).unwrap();
        tree.commit().unwrap();
        assert_eq!(tree.depth(), 0);
    }

    #[test]
    fn concurrent_writers_to_distinct_leaves_all_survive_commit() {
        let (device, fctx, allocator) = setup();
        let tree = ConcurrentSectorTree::create_new(device, fctx, allocator, LEAF_PAYLOAD, 256).unwrap();
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let tree = tree.clone();
            handles.push(std::thread::spawn(move || {
                let handle = tree.access_or_create(i).unwrap();
                handle.with_write(|leaf| leaf.bytes[0] = i as u8);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        tree.commit().unwrap();
        for i in 0..8u64 {
            let handle = tree.access(i).unwrap();
            handle.with_read(|leaf| assert_eq!(leaf.bytes[0], i as u8));
        }
    }
}
