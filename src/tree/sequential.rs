//! C4 — the sequential sector tree (spec.md §4.4): a single-threaded cursor
//! over one file's radix tree, holding exactly one root-to-leaf chain in
//! memory. Used for the filesystem index and free-sector index, where a
//! full cache is overkill.

use std::sync::Arc;

use crate::allocator::SectorAllocator;
use crate::descriptor::RootInfo;
use crate::device::SectorDevice;
use crate::error::{Error, Result, VefsError};
use crate::file_crypto::FileCryptoContext;
use crate::tree::position::{TreePosition, FANOUT, MAX_DEPTH};
use crate::tree::record::{RecordTable, RecordTableMut, SectorRef, ENTRIES_PER_SECTOR, SECTOR_REF_SIZE};

struct Node {
    sector_id: u64,
    mac: [u8; 16],
    bytes: Vec<u8>,
    dirty: bool,
}

/// A root-to-leaf chain, `chain[0]` the leaf and `chain.last()` the root.
pub struct SequentialSectorTree {
    device: Arc<SectorDevice>,
    fctx: FileCryptoContext,
    leaf_payload_size: usize,
    depth: u8,
    maximum_extent: u64,
    chain: Vec<Node>,
    current_leaf: u64,
}

fn inner_payload_size() -> usize {
    crate::device::layout::SECTOR_PAYLOAD_SIZE
}

impl SequentialSectorTree {
    /// Allocates leaf sector 0 and writes a zero-filled leaf, returning a
    /// tree of depth 0.
    pub fn create_new(
        device: Arc<SectorDevice>,
        fctx: FileCryptoContext,
        allocator: &SectorAllocator,
        leaf_payload_size: usize,
    ) -> Result<Self> {
        let leaf_id = allocator.alloc_one()?;
        let bytes = vec![0u8; leaf_payload_size];
        let mac = device.write_sector(&fctx, leaf_id, &bytes)?;
        Ok(SequentialSectorTree {
            device,
            fctx,
            leaf_payload_size,
            depth: 0,
            maximum_extent: 0,
            chain: vec![Node { sector_id: leaf_id, mac, bytes, dirty: false }],
            current_leaf: 0,
        })
    }

    /// Loads the root and the leaf at position 0.
    pub fn open_existing(
        device: Arc<SectorDevice>,
        fctx: FileCryptoContext,
        root: &RootInfo,
        leaf_payload_size: usize,
    ) -> Result<Self> {
        let mut tree = Self::open_lazy(device, fctx, root, leaf_payload_size)?;
        tree.move_to(0, false, None)?;
        Ok(tree)
    }

    /// Like `open_existing` but defers the first leaf load until `move_to`.
    pub fn open_lazy(
        device: Arc<SectorDevice>,
        fctx: FileCryptoContext,
        root: &RootInfo,
        leaf_payload_size: usize,
    ) -> Result<Self> {
        Ok(SequentialSectorTree {
            device,
            fctx,
            leaf_payload_size,
            depth: root.depth,
            maximum_extent: root.maximum_extent,
            chain: vec![Node { sector_id: root.sector, mac: root.mac, bytes: Vec::new(), dirty: false }],
            current_leaf: 0,
        })
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn maximum_extent(&self) -> u64 {
        self.maximum_extent
    }

    fn read_node(&self, sector_id: u64, mac: &[u8; 16], payload_size: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; payload_size];
        self.device.read_sector(&self.fctx, sector_id, mac, &mut bytes)?;
        Ok(bytes)
    }

    /// Flushes the currently loaded chain's dirty sectors bottom-up and
    /// reloads the chain for `leaf_index`, growing the tree first if
    /// `create` is set and `leaf_index` exceeds the current capacity.
    pub fn move_to(&mut self, leaf_index: u64, create: bool, allocator: Option<&SectorAllocator>) -> Result<()> {
        if leaf_index == self.current_leaf && self.chain.first().map(|n| !n.bytes.is_empty()).unwrap_or(false) {
            return Ok(());
        }
        self.flush_chain(allocator)?;

        let required_depth = TreePosition::minimum_depth_for(leaf_index);
        if required_depth > self.depth {
            if !create {
                return Err(VefsError::SectorReferenceOutOfRange.into());
            }
            self.grow_to_depth(required_depth, allocator.ok_or_else(|| Error::from(VefsError::InvalidArgument))?)?;
        } else if self.chain.is_empty() {
            return Err(VefsError::InvalidArgument.into());
        }

        let root = self.chain.pop().unwrap_or_else(|| unreachable!());
        self.chain.clear();
        let root_payload_size = if self.depth == 0 { self.leaf_payload_size } else { inner_payload_size() };
        let root_bytes = if root.bytes.is_empty() { self.read_node(root.sector_id, &root.mac, root_payload_size)? } else { root.bytes };

        // Walk root-to-leaf into a scratch vec, then reverse: `self.chain`'s
        // documented convention is leaf-first, root-last.
        let mut root_to_leaf = vec![Node { sector_id: root.sector_id, mac: root.mac, bytes: root_bytes, dirty: false }];

        let pos = TreePosition::leaf(leaf_index);
        let chain_positions = pos.chain_to_root(self.depth);
        for (_position, offset) in chain_positions.iter().rev().skip(1) {
            let parent = root_to_leaf.last().expect("root pushed above");
            let table = RecordTable::new(&parent.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
            let mut ref_ = table.get(*offset);
            // A node about to be fetched at this step sits at layer
            // `depth - root_to_leaf.len()`; it is the leaf once
            // `root_to_leaf.len() == depth`.
            let is_leaf_child = root_to_leaf.len() as u8 == self.depth;
            if ref_.is_null() {
                if !create {
                    return Err(VefsError::SectorReferenceOutOfRange.into());
                }
                let alloc = allocator.ok_or_else(|| Error::from(VefsError::InvalidArgument))?;
                let new_id = alloc.alloc_one()?;
                let payload = if is_leaf_child { self.leaf_payload_size } else { inner_payload_size() };
                let zeros = vec![0u8; payload];
                let mac = self.device.write_sector(&self.fctx, new_id, &zeros)?;
                ref_ = SectorRef { sector_id: new_id, mac };
                let parent_idx = root_to_leaf.len() - 1;
                let parent_mut = &mut root_to_leaf[parent_idx];
                let mut table_mut = RecordTableMut::new(&mut parent_mut.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
                table_mut.set(*offset, ref_);
                parent_mut.dirty = true;
            }
            let payload_size = if is_leaf_child { self.leaf_payload_size } else { inner_payload_size() };
            let bytes = self.read_node(ref_.sector_id, &ref_.mac, payload_size)?;
            root_to_leaf.push(Node { sector_id: ref_.sector_id, mac: ref_.mac, bytes, dirty: false });
        }
        root_to_leaf.reverse();
        self.chain = root_to_leaf;
        self.current_leaf = leaf_index;
        self.maximum_extent = self.maximum_extent.max((leaf_index + 1) * self.leaf_payload_size as u64);
        Ok(())
    }

    pub fn move_forward(&mut self, allocator: Option<&SectorAllocator>) -> Result<()> {
        self.move_to(self.current_leaf + 1, allocator.is_some(), allocator)
    }

    pub fn move_backward(&mut self) -> Result<()> {
        if self.current_leaf == 0 {
            return Err(VefsError::SectorReferenceOutOfRange.into());
        }
        self.move_to(self.current_leaf - 1, false, None)
    }

    fn grow_to_depth(&mut self, target_depth: u8, allocator: &SectorAllocator) -> Result<()> {
        if target_depth > MAX_DEPTH {
            return Err(VefsError::ResourceExhausted.into());
        }
        while self.depth < target_depth {
            let old_root = self.chain.pop().unwrap_or_else(|| {
                // a tree always has at least one node (its root) loaded
                unreachable!("sequential tree chain emptied unexpectedly")
            });
            let new_root_id = allocator.alloc_one()?;
            let mut bytes = vec![0u8; inner_payload_size()];
            {
                let mut table = RecordTableMut::new(&mut bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
                table.set(0, SectorRef { sector_id: old_root.sector_id, mac: old_root.mac });
            }
            let mac = self.device.write_sector(&self.fctx, new_root_id, &bytes)?;
            self.depth += 1;
            self.chain = vec![Node { sector_id: new_root_id, mac, bytes, dirty: false }];
        }
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.chain[0].bytes
    }

    /// Returns a mutable view of the current leaf; marking it dirty is
    /// implicit.
    pub fn writeable_bytes(&mut self) -> &mut [u8] {
        self.chain[0].dirty = true;
        &mut self.chain[0].bytes
    }

    /// Releases the leaf at `leaf_index` and any ancestors whose remaining
    /// children are all null. Must be the currently positioned leaf.
    pub fn erase_leaf(&mut self, leaf_index: u64, allocator: &SectorAllocator) -> Result<()> {
        if leaf_index != self.current_leaf {
            self.move_to(leaf_index, false, None)?;
        }
        // offsets[k] is chain[k]'s offset within chain[k+1] (its parent),
        // computed once against the chain as it stood before any removal.
        let offsets: Vec<usize> = TreePosition::leaf(leaf_index).chain_to_root(self.depth).iter().map(|(_, o)| *o).collect();

        let leaf = self.chain.remove(0);
        allocator.dealloc_one(leaf.sector_id)?;

        for &offset in offsets.iter() {
            if self.chain.is_empty() {
                break;
            }
            let parent = &mut self.chain[0];
            let mut table = RecordTableMut::new(&mut parent.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
            table.clear(offset);
            parent.dirty = true;
            if RecordTable::new(&parent.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]).all_null() && self.chain.len() > 1 {
                let dead = self.chain.remove(0);
                allocator.dealloc_one(dead.sector_id)?;
                continue;
            }
            break;
        }
        Ok(())
    }

    fn flush_chain(&mut self, allocator: Option<&SectorAllocator>) -> Result<()> {
        for i in 0..self.chain.len() {
            if !self.chain[i].dirty {
                continue;
            }
            let new_id = match allocator {
                Some(alloc) => alloc.realloc_or_keep(self.chain[i].sector_id)?,
                None => self.chain[i].sector_id,
            };
            let mac = self.device.write_sector(&self.fctx, new_id, &self.chain[i].bytes)?;
            self.chain[i].sector_id = new_id;
            self.chain[i].mac = mac;
            self.chain[i].dirty = false;
            if i + 1 < self.chain.len() {
                let (offset, parent_idx) = {
                    let pos = TreePosition::leaf(self.current_leaf).chain_to_root(self.depth);
                    (pos[i].1, i + 1)
                };
                let parent = &mut self.chain[parent_idx];
                let mut table = RecordTableMut::new(&mut parent.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
                table.set(offset, SectorRef { sector_id: new_id, mac });
                parent.dirty = true;
            }
        }
        Ok(())
    }

    /// Flushes the entire chain bottom-up, applies shrink-on-commit, and
    /// returns the new `root_info`.
    pub fn commit(&mut self, allocator: &SectorAllocator) -> Result<RootInfo> {
        self.flush_chain(Some(allocator))?;
        self.shrink_on_commit(allocator)?;
        let root = self.chain.last().expect("chain always has a root");
        Ok(RootInfo { sector: root.sector_id, mac: root.mac, depth: self.depth, maximum_extent: self.maximum_extent })
    }

    fn shrink_on_commit(&mut self, allocator: &SectorAllocator) -> Result<()> {
        while self.depth > 0 {
            let needed = TreePosition::minimum_depth_for(self.maximum_extent.saturating_sub(1) / self.leaf_payload_size.max(1) as u64);
            if needed >= self.depth {
                break;
            }
            let root = self.chain.last().expect("root present");
            let root_table = RecordTable::new(&root.bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
            let only_child = root_table.get(0);
            let rest_null = (1..ENTRIES_PER_SECTOR).all(|i| root_table.get(i).is_null());
            if !rest_null || only_child.is_null() {
                break;
            }
            let old_root = self.chain.pop().expect("root present");
            allocator.dealloc_one(old_root.sector_id)?;
            self.depth -= 1;
            if self.chain.is_empty() {
                let payload_size = if self.depth == 0 { self.leaf_payload_size } else { inner_payload_size() };
                let bytes = self.read_node(only_child.sector_id, &only_child.mac, payload_size)?;
                self.chain.push(Node { sector_id: only_child.sector_id, mac: only_child.mac, bytes, dirty: false });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmSivProvider;

    fn setup() -> (Arc<SectorDevice>, FileCryptoContext, SectorAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.vefs");
        let provider: Arc<dyn crate::crypto::CryptoProvider> = Arc::new(Aes256GcmSivProvider::new());
        let (device, fs_ctx, _free_ctx) = SectorDevice::create(&path, &[3u8; 32], provider, 8).unwrap();
        let device = Arc::new(device);
        let allocator = SectorAllocator::bootstrap(device.clone(), 1);
        std::mem::forget(dir);
        (device, fs_ctx, allocator)
    }

    #[test]
    fn create_new_tree_has_depth_zero() {
        let (device, fctx, allocator) = setup();
        let tree = SequentialSectorTree::create_new(device, fctx, &allocator, crate::device::layout::META_LEAF_PAYLOAD_SIZE).unwrap();
        assert_eq!(tree.depth(), 0);
    }

    #[test]
    fn growing_past_fanout_increases_depth() {
        let (device, fctx, allocator) = setup();
        let mut tree = SequentialSectorTree::create_new(device, fctx, &allocator, crate::device::layout::META_LEAF_PAYLOAD_SIZE).unwrap();
        tree.move_to(FANOUT, true, Some(&allocator)).unwrap();
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn written_bytes_survive_commit_and_reopen() {
        let (device, fctx, allocator) = setup();
        let mut tree = SequentialSectorTree::create_new(device.clone(), fctx.fork(), &allocator, crate::device::layout::META_LEAF_PAYLOAD_SIZE).unwrap();
        tree.writeable_bytes()[0] = 0xAB;
        let root = tree.commit(&allocator).unwrap();

        let reopened =
            SequentialSectorTree::open_existing(device, fctx.fork(), &root, crate::device::layout::META_LEAF_PAYLOAD_SIZE).unwrap();
        assert_eq!(reopened.bytes()[0], 0xAB);
    }
}
