//! C10 — the archive handle (spec.md §4.10): the single entry point a user
//! of this crate holds. Owns the two pinned meta-files (filesystem index,
//! free-sector index), the shared [`SectorDevice`] and [`SectorAllocator`],
//! and the table of currently open [`VirtualFile`] handles.
//!
//! Liveness for `erase` is deliberately kept out of C8 ([`FilesystemIndex`]):
//! this type is the one that actually hands out `Arc<VirtualFile>` handles,
//! so it is the one positioned to refuse erasing a path some caller still
//! has open: a top-level handle owns the table of live child handles rather
//! than pushing that bookkeeping down into the storage layer.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::allocator::SectorAllocator;
use crate::config::ArchiveConfig;
use crate::descriptor::{FileDescriptor, RootInfo};
use crate::device::layout::{META_LEAF_PAYLOAD_SIZE, SECTOR_PAYLOAD_SIZE};
use crate::device::SectorDevice;
use crate::error::{Result, VefsError};
use crate::file_crypto::FileCryptoContext;
use crate::index::{FileStat, FilesystemIndex, OpenFlags};
use crate::tree::record::{RecordTable, ENTRIES_PER_SECTOR, SECTOR_REF_SIZE};
use crate::vfile::VirtualFile;

const FREE_INDEX_PATH: &str = "free_block_index";
const FS_INDEX_PATH: &str = "archive_index";

/// Persisted shape of the free-sector index meta-file: a flat list of
/// `(start, length)` runs, one CBOR array per leaf's worth of capacity. In
/// practice the run list for any reasonably-used archive is tiny, so this
/// crate keeps it in a single leaf rather than spreading across many.
fn encode_runs(runs: &[(u64, u64)]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(runs, &mut out).map_err(|_| crate::error::Error::from(VefsError::CorruptIndexEntry))?;
    Ok(out)
}

fn decode_runs(bytes: &[u8]) -> Result<Vec<(u64, u64)>> {
    ciborium::from_reader(bytes).map_err(|_| VefsError::CorruptIndexEntry.into())
}

pub struct Archive {
    device: Arc<SectorDevice>,
    allocator: Arc<SectorAllocator>,
    fs_index: FilesystemIndex,
    free_tree: Mutex<crate::tree::sequential::SequentialSectorTree>,
    fs_descriptor: Mutex<FileDescriptor>,
    free_descriptor: Mutex<FileDescriptor>,
    archive_secret_counter: Mutex<crate::counter::CounterState>,
    journal_counter: Mutex<crate::counter::CounterState>,
    selected_slot1: Mutex<bool>,
    config: ArchiveConfig,
    open_files: Mutex<std::collections::HashMap<String, Arc<VirtualFile>>>,
    commit_pool: threadpool::ThreadPool,
}

impl Archive {
    pub fn create(path: &Path, user_prk: &[u8; 32], config: ArchiveConfig) -> Result<Self> {
        let (device, fs_ctx, free_ctx) = SectorDevice::create(path, user_prk, config.provider.clone(), config.io_pool_size)?;
        let device = Arc::new(device);
        let allocator = Arc::new(SectorAllocator::bootstrap(device.clone(), config.growth_chunk_sectors));

        let fs_index = FilesystemIndex::create_new(device.clone(), fs_ctx.fork(), allocator.clone())?;
        let mut free_tree =
            crate::tree::sequential::SequentialSectorTree::create_new(device.clone(), free_ctx.fork(), &allocator, META_LEAF_PAYLOAD_SIZE)?;

        let fs_root = fs_index.commit()?;
        let encoded_runs = encode_runs(&[])?;
        free_tree.writeable_bytes()[..encoded_runs.len()].copy_from_slice(&encoded_runs);
        let free_root = free_tree.commit(&allocator)?;

        let fs_descriptor = FileDescriptor {
            file_id: Uuid::nil(),
            path: FS_INDEX_PATH.to_string(),
            secret: *fs_ctx.secret(),
            secret_counter: fs_ctx.counter_snapshot().to_le_bytes(),
            root: fs_root,
            modification_time: 0,
        };
        let free_descriptor = FileDescriptor {
            file_id: Uuid::nil(),
            path: FREE_INDEX_PATH.to_string(),
            secret: *free_ctx.secret(),
            secret_counter: free_ctx.counter_snapshot().to_le_bytes(),
            root: free_root,
            modification_time: 0,
        };

        let (secret_counter, journal_counter, selected_slot1) =
            device.update_header(crate::counter::CounterState(0), crate::counter::CounterState(0), true, fs_descriptor.clone(), free_descriptor.clone())?;

        allocator.on_commit()?;

        Ok(Archive {
            device,
            allocator,
            fs_index,
            free_tree: Mutex::new(free_tree),
            fs_descriptor: Mutex::new(fs_descriptor),
            free_descriptor: Mutex::new(free_descriptor),
            archive_secret_counter: Mutex::new(secret_counter),
            journal_counter: Mutex::new(journal_counter),
            selected_slot1: Mutex::new(selected_slot1),
            config: config.clone(),
            open_files: Mutex::new(std::collections::HashMap::new()),
            commit_pool: threadpool::ThreadPool::new(config.thread_pool_size),
        })
    }

    pub fn open(path: &Path, user_prk: &[u8; 32], config: ArchiveConfig) -> Result<Self> {
        let (device, selected) = SectorDevice::open(path, user_prk, config.provider.clone(), config.io_pool_size)?;
        let device = Arc::new(device);
        let session_salt = device.session_salt();

        let fs_descriptor = selected.header.fs_index;
        let free_descriptor = selected.header.free_index;

        let fs_ctx = FileCryptoContext::new(fs_descriptor.secret, crate::counter::CounterState::from_le_bytes(&fs_descriptor.secret_counter), session_salt);
        let free_ctx =
            FileCryptoContext::new(free_descriptor.secret, crate::counter::CounterState::from_le_bytes(&free_descriptor.secret_counter), session_salt);

        let mut free_tree = crate::tree::sequential::SequentialSectorTree::open_lazy(device.clone(), free_ctx, &free_descriptor.root, META_LEAF_PAYLOAD_SIZE)?;
        free_tree.move_to(0, false, None)?;
        let runs = decode_runs(free_tree.bytes())?;
        let allocator = Arc::new(SectorAllocator::from_runs(device.clone(), runs, config.growth_chunk_sectors));

        let fs_index = FilesystemIndex::open_existing(device.clone(), fs_ctx, allocator.clone(), &fs_descriptor.root)?;

        let archive = Archive {
            device,
            allocator,
            fs_index,
            free_tree: Mutex::new(free_tree),
            fs_descriptor: Mutex::new(fs_descriptor),
            free_descriptor: Mutex::new(free_descriptor),
            archive_secret_counter: Mutex::new(crate::counter::CounterState::from_le_bytes(&selected.header.archive_secret_counter)),
            journal_counter: Mutex::new(crate::counter::CounterState::from_le_bytes(&selected.header.journal_counter)),
            selected_slot1: Mutex::new(selected.selected_slot1),
            config: config.clone(),
            open_files: Mutex::new(std::collections::HashMap::new()),
            commit_pool: threadpool::ThreadPool::new(config.thread_pool_size),
        };

        archive.recover_unused_sectors()?;
        Ok(archive)
    }

    /// Validates that the archive opens and every path's descriptor resolves
    /// to a readable root, without mutating anything. Used by the CLI's
    /// `validate` subcommand.
    pub fn validate(path: &Path, user_prk: &[u8; 32], config: ArchiveConfig) -> Result<()> {
        let archive = Self::open(path, user_prk, config)?;
        for p in archive.fs_index.paths() {
            archive.query(&p)?;
        }
        Ok(())
    }

    fn walk_referenced(&self, root: &RootInfo, fctx_secret: &[u8; 32], counter: crate::counter::CounterState, out: &mut HashSet<u64>) -> Result<()> {
        if root.sector == crate::tree::record::NULL_SECTOR {
            return Ok(());
        }
        out.insert(root.sector);
        if root.depth == 0 {
            return Ok(());
        }
        let fctx = FileCryptoContext::new(*fctx_secret, counter, self.device.session_salt());
        let mut stack = vec![(root.sector, root.mac, root.depth)];
        while let Some((sector, mac, layer)) = stack.pop() {
            let mut bytes = vec![0u8; SECTOR_PAYLOAD_SIZE];
            self.device.read_sector(&fctx, sector, &mac, &mut bytes)?;
            let table = RecordTable::new(&bytes[..ENTRIES_PER_SECTOR * SECTOR_REF_SIZE]);
            for i in 0..ENTRIES_PER_SECTOR {
                let child = table.get(i);
                if child.is_null() {
                    continue;
                }
                out.insert(child.sector_id);
                if layer > 1 {
                    stack.push((child.sector_id, child.mac, layer - 1));
                }
            }
        }
        Ok(())
    }

    fn recover_unused_sectors(&self) -> Result<()> {
        let mut referenced = HashSet::new();
        referenced.insert(crate::tree::record::NULL_SECTOR);

        let fs_descriptor = self.fs_descriptor.lock().clone();
        let free_descriptor = self.free_descriptor.lock().clone();
        self.walk_referenced(&fs_descriptor.root, &fs_descriptor.secret, crate::counter::CounterState::from_le_bytes(&fs_descriptor.secret_counter), &mut referenced)?;
        self.walk_referenced(
            &free_descriptor.root,
            &free_descriptor.secret,
            crate::counter::CounterState::from_le_bytes(&free_descriptor.secret_counter),
            &mut referenced,
        )?;
        for p in self.fs_index.paths() {
            if let Some(d) = self.fs_index.lookup(&p) {
                self.walk_referenced(&d.root, &d.secret, crate::counter::CounterState::from_le_bytes(&d.secret_counter), &mut referenced)?;
            }
        }
        self.allocator.recover_unused_sectors(&referenced)
    }

    pub fn personalization(&self) -> Result<Vec<u8>> {
        self.device.personalization()
    }

    pub fn write_personalization(&self, data: &[u8]) -> Result<()> {
        self.device.write_personalization(data)
    }

    pub fn journal_counter(&self) -> crate::counter::CounterState {
        *self.journal_counter.lock()
    }

    pub fn query(&self, path: &str) -> Result<FileStat> {
        self.fs_index.query(path)
    }

    pub fn list(&self) -> Vec<String> {
        self.fs_index.paths()
    }

    /// Opens (creating if `flags` includes `CREATE` and the path is absent)
    /// the named file, returning a shared handle. Multiple opens of the same
    /// path within one archive session share the same [`VirtualFile`].
    pub fn open_file(&self, path: &str, flags: OpenFlags) -> Result<Arc<VirtualFile>> {
        if let Some(existing) = self.open_files.lock().get(path) {
            return Ok(existing.clone());
        }

        let vfile = if let Some(descriptor) = self.fs_index.lookup(path) {
            let fctx = FileCryptoContext::new(descriptor.secret, crate::counter::CounterState::from_le_bytes(&descriptor.secret_counter), self.device.session_salt());
            VirtualFile::open_existing(
                descriptor.file_id,
                self.device.clone(),
                fctx,
                self.allocator.clone(),
                descriptor.root,
                SECTOR_PAYLOAD_SIZE,
                self.config.leaf_cache_pages,
            )?
        } else if flags.contains(OpenFlags::CREATE) {
            let (secret, counter) = self.device.new_file_secret()?;
            let fctx = FileCryptoContext::new(secret, counter, self.device.session_salt());
            let file_id = Uuid::from_bytes({
                let mut bytes = [0u8; 16];
                self.device.provider().random_bytes(&mut bytes)?;
                bytes
            });
            let vfile = VirtualFile::create_new(file_id, self.device.clone(), fctx.fork(), self.allocator.clone(), SECTOR_PAYLOAD_SIZE, self.config.leaf_cache_pages)?;
            let descriptor = FileDescriptor {
                file_id,
                path: path.to_string(),
                secret,
                secret_counter: fctx.counter_snapshot().to_le_bytes(),
                root: vfile.root_info(),
                modification_time: 0,
            };
            self.fs_index.insert_new(descriptor)?;
            vfile
        } else {
            return Err(VefsError::NoSuchFile.into());
        };

        self.open_files.lock().insert(path.to_string(), vfile.clone());
        Ok(vfile)
    }

    /// Removes `path` from the index. Refused with `still_in_use` while a
    /// handle from [`Archive::open_file`] is outstanding, and with
    /// `invalid_argument` if the file was created but never committed.
    pub fn erase(&self, path: &str) -> Result<()> {
        if self.open_files.lock().contains_key(path) {
            return Err(VefsError::StillInUse.into());
        }
        self.fs_index.erase(path)?;
        Ok(())
    }

    /// Closes an open handle without erasing it, dropping this archive's
    /// reference. The handle's data is unaffected; a later [`Archive::commit`]
    /// still flushes whatever was written before close.
    pub fn close_file(&self, path: &str) {
        self.open_files.lock().remove(path);
    }

    /// Global commit (spec.md §4.10): syncs every open file's tree, commits
    /// the filesystem index and free-sector index, publishes the allocator's
    /// staged deallocations, then atomically swaps the archive header.
    /// Per-file syncs run in parallel on the background thread pool; this
    /// call blocks until all of them (and the rest of the sequence) finish.
    pub fn commit(&self) -> Result<()> {
        let open: Vec<Arc<VirtualFile>> = self.open_files.lock().values().cloned().collect();
        let (tx, rx) = std::sync::mpsc::channel();
        let pending = open.len();
        for vfile in open {
            let tx = tx.clone();
            self.commit_pool.execute(move || {
                let result = vfile.commit().map(|root| (vfile.file_id(), root));
                let _ = tx.send(result);
            });
        }
        drop(tx);
        let mut roots = Vec::with_capacity(pending);
        for _ in 0..pending {
            roots.push(rx.recv().map_err(|_| crate::error::Error::from(VefsError::Bad(std::io::Error::other("commit worker vanished"))))??);
        }
        for (file_id, root) in roots {
            if let Some(path) = self.open_files.lock().iter().find(|(_, v)| v.file_id() == file_id).map(|(p, _)| p.clone()) {
                if let Some(mut descriptor) = self.fs_index.lookup(&path) {
                    descriptor.root = root;
                    if let Some(vfile) = self.open_files.lock().get(&path) {
                        descriptor.secret_counter = vfile.secret_counter_snapshot().to_le_bytes();
                    }
                    self.fs_index.update_descriptor(descriptor)?;
                }
            }
        }

        let fs_root = self.fs_index.commit()?;
        {
            let mut fs_descriptor = self.fs_descriptor.lock();
            fs_descriptor.root = fs_root;
        }

        let runs = self.allocator.snapshot_runs();
        let encoded = encode_runs(&runs)?;
        {
            let mut free_tree = self.free_tree.lock();
            free_tree.move_to(0, false, None)?;
            let bytes = free_tree.writeable_bytes();
            if encoded.len() > bytes.len() {
                return Err(VefsError::ResourceExhausted.into());
            }
            bytes[..encoded.len()].copy_from_slice(&encoded);
            bytes[encoded.len()..].fill(0);
            let free_root = free_tree.commit(&self.allocator)?;
            self.free_descriptor.lock().root = free_root;
        }

        self.allocator.on_commit()?;

        let fs_descriptor = self.fs_descriptor.lock().clone();
        let free_descriptor = self.free_descriptor.lock().clone();
        let (secret_counter, journal_counter, selected_slot1) = {
            let secret_counter = *self.archive_secret_counter.lock();
            let journal_counter = *self.journal_counter.lock();
            let selected_slot1 = *self.selected_slot1.lock();
            self.device.update_header(secret_counter, journal_counter, selected_slot1, fs_descriptor, free_descriptor)?
        };
        *self.archive_secret_counter.lock() = secret_counter;
        *self.journal_counter.lock() = journal_counter;
        *self.selected_slot1.lock() = selected_slot1;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmSivProvider;

    fn config() -> ArchiveConfig {
        ArchiveConfig::default().with_provider(Arc::new(Aes256GcmSivProvider::new())).with_growth_chunk_sectors(4).with_io_pool_size(4)
    }

    #[test]
    fn create_then_open_round_trips_with_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.vefs");
        let prk = [9u8; 32];
        {
            let archive = Archive::create(&path, &prk, config()).unwrap();
            assert!(archive.list().is_empty());
        }
        let archive = Archive::open(&path, &prk, config()).unwrap();
        assert!(archive.list().is_empty());
    }

    #[test]
    fn create_write_commit_reopen_reads_back_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.vefs");
        let prk = [9u8; 32];
        {
            let archive = Archive::create(&path, &prk, config()).unwrap();
            let file = archive.open_file("/hello.txt", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
            file.write(b"hello vefs", 0).unwrap();
            archive.commit().unwrap();
        }
        let archive = Archive::open(&path, &prk, config()).unwrap();
        assert_eq!(archive.list(), vec!["/hello.txt".to_string()]);
        let file = archive.open_file("/hello.txt", OpenFlags::READ).unwrap();
        let mut buf = vec![0u8; 10];
        file.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello vefs");
    }

    #[test]
    fn erase_refused_while_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.vefs");
        let prk = [9u8; 32];
        let archive = Archive::create(&path, &prk, config()).unwrap();
        let _file = archive.open_file("/x", OpenFlags::CREATE).unwrap();
        archive.commit().unwrap();
        assert!(archive.erase("/x").is_err());
        archive.close_file("/x");
        archive.erase("/x").unwrap();
    }

    #[test]
    fn wrong_prk_is_rejected_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.vefs");
        Archive::create(&path, &[1u8; 32], config()).unwrap();
        let result = Archive::open(&path, &[2u8; 32], config());
        assert!(result.is_err());
    }
}
