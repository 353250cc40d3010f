//! `vefs` — an encrypted virtual file system: an authenticated key/value
//! store of named byte streams, backed by a single host file.
//!
//! Every byte written is AEAD-sealed and every sector's authenticity chains
//! up to a doubly-buffered, atomically-swapped archive header (spec.md §3,
//! §4.2). The crate is organized as ten components, C1 through C10, mirroring
//! the archive's own layered structure:
//!
//! - [`crypto`] (C1) — the pluggable AEAD provider and key derivation.
//! - [`device`] (C2) — the host file, its master sector, and sector I/O.
//! - [`file_crypto`] (C3) — per-file secrets and sector sealing.
//! - [`tree`] (C4/C6) — the radix-tree sector trees, sequential and cached.
//! - [`cache`] (C5) — the per-file leaf cache backing [`tree::tree_cached`].
//! - [`allocator`] (C7) — the free-sector run-length allocator.
//! - [`index`] (C8) — the path-to-descriptor filesystem index.
//! - [`vfile`] (C9) — the user-facing random-access file handle.
//! - [`archive`] (C10) — the top-level archive handle tying everything
//!   together.
//!
//! ```no_run
//! use std::path::Path;
//! use vefs::{Archive, ArchiveConfig};
//! use vefs::index::OpenFlags;
//!
//! # fn main() -> vefs::Result<()> {
//! let prk = [0u8; 32];
//! let archive = Archive::create(Path::new("example.vefs"), &prk, ArchiveConfig::default())?;
//! let file = archive.open_file("/hello.txt", OpenFlags::CREATE | OpenFlags::WRITE)?;
//! file.write(b"hello, vefs", 0)?;
//! archive.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod archive;
pub mod cache;
pub mod config;
pub mod counter;
pub mod crypto;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod file_crypto;
pub mod index;
pub mod io_buffer;
pub mod tree;
pub mod vfile;

pub use archive::Archive;
pub use config::ArchiveConfig;
pub use descriptor::{FileDescriptor, RootInfo};
pub use error::{Error, ErrorDetail, Result, VefsError};
pub use index::{FileStat, OpenFlags};
pub use vfile::VirtualFile;
