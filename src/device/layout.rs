//! Byte offsets and fixed sizes for the master sector (spec.md §6).
//! Everything here is a compile-time constant: the host file layout is
//! part of the wire contract, not configuration.

/// Fixed on-disk sector size: 2^15.
pub const SECTOR_SIZE: usize = 1 << 15;
/// Per-sector ciphertext payload after the 32-byte salt prefix.
pub const SECTOR_PAYLOAD_SIZE: usize = SECTOR_SIZE - crate::file_crypto::SECTOR_SALT_LEN;
/// Leaf payload for meta-files (filesystem index, free-sector index):
/// slightly smaller than a user leaf to leave room for the meta-file's own
/// block-allocation bitmap; see `index::BITMAP_BYTES` for how this is
/// subdivided.
pub const META_LEAF_PAYLOAD_SIZE: usize = SECTOR_PAYLOAD_SIZE - 32;

pub const MAGIC: &[u8; 16] = b"VEFS-ARCHIVE-v01";

pub const STATIC_HEADER_REGION_START: u64 = 16;
/// Bound named directly in spec.md §6 ("<= 2 KiB").
pub const STATIC_HEADER_REGION_SIZE: u64 = 2048;

pub const PERSONALIZATION_REGION_START: u64 = STATIC_HEADER_REGION_START + STATIC_HEADER_REGION_SIZE;
pub const PERSONALIZATION_SIZE: u64 = 4096;

pub const ARCHIVE_HEADER_SLOT_SIZE: u64 = 2048;
pub const ARCHIVE_HEADER_SLOT0_START: u64 = PERSONALIZATION_REGION_START + PERSONALIZATION_SIZE;
pub const ARCHIVE_HEADER_SLOT1_START: u64 = ARCHIVE_HEADER_SLOT0_START + ARCHIVE_HEADER_SLOT_SIZE;

const _ASSERT_MASTER_FITS_ONE_SECTOR: () =
    assert!(ARCHIVE_HEADER_SLOT1_START + ARCHIVE_HEADER_SLOT_SIZE <= SECTOR_SIZE as u64);

/// Byte offset of sector `id` (id 0 is the master sector, covering the
/// whole first `SECTOR_SIZE` region regardless of how much of it the
/// header/personalization layout above actually uses).
pub fn sector_offset(id: u64) -> u64 {
    id * SECTOR_SIZE as u64
}
