//! The double-buffered archive header (spec.md §3, §4.2, §6): a sealed
//! CBOR map carrying the filesystem index's and free-sector index's file
//! descriptors plus an archive-secret counter and a journal counter.
//!
//! Two slots ("first"/"second") alternate on every [`ArchiveHeader::seal`]
//! call; selection on open picks the slot with the larger
//! `archive_secret_counter`, comparing via the crypto provider's
//! constant-time compare (spec.md §4.2).

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::crypto::{kdf, CborBox, CryptoProvider};
use crate::descriptor::FileDescriptor;
use crate::error::{Error, Result, VefsError};

#[derive(Clone)]
pub struct ArchiveHeader {
    pub fs_index: FileDescriptor,
    pub free_index: FileDescriptor,
    pub archive_secret_counter: [u8; 16],
    pub journal_counter: [u8; 16],
}

#[derive(Serialize, Deserialize)]
struct Wire {
    #[serde(rename = "0")]
    version: u32,
    #[serde(rename = "1")]
    fs_index: ByteBuf,
    #[serde(rename = "2")]
    free_index: ByteBuf,
    #[serde(rename = "3")]
    archive_secret_counter: ByteBuf,
    #[serde(rename = "4")]
    journal_counter: ByteBuf,
}

fn malformed() -> Error {
    Error::from(VefsError::CorruptIndexEntry)
}

impl ArchiveHeader {
    fn to_plaintext(&self) -> Result<Vec<u8>> {
        let wire = Wire {
            version: 0,
            fs_index: ByteBuf::from(self.fs_index.encode_cbor()?),
            free_index: ByteBuf::from(self.free_index.encode_cbor()?),
            archive_secret_counter: ByteBuf::from(self.archive_secret_counter.to_vec()),
            journal_counter: ByteBuf::from(self.journal_counter.to_vec()),
        };
        let mut out = Vec::new();
        ciborium::into_writer(&wire, &mut out).map_err(|_| malformed())?;
        Ok(out)
    }

    fn from_plaintext(bytes: &[u8]) -> Result<Self> {
        let wire: Wire = ciborium::from_reader(bytes).map_err(|_| malformed())?;
        if wire.archive_secret_counter.len() != 16 || wire.journal_counter.len() != 16 {
            return Err(malformed());
        }
        let mut archive_secret_counter = [0u8; 16];
        archive_secret_counter.copy_from_slice(&wire.archive_secret_counter);
        let mut journal_counter = [0u8; 16];
        journal_counter.copy_from_slice(&wire.journal_counter);
        Ok(ArchiveHeader {
            fs_index: FileDescriptor::decode_cbor(&wire.fs_index)?,
            free_index: FileDescriptor::decode_cbor(&wire.free_index)?,
            archive_secret_counter,
            journal_counter,
        })
    }

    pub fn seal(&self, provider: &dyn CryptoProvider, master_secret: &[u8; 64], salt: [u8; 32]) -> Result<Vec<u8>> {
        let plaintext = self.to_plaintext()?;
        let mut key_material = vec![0u8; provider.key_material_size()];
        kdf::kdf(&mut key_material, master_secret, &[salt.as_slice()])?;
        let mut ciphertext = vec![0u8; plaintext.len()];
        let mut mac = [0u8; 16];
        provider.box_seal(&mut ciphertext, &mut mac, &key_material, &plaintext)?;
        let encoded = CborBox { salt, mac, ciphertext }.encode()?;
        if encoded.len() as u64 > crate::device::layout::ARCHIVE_HEADER_SLOT_SIZE {
            return Err(VefsError::OversizedStaticHeader.into());
        }
        Ok(encoded)
    }

    pub fn open(provider: &dyn CryptoProvider, master_secret: &[u8; 64], sealed: &[u8]) -> Result<Self> {
        let boxed = CborBox::decode(sealed)?;
        let mut key_material = vec![0u8; provider.key_material_size()];
        kdf::kdf(&mut key_material, master_secret, &[boxed.salt.as_slice()])?;
        let mut plaintext = vec![0u8; boxed.ciphertext.len()];
        provider.box_open(&mut plaintext, &key_material, &boxed.ciphertext, &boxed.mac)?;
        Self::from_plaintext(&plaintext)
    }
}

/// The result of the open-path header selection rule (spec.md §4.2).
pub struct SelectedHeader {
    pub header: ArchiveHeader,
    /// `false` selects slot 0 ("first"), `true` selects slot 1 ("second") —
    /// used so the next `update_header` alternates away from it.
    pub selected_slot1: bool,
}

pub fn select_header(
    provider: &dyn CryptoProvider,
    master_secret: &[u8; 64],
    slot0: &[u8],
    slot1: &[u8],
) -> Result<SelectedHeader> {
    let h0 = ArchiveHeader::open(provider, master_secret, slot0).ok();
    let h1 = ArchiveHeader::open(provider, master_secret, slot1).ok();
    match (h0, h1) {
        (Some(a), Some(b)) => match provider.ct_compare(&a.archive_secret_counter, &b.archive_secret_counter)? {
            std::cmp::Ordering::Equal => Err(VefsError::IdenticalHeaderVersion.into()),
            std::cmp::Ordering::Greater => Ok(SelectedHeader { header: a, selected_slot1: false }),
            std::cmp::Ordering::Less => Ok(SelectedHeader { header: b, selected_slot1: true }),
        },
        (Some(a), None) => Ok(SelectedHeader { header: a, selected_slot1: false }),
        (None, Some(b)) => Ok(SelectedHeader { header: b, selected_slot1: true }),
        (None, None) => Err(VefsError::NoArchiveHeader.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmSivProvider;
    use crate::descriptor::RootInfo;
    use uuid::Uuid;

    fn sample_descriptor(path: &str) -> FileDescriptor {
        FileDescriptor {
            file_id: Uuid::nil(),
            path: path.into(),
            secret: [1u8; 32],
            secret_counter: [0u8; 16],
            root: RootInfo { sector: 1, mac: [2u8; 16], depth: 0, maximum_extent: 0 },
            modification_time: 0,
        }
    }

    fn sample_header(counter: u8) -> ArchiveHeader {
        ArchiveHeader {
            fs_index: sample_descriptor("archive_index"),
            free_index: sample_descriptor("free_block_index"),
            archive_secret_counter: [counter; 16],
            journal_counter: [0u8; 16],
        }
    }

    #[test]
    fn seal_open_round_trip() {
        let provider = Aes256GcmSivProvider::new();
        let header = sample_header(1);
        let sealed = header.seal(&provider, &[4u8; 64], [5u8; 32]).unwrap();
        let opened = ArchiveHeader::open(&provider, &[4u8; 64], &sealed).unwrap();
        assert_eq!(opened.archive_secret_counter, header.archive_secret_counter);
    }

    #[test]
    fn selection_picks_larger_counter() {
        let provider = Aes256GcmSivProvider::new();
        let master = [4u8; 64];
        let older = sample_header(1).seal(&provider, &master, [1u8; 32]).unwrap();
        let newer = sample_header(2).seal(&provider, &master, [2u8; 32]).unwrap();
        let selected = select_header(&provider, &master, &older, &newer).unwrap();
        assert_eq!(selected.header.archive_secret_counter, [2u8; 16]);
        assert!(selected.selected_slot1);
    }

    #[test]
    fn identical_counters_are_rejected() {
        let provider = Aes256GcmSivProvider::new();
        let master = [4u8; 64];
        let a = sample_header(3).seal(&provider, &master, [1u8; 32]).unwrap();
        let b = sample_header(3).seal(&provider, &master, [2u8; 32]).unwrap();
        assert!(matches!(select_header(&provider, &master, &a, &b), Err(e) if matches!(e.kind, VefsError::IdenticalHeaderVersion)));
    }

    #[test]
    fn only_one_slot_decrypting_is_accepted() {
        let provider = Aes256GcmSivProvider::new();
        let master = [4u8; 64];
        let good = sample_header(1).seal(&provider, &master, [1u8; 32]).unwrap();
        let garbage = vec![0xffu8; good.len()];
        let selected = select_header(&provider, &master, &good, &garbage).unwrap();
        assert!(!selected.selected_slot1);
    }

    #[test]
    fn neither_slot_decrypting_is_no_archive_header() {
        let provider = Aes256GcmSivProvider::new();
        let master = [4u8; 64];
        let garbage = vec![0xffu8; 64];
        assert!(matches!(
            select_header(&provider, &master, &garbage, &garbage),
            Err(e) if matches!(e.kind, VefsError::NoArchiveHeader)
        ));
    }
}
