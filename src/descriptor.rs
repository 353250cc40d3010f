//! The per-file descriptor (spec.md §3, §6): lives inside the archive
//! header (for the two pinned meta-files) or inside the filesystem index
//! (for user files). CBOR map keys follow §6's `file_descriptor` layout
//! exactly, field-for-field.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use uuid::Uuid;

use crate::error::{Error, Result, VefsError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootInfo {
    pub sector: u64,
    pub mac: [u8; 16],
    pub depth: u8,
    pub maximum_extent: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub file_id: Uuid,
    pub path: String,
    pub secret: [u8; 32],
    pub secret_counter: [u8; 16],
    pub root: RootInfo,
    pub modification_time: i64,
}

impl FileDescriptor {
    pub fn maximum_extent(&self) -> u64 {
        self.root.maximum_extent
    }

    pub fn tree_depth(&self) -> u8 {
        self.root.depth
    }
}

/// Wire shape: CBOR map `{1..9}` per spec.md §6. `ciborium` round-trips
/// Rust structs through serde; we key the map explicitly via a parallel
/// wire struct rather than relying on field order, since spec.md pins
/// specific integer keys.
#[derive(Serialize, Deserialize)]
struct Wire {
    #[serde(rename = "1")]
    file_id: ByteBuf,
    #[serde(rename = "2")]
    path: String,
    #[serde(rename = "3")]
    secret: ByteBuf,
    #[serde(rename = "4")]
    secret_counter: ByteBuf,
    #[serde(rename = "5")]
    root_sector: u64,
    #[serde(rename = "6")]
    root_mac: ByteBuf,
    #[serde(rename = "7")]
    maximum_extent: u64,
    #[serde(rename = "8")]
    tree_depth: u8,
    #[serde(rename = "9")]
    modification_time: i64,
}

fn malformed() -> Error {
    Error::from(VefsError::CorruptIndexEntry)
}

impl FileDescriptor {
    pub fn encode_cbor(&self) -> Result<Vec<u8>> {
        let wire = Wire {
            file_id: ByteBuf::from(self.file_id.as_bytes().to_vec()),
            path: self.path.clone(),
            secret: ByteBuf::from(self.secret.to_vec()),
            secret_counter: ByteBuf::from(self.secret_counter.to_vec()),
            root_sector: self.root.sector,
            root_mac: ByteBuf::from(self.root.mac.to_vec()),
            maximum_extent: self.root.maximum_extent,
            tree_depth: self.root.depth,
            modification_time: self.modification_time,
        };
        let mut out = Vec::new();
        ciborium::into_writer(&wire, &mut out).map_err(|_| malformed())?;
        Ok(out)
    }

    pub fn decode_cbor(bytes: &[u8]) -> Result<Self> {
        let wire: Wire = ciborium::from_reader(bytes).map_err(|_| malformed())?;
        if wire.file_id.len() != 16 || wire.secret.len() != 32 || wire.secret_counter.len() != 16 || wire.root_mac.len() != 16 {
            return Err(malformed());
        }
        if wire.tree_depth > crate::tree::position::MAX_DEPTH {
            return Err(malformed());
        }
        let file_id = Uuid::from_slice(&wire.file_id).map_err(|_| malformed())?;
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&wire.secret);
        let mut secret_counter = [0u8; 16];
        secret_counter.copy_from_slice(&wire.secret_counter);
        let mut root_mac = [0u8; 16];
        root_mac.copy_from_slice(&wire.root_mac);
        Ok(FileDescriptor {
            file_id,
            path: wire.path,
            secret,
            secret_counter,
            root: RootInfo { sector: wire.root_sector, mac: root_mac, depth: wire.tree_depth, maximum_extent: wire.maximum_extent },
            modification_time: wire.modification_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileDescriptor {
        FileDescriptor {
            file_id: Uuid::nil(),
            path: "/hello".into(),
            secret: [3u8; 32],
            secret_counter: [4u8; 16],
            root: RootInfo { sector: 9, mac: [5u8; 16], depth: 2, maximum_extent: 123 },
            modification_time: 1_700_000_000,
        }
    }

    #[test]
    fn round_trips() {
        let fd = sample();
        let encoded = fd.encode_cbor().unwrap();
        let decoded = FileDescriptor::decode_cbor(&encoded).unwrap();
        assert_eq!(decoded, fd);
    }

    #[test]
    fn rejects_depth_beyond_max() {
        let mut fd = sample();
        fd.root.depth = crate::tree::position::MAX_DEPTH + 1;
        let encoded = fd.encode_cbor().unwrap();
        assert!(FileDescriptor::decode_cbor(&encoded).is_err());
    }
}
