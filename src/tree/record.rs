//! The 32-byte packed child record stored in every inner sector (spec.md
//! §3): `{sector_id: u64, _pad: 8B, mac: 16B}`. The original C++ stores this
//! as `RawSectorReference`, a struct reinterpreted directly over the sector
//! bytes. Per spec.md §9's Design Notes, this crate keeps the on-disk
//! layout identical but exposes it as a typed record with explicit
//! little-endian accessors rather than relying on pointer reinterpretation.

pub const SECTOR_REF_SIZE: usize = 32;
/// spec.md headlines a fan-out of 1024, but an inner sector's ciphertext
/// payload is 32736 bytes (sector size minus the 32-byte salt prefix) —
/// 32736 / 32 = 1023, not 1024. The concrete walkthrough in spec.md §8
/// (S5: `access_or_create(position=1023)` forces `tree_depth` to become 2)
/// only holds if a depth-1 tree's capacity stops at index 1022, i.e. the
/// true fan-out is 1023; see DESIGN.md for this resolution.
pub const ENTRIES_PER_SECTOR: usize = 1023;

/// id 0 is reserved for the archive master sector; it is never a valid
/// child reference, so it doubles as "no sector".
pub const NULL_SECTOR: u64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorRef {
    pub sector_id: u64,
    pub mac: [u8; 16],
}

impl SectorRef {
    pub const NULL: SectorRef = SectorRef { sector_id: NULL_SECTOR, mac: [0u8; 16] };

    pub fn is_null(&self) -> bool {
        self.sector_id == NULL_SECTOR
    }

    pub fn read_from(buf: &[u8; SECTOR_REF_SIZE]) -> Self {
        let sector_id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let mut mac = [0u8; 16];
        mac.copy_from_slice(&buf[16..32]);
        SectorRef { sector_id, mac }
    }

    pub fn write_to(&self, buf: &mut [u8; SECTOR_REF_SIZE]) {
        buf[0..8].copy_from_slice(&self.sector_id.to_le_bytes());
        buf[8..16].fill(0);
        buf[16..32].copy_from_slice(&self.mac);
    }
}

/// A view over one inner sector's 1024 child records.
pub struct RecordTable<'a> {
    bytes: &'a [u8],
}

pub struct RecordTableMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> RecordTable<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        debug_assert!(bytes.len() >= ENTRIES_PER_SECTOR * SECTOR_REF_SIZE);
        Self { bytes }
    }

    pub fn get(&self, index: usize) -> SectorRef {
        debug_assert!(index < ENTRIES_PER_SECTOR);
        let offset = index * SECTOR_REF_SIZE;
        let raw: [u8; SECTOR_REF_SIZE] = self.bytes[offset..offset + SECTOR_REF_SIZE].try_into().unwrap();
        SectorRef::read_from(&raw)
    }

    pub fn all_null(&self) -> bool {
        (0..ENTRIES_PER_SECTOR).all(|i| self.get(i).is_null())
    }
}

impl<'a> RecordTableMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        debug_assert!(bytes.len() >= ENTRIES_PER_SECTOR * SECTOR_REF_SIZE);
        Self { bytes }
    }

    pub fn get(&self, index: usize) -> SectorRef {
        RecordTable::new(self.bytes).get(index)
    }

    pub fn set(&mut self, index: usize, value: SectorRef) {
        debug_assert!(index < ENTRIES_PER_SECTOR);
        let offset = index * SECTOR_REF_SIZE;
        let mut raw = [0u8; SECTOR_REF_SIZE];
        value.write_to(&mut raw);
        self.bytes[offset..offset + SECTOR_REF_SIZE].copy_from_slice(&raw);
    }

    pub fn clear(&mut self, index: usize) {
        self.set(index, SectorRef::NULL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips() {
        let r = SectorRef { sector_id: 0xdead_beef, mac: [7u8; 16] };
        let mut buf = [0u8; SECTOR_REF_SIZE];
        r.write_to(&mut buf);
        assert_eq!(SectorRef::read_from(&buf), r);
    }

    #[test]
    fn table_get_set() {
        let mut sector = vec![0u8; ENTRIES_PER_SECTOR * SECTOR_REF_SIZE];
        let mut table = RecordTableMut::new(&mut sector);
        assert!(table.get(3).is_null());
        table.set(3, SectorRef { sector_id: 42, mac: [1u8; 16] });
        assert_eq!(table.get(3).sector_id, 42);
        table.clear(3);
        assert!(table.get(3).is_null());
    }
}
