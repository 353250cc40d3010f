//! Randomized round-trip coverage for [`vefs::VirtualFile`] reads/writes,
//! in the style of the aero-storage corpus's disk-image property tests:
//! bounded random byte buffers at bounded random offsets, checked for an
//! exact round trip rather than exhaustive encode/decode grids.

use proptest::prelude::*;

use vefs::index::OpenFlags;
use vefs::{Archive, ArchiveConfig};

const MAX_LEN: usize = 8192;
const MAX_OFFSET: u64 = 4 * 32736;

fn config() -> ArchiveConfig {
    ArchiveConfig::default().with_growth_chunk_sectors(4).with_io_pool_size(4)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn write_then_read_round_trips_at_random_offset(
        offset in 0..MAX_OFFSET,
        data in prop::collection::vec(any::<u8>(), 1..MAX_LEN),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.vefs");
        let archive = Archive::create(&path, &[0u8; 32], config()).unwrap();
        let file = archive.open_file("/p", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();

        file.write(&data, offset).unwrap();
        let mut out = vec![0u8; data.len()];
        let n = file.read(&mut out, offset).unwrap();

        prop_assert_eq!(n, data.len());
        prop_assert_eq!(out, data);
    }
}
