//! The 4 KiB personalization area (spec.md §3, §6): opaque to the core,
//! used by the (out-of-scope) key-box provider. The core's only contract
//! is read-after-write durability at commit boundaries.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::device::layout::{PERSONALIZATION_REGION_START, PERSONALIZATION_SIZE};
use crate::error::Result;

pub fn read(file: &mut File) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; PERSONALIZATION_SIZE as usize];
    file.seek(SeekFrom::Start(PERSONALIZATION_REGION_START))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write(file: &mut File, data: &[u8]) -> Result<()> {
    let mut buf = vec![0u8; PERSONALIZATION_SIZE as usize];
    let n = data.len().min(buf.len());
    buf[..n].copy_from_slice(&data[..n]);
    file.seek(SeekFrom::Start(PERSONALIZATION_REGION_START))?;
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}
