use std::path::Path;

use tracing::debug;

use crate::error::{DepotError, Result};
use crate::reader::ByteReader;

pub const CHECKSUM_MAGIC: u32 = 0x1489_3721;
pub const CHECKSUM_VERSION: u32 = 1;

/// Each checksum covers up to this many plaintext bytes.
pub const CHECKSUM_WINDOW: usize = 0x8000;

#[derive(Clone, Copy, Debug)]
pub struct MapEntry {
    pub firstidx: u32,
    pub count: u32,
}

/// Per-file table of 32-bit window checksums. File-ids index the map
/// directly; `count == 0` marks a zero-length file.
pub struct ChecksumFile {
    map: Vec<MapEntry>,
    sums: Vec<u32>,
}

impl ChecksumFile {
    pub fn open(path: &Path) -> Result<Self> {
        let buf = std::fs::read(path)?;
        Self::parse(&buf)
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(buf, "checksum file");
        let magic = r.read_u32()?;
        if magic != CHECKSUM_MAGIC {
            return Err(DepotError::BadMagic { found: magic, expected: CHECKSUM_MAGIC });
        }
        let version = r.read_u32()?;
        if version != CHECKSUM_VERSION {
            return Err(DepotError::UnsupportedVersion(version));
        }
        let map_count = r.read_u32()?;
        let sum_count = r.read_u32()?;

        let mut map = Vec::with_capacity(map_count as usize);
        for _ in 0..map_count {
            map.push(MapEntry { firstidx: r.read_u32()?, count: r.read_u32()? });
        }
        let mut sums = Vec::with_capacity(sum_count as usize);
        for _ in 0..sum_count {
            sums.push(r.read_u32()?);
        }
        // Anything after the tables is the signature; the decoder ignores it.

        for e in &map {
            let end = e.firstidx as u64 + e.count as u64;
            if e.count > 0 && end > sums.len() as u64 {
                return Err(DepotError::Truncated("checksum entry table"));
            }
        }
        debug!(files = map.len(), sums = sums.len(), "checksum file parsed");
        Ok(ChecksumFile { map, sums })
    }

    pub fn file_count(&self) -> usize {
        self.map.len()
    }

    pub fn entry(&self, fileid: u32) -> Option<MapEntry> {
        self.map.get(fileid as usize).copied()
    }

    pub fn num_checksums(&self, fileid: u32) -> u32 {
        self.entry(fileid).map(|e| e.count).unwrap_or(0)
    }

    /// The ordered window checksums for a file; empty for zero-length files
    /// and unknown ids.
    pub fn sums_for(&self, fileid: u32) -> &[u32] {
        match self.entry(fileid) {
            Some(e) if e.count > 0 => {
                &self.sums[e.firstidx as usize..(e.firstidx + e.count) as usize]
            }
            _ => &[],
        }
    }
}
