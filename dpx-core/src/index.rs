use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{DepotError, Result};
use crate::reader::ByteReader;

pub const INDEX_MAGIC_V2: u32 = u32::from_le_bytes(*b"IDX2");
pub const INDEX_MAGIC_V3: u32 = u32::from_le_bytes(*b"IDX3");

/// The two on-disk index dialects. Selection is an explicit option on the
/// open call; downstream code only ever sees the uniform `FileLayout`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Dialect {
    V2,
    V3,
}

impl Dialect {
    fn magic(self) -> u32 {
        match self {
            Dialect::V2 => INDEX_MAGIC_V2,
            Dialect::V3 => INDEX_MAGIC_V3,
        }
    }
}

const FLAG_COMPRESSED: u32 = 1 << 0;
const FLAG_ENCRYPTED: u32 = 1 << 1;

/// Storage form of a file's chunks. Enum order is the on-disk v3 encoding
/// and fixes the `lsblk` display strings.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileType {
    Raw = 0,
    Compressed = 1,
    Encrypted = 2,
    EncryptedCompressed = 3,
}

impl FileType {
    pub fn is_compressed(self) -> bool {
        matches!(self, FileType::Compressed | FileType::EncryptedCompressed)
    }

    pub fn is_encrypted(self) -> bool {
        matches!(self, FileType::Encrypted | FileType::EncryptedCompressed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Raw => "raw",
            FileType::Compressed => "compressed",
            FileType::Encrypted => "encrypted",
            FileType::EncryptedCompressed => "encrypted_compressed",
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(FileType::Raw),
            1 => Ok(FileType::Compressed),
            2 => Ok(FileType::Encrypted),
            3 => Ok(FileType::EncryptedCompressed),
            other => Err(DepotError::UnknownFileType(other)),
        }
    }

    fn from_flags(flags: u32) -> Self {
        match (flags & FLAG_ENCRYPTED != 0, flags & FLAG_COMPRESSED != 0) {
            (false, false) => FileType::Raw,
            (false, true) => FileType::Compressed,
            (true, false) => FileType::Encrypted,
            (true, true) => FileType::EncryptedCompressed,
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One content block within the storage blob.
#[derive(Clone, Copy, Debug)]
pub struct Block {
    pub storage_offset: u64,
    /// Plaintext length.
    pub raw_length: u32,
    /// Bytes actually present in storage (encrypted/compressed form).
    pub stored_length: u32,
}

/// Dialect-free per-file layout.
#[derive(Clone, Debug)]
pub struct FileLayout {
    pub filetype: FileType,
    pub blocks: Vec<Block>,
    /// Position of this file's first block in the global block sequence.
    pub first_block_index: u32,
}

impl FileLayout {
    pub fn raw_size(&self) -> u64 {
        self.blocks.iter().map(|b| b.raw_length as u64).sum()
    }
}

#[derive(Debug)]
pub struct Index {
    pub dialect: Dialect,
    pub item_count: u32,
    pub file_count: u32,
    pub block_count: u32,
    map: BTreeMap<u32, FileLayout>,
}

impl Index {
    pub fn open(path: &Path, dialect: Dialect) -> Result<Self> {
        let buf = std::fs::read(path)?;
        Self::parse(&buf, dialect)
    }

    pub fn parse(buf: &[u8], dialect: Dialect) -> Result<Self> {
        let mut r = ByteReader::new(buf, "index");
        let magic = r.read_u32()?;
        if magic != dialect.magic() {
            return Err(DepotError::BadMagic { found: magic, expected: dialect.magic() });
        }
        let item_count = r.read_u32()?;
        let file_count = r.read_u32()?;
        let block_count = r.read_u32()?;

        let mut map = BTreeMap::new();
        let mut next_block = 0u32;
        let mut nonempty = 0u32;
        for _ in 0..item_count {
            let fileid = r.read_u32()?;
            let filetype = match dialect {
                Dialect::V3 => FileType::from_byte(r.read_u8()?)?,
                Dialect::V2 => FileType::from_flags(r.read_u32()?),
            };
            let nblocks = r.read_u32()?;
            let mut blocks = Vec::with_capacity(nblocks as usize);
            for _ in 0..nblocks {
                let storage_offset = match dialect {
                    Dialect::V3 => r.read_u64()?,
                    Dialect::V2 => r.read_u32()? as u64,
                };
                let raw_length = r.read_u32()?;
                let stored_length = r.read_u32()?;
                blocks.push(Block { storage_offset, raw_length, stored_length });
            }
            if !blocks.is_empty() {
                nonempty += 1;
            }
            let layout = FileLayout { filetype, blocks, first_block_index: next_block };
            next_block += nblocks;
            if map.insert(fileid, layout).is_some() {
                warn!(fileid, "duplicate index record, keeping the later one");
            }
        }
        if next_block != block_count {
            return Err(DepotError::Truncated("index block table"));
        }
        if nonempty != file_count {
            warn!(nonempty, file_count, "index file_count disagrees with records");
        }
        debug!(?dialect, items = map.len(), blocks = block_count, "index parsed");
        Ok(Index { dialect, item_count, file_count, block_count, map })
    }

    pub fn layout(&self, fileid: u32) -> Option<&FileLayout> {
        self.map.get(&fileid)
    }

    /// Entries in ascending file-id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &FileLayout)> {
        self.map.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
