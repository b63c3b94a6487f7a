use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::ZlibDecoder;
use memmap2::Mmap;
use tracing::debug;

use crate::crypto::{decrypt_chunk, DepotKey};
use crate::error::{DepotError, Result};
use crate::index::{FileType, Index};
use crate::reader::ByteReader;

pub const STORAGE_MAGIC: u32 = u32::from_le_bytes(*b"DPOT");

#[derive(Clone, Copy, Debug)]
pub struct StorageHeader {
    pub cacheid: u32,
    pub version: u32,
}

/// Read-only view of the storage blob.
///
/// The blob is memory-mapped once; block reads are positional slices, so any
/// number of worker threads can share one `Storage` without locking.
pub struct Storage {
    header: StorageHeader,
    map: Mmap,
    key: DepotKey,
}

impl Storage {
    pub fn open(path: &Path, key: DepotKey) -> Result<Self> {
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        let mut r = ByteReader::new(&map, "storage blob");
        let magic = r.read_u32()?;
        if magic != STORAGE_MAGIC {
            return Err(DepotError::BadMagic { found: magic, expected: STORAGE_MAGIC });
        }
        let header = StorageHeader { cacheid: r.read_u32()?, version: r.read_u32()? };
        debug!(cacheid = header.cacheid, version = header.version, bytes = map.len(), "storage opened");
        Ok(Storage { header, map, key })
    }

    pub fn header(&self) -> StorageHeader {
        self.header
    }

    /// Decode one file by walking its index blocks in order, writing
    /// plaintext to `sink`. An id the index does not know, or a file with no
    /// blocks, writes nothing and succeeds. Returns bytes written.
    pub fn extract_file(&self, sink: &mut dyn Write, index: &Index, fileid: u32) -> Result<u64> {
        let Some(layout) = index.layout(fileid) else {
            return Ok(0);
        };
        let mut written = 0u64;
        for b in &layout.blocks {
            let chunk = self.pread(b.storage_offset, b.stored_length as usize)?;
            written +=
                handle_chunk(sink, layout.filetype, chunk, b.raw_length as usize, &self.key)?;
        }
        Ok(written)
    }

    fn pread(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len as u64).ok_or(DepotError::Truncated("storage blob"))?;
        if end > self.map.len() as u64 {
            return Err(DepotError::Truncated("storage blob"));
        }
        Ok(&self.map[offset as usize..end as usize])
    }
}

/// Decode one stored chunk and append its plaintext to `sink`: decrypt when
/// the filetype carries the encrypted bit, inflate when it carries the
/// compressed bit, then truncate to `raw_length` (which strips CBC padding on
/// a file's final block). Shared by local extraction and the network path.
pub fn handle_chunk(
    sink: &mut dyn Write,
    filetype: FileType,
    chunk: &[u8],
    raw_length: usize,
    key: &DepotKey,
) -> Result<u64> {
    let decrypted;
    let data: &[u8] = if filetype.is_encrypted() {
        decrypted = decrypt_chunk(key, chunk)?;
        &decrypted
    } else {
        chunk
    };

    let inflated;
    let plain: &[u8] = if filetype.is_compressed() {
        inflated = inflate(data, raw_length)?;
        &inflated
    } else {
        data
    };

    if plain.len() < raw_length {
        return Err(DepotError::Truncated("content block"));
    }
    sink.write_all(&plain[..raw_length])?;
    Ok(raw_length as u64)
}

/// Zlib inflate of one chunk; the stream must decode to exactly
/// `expected` bytes.
fn inflate(data: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected);
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| DepotError::Inflate(e.to_string()))?;
    if out.len() != expected {
        return Err(DepotError::Inflate(format!(
            "stream yielded {} bytes, expected {}",
            out.len(),
            expected
        )));
    }
    Ok(out)
}
