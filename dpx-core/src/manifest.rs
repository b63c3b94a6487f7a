use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{DepotError, Result};
use crate::reader::ByteReader;

/// Manifest header version understood by this decoder.
pub const MANIFEST_VERSION: u32 = 4;

/// `fileid` value carried by directory entries.
pub const DIR_FILEID: u32 = 0xFFFF_FFFF;

/// `parent` value carried by the root entry.
pub const ROOT_PARENT: u32 = 0xFFFF_FFFF;

const DIRENTRY_SIZE: u32 = 28;

#[derive(Clone, Copy, Debug, Serialize)]
pub struct ManifestHeader {
    pub header_version: u32,
    pub cacheid: u32,
    pub gcfversion: u32,
    pub item_count: u32,
    pub file_count: u32,
    pub block_size: u32,
    pub dir_size: u32,
    pub filename_heap_size: u32,
    pub hashtable_size: u32,
    pub info1_count: u32,
    pub copy_count: u32,
    pub local_count: u32,
    pub fingerprint: u32,
    pub checksum: u32,
}

/// One row of the directory-entry table.
#[derive(Clone, Copy, Debug)]
pub struct DirEntry {
    pub name_offset: u32,
    /// Byte length for files, child count for directories.
    pub item_size: u32,
    pub fileid: u32,
    pub dirtype: u32,
    pub parent: u32,
    pub next_sibling: u32,
    pub first_child: u32,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.dirtype == 0
    }

    pub fn is_file(&self) -> bool {
        self.dirtype != 0
    }
}

/// Parsed depot filesystem tree: the entry table plus resolved names.
///
/// Relative paths are produced with `/` separators regardless of platform;
/// filesystem materialization converts per component.
pub struct Manifest {
    pub header: ManifestHeader,
    entries: Vec<DirEntry>,
    names: Vec<String>,
}

impl Manifest {
    pub fn open(path: &Path) -> Result<Self> {
        let buf = std::fs::read(path)?;
        Self::parse(&buf)
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(buf, "manifest");
        let header = ManifestHeader {
            header_version: r.read_u32()?,
            cacheid: r.read_u32()?,
            gcfversion: r.read_u32()?,
            item_count: r.read_u32()?,
            file_count: r.read_u32()?,
            block_size: r.read_u32()?,
            dir_size: r.read_u32()?,
            filename_heap_size: r.read_u32()?,
            hashtable_size: r.read_u32()?,
            info1_count: r.read_u32()?,
            copy_count: r.read_u32()?,
            local_count: r.read_u32()?,
            fingerprint: r.read_u32()?,
            checksum: r.read_u32()?,
        };
        if header.header_version != MANIFEST_VERSION {
            return Err(DepotError::UnsupportedVersion(header.header_version));
        }
        let expect_dir = DIRENTRY_SIZE
            .wrapping_mul(header.item_count)
            .wrapping_add(header.filename_heap_size);
        if header.dir_size != expect_dir {
            warn!(dir_size = header.dir_size, expect_dir, "manifest dir_size disagrees with tables");
        }

        let mut entries = Vec::with_capacity(header.item_count as usize);
        for _ in 0..header.item_count {
            entries.push(DirEntry {
                name_offset: r.read_u32()?,
                item_size: r.read_u32()?,
                fileid: r.read_u32()?,
                dirtype: r.read_u32()?,
                parent: r.read_u32()?,
                next_sibling: r.read_u32()?,
                first_child: r.read_u32()?,
            });
        }

        let heap = r.read_bytes(header.filename_heap_size as usize)?;
        let names = entries
            .iter()
            .map(|e| name_from_heap(heap, e.name_offset))
            .collect::<Result<Vec<_>>>()?;

        // Hash table is unused by extraction but its declared size must fit.
        r.skip(header.hashtable_size as usize)?;
        // Info/copy/local hint tables are trailing and tolerated when absent.
        let hints = (header.info1_count as usize)
            .saturating_add(header.copy_count as usize)
            .saturating_add(header.local_count as usize)
            .saturating_mul(4);
        if r.skip(hints).is_err() {
            warn!(hints, "manifest hint tables shorter than declared");
        }

        let m = Manifest { header, entries, names };
        m.check_tree()?;
        debug!(
            cacheid = m.header.cacheid,
            gcfversion = m.header.gcfversion,
            items = m.entries.len(),
            "manifest parsed"
        );
        Ok(m)
    }

    fn check_tree(&self) -> Result<()> {
        let n = self.entries.len();
        if n == 0 {
            return Ok(());
        }
        let root = &self.entries[0];
        if !root.is_dir() || root.parent != ROOT_PARENT || !self.names[0].is_empty() {
            warn!("manifest entry 0 is not an anonymous root directory");
        }
        let mut seen_ids = HashSet::with_capacity(self.header.file_count as usize);
        for (i, e) in self.entries.iter().enumerate() {
            if e.is_dir() != (e.fileid == DIR_FILEID) {
                warn!(entry = i, "dirtype and fileid disagree");
            }
            if e.is_file() && !seen_ids.insert(e.fileid) {
                return Err(DepotError::DuplicateFileId(e.fileid));
            }
            // Every parent chain must hit the root within item_count hops,
            // stepping through directory entries only.
            let mut cur = i;
            let mut hops = 0usize;
            while cur != 0 {
                let parent = self.entries[cur].parent;
                if parent as usize >= n || hops >= n {
                    return Err(DepotError::CycleDetected(i as u32));
                }
                if !self.entries[parent as usize].is_dir() {
                    return Err(DepotError::BadParent(i as u32));
                }
                cur = parent as usize;
                hops += 1;
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    /// Join names from the root down to `index` with `/`. The root entry
    /// yields the empty string.
    pub fn full_path_for_entry(&self, index: usize) -> String {
        let mut parts: Vec<&str> = Vec::new();
        let mut cur = index;
        loop {
            let name = self.name(cur);
            if !name.is_empty() {
                parts.push(name);
            }
            let parent = self.entries[cur].parent;
            if cur == 0 || parent == ROOT_PARENT {
                break;
            }
            cur = parent as usize;
        }
        parts.reverse();
        parts.join("/")
    }

    /// Path of the file with the given id, if any (used by `iton`).
    pub fn path_for_fileid(&self, fileid: u32) -> Result<String> {
        self.entries
            .iter()
            .position(|e| e.is_file() && e.fileid == fileid)
            .map(|i| self.full_path_for_entry(i))
            .ok_or(DepotError::UnknownFileId(fileid))
    }
}

fn name_from_heap(heap: &[u8], offset: u32) -> Result<String> {
    let start = offset as usize;
    if start > heap.len() {
        return Err(DepotError::Truncated("filename heap"));
    }
    let end = heap[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(DepotError::Truncated("filename heap"))?;
    Ok(String::from_utf8_lossy(&heap[start..start + end]).into_owned())
}
