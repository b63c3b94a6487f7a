//! Fixture builders: hand-assembled depot artifacts for the decoder tests.
#![allow(dead_code)]

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

use dpx_core::crypto::DepotKey;
use dpx_core::index::FileType;
use dpx_core::manifest::{DIR_FILEID, MANIFEST_VERSION, ROOT_PARENT};
use dpx_core::storage::STORAGE_MAGIC;

const NO_LINK: u32 = 0;

struct Item {
    name: String,
    parent: u32,
    fileid: u32,
    dirtype: u32,
    item_size: u32,
}

/// Builds manifest images entry by entry. Entry 0 is always the anonymous
/// root; `dir`/`file` return the new entry's index for use as a parent.
pub struct ManifestBuilder {
    cacheid: u32,
    gcfversion: u32,
    items: Vec<Item>,
}

impl ManifestBuilder {
    pub fn new(cacheid: u32, gcfversion: u32) -> Self {
        let root = Item {
            name: String::new(),
            parent: ROOT_PARENT,
            fileid: DIR_FILEID,
            dirtype: 0,
            item_size: 0,
        };
        Self { cacheid, gcfversion, items: vec![root] }
    }

    pub fn dir(&mut self, name: &str, parent: u32) -> u32 {
        self.items.push(Item {
            name: name.to_string(),
            parent,
            fileid: DIR_FILEID,
            dirtype: 0,
            item_size: 0,
        });
        (self.items.len() - 1) as u32
    }

    pub fn file(&mut self, name: &str, parent: u32, fileid: u32, size: u32) -> u32 {
        self.items.push(Item {
            name: name.to_string(),
            parent,
            fileid,
            dirtype: 1,
            item_size: size,
        });
        (self.items.len() - 1) as u32
    }

    pub fn build(&self) -> Vec<u8> {
        let n = self.items.len() as u32;

        let mut heap: Vec<u8> = Vec::new();
        let mut name_offsets = Vec::with_capacity(self.items.len());
        for item in &self.items {
            name_offsets.push(heap.len() as u32);
            heap.extend_from_slice(item.name.as_bytes());
            heap.push(0);
        }

        let mut first_child = vec![NO_LINK; self.items.len()];
        let mut next_sibling = vec![NO_LINK; self.items.len()];
        for i in 1..self.items.len() {
            let parent = self.items[i].parent as usize;
            if first_child[parent] == NO_LINK {
                first_child[parent] = i as u32;
            }
            for j in i + 1..self.items.len() {
                if self.items[j].parent == self.items[i].parent {
                    next_sibling[i] = j as u32;
                    break;
                }
            }
        }
        let child_count = |i: usize| {
            self.items.iter().filter(|it| it.parent == i as u32).count() as u32
        };

        let file_count = self.items.iter().filter(|i| i.dirtype != 0).count() as u32;
        let hashtable_size = 16u32;
        let dir_size = 28 * n + heap.len() as u32;

        let mut out = Vec::new();
        let header = [
            MANIFEST_VERSION,
            self.cacheid,
            self.gcfversion,
            n,
            file_count,
            0x2000,
            dir_size,
            heap.len() as u32,
            hashtable_size,
            0,
            0,
            0,
            0xDEAD_BEEF,
            0,
        ];
        for v in header {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for (i, item) in self.items.iter().enumerate() {
            let item_size = if item.dirtype == 0 { child_count(i) } else { item.item_size };
            for v in [
                name_offsets[i],
                item_size,
                item.fileid,
                item.dirtype,
                item.parent,
                next_sibling[i],
                first_child[i],
            ] {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out.extend_from_slice(&heap);
        out.extend_from_slice(&vec![0u8; hashtable_size as usize]);
        out
    }
}

pub struct IndexEntry {
    pub fileid: u32,
    pub filetype: FileType,
    pub blocks: Vec<(u64, u32, u32)>, // (storage_offset, raw_length, stored_length)
}

pub fn index_v3(entries: &[IndexEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"IDX3");
    push_index_header(&mut out, entries);
    for e in entries {
        out.extend_from_slice(&e.fileid.to_le_bytes());
        out.push(e.filetype as u8);
        out.extend_from_slice(&(e.blocks.len() as u32).to_le_bytes());
        for &(off, raw, stored) in &e.blocks {
            out.extend_from_slice(&off.to_le_bytes());
            out.extend_from_slice(&raw.to_le_bytes());
            out.extend_from_slice(&stored.to_le_bytes());
        }
    }
    out
}

pub fn index_v2(entries: &[IndexEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"IDX2");
    push_index_header(&mut out, entries);
    for e in entries {
        out.extend_from_slice(&e.fileid.to_le_bytes());
        let mut flags = 0u32;
        if e.filetype.is_compressed() {
            flags |= 1 << 0;
        }
        if e.filetype.is_encrypted() {
            flags |= 1 << 1;
        }
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&(e.blocks.len() as u32).to_le_bytes());
        for &(off, raw, stored) in &e.blocks {
            out.extend_from_slice(&(off as u32).to_le_bytes());
            out.extend_from_slice(&raw.to_le_bytes());
            out.extend_from_slice(&stored.to_le_bytes());
        }
    }
    out
}

fn push_index_header(out: &mut Vec<u8>, entries: &[IndexEntry]) {
    let file_count = entries.iter().filter(|e| !e.blocks.is_empty()).count() as u32;
    let block_count: u32 = entries.iter().map(|e| e.blocks.len() as u32).sum();
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&file_count.to_le_bytes());
    out.extend_from_slice(&block_count.to_le_bytes());
}

/// Checksum file image: one inner vec of window sums per file-id.
pub fn checksum_file(per_file: &[Vec<u32>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0x1489_3721u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(per_file.len() as u32).to_le_bytes());
    let total: u32 = per_file.iter().map(|s| s.len() as u32).sum();
    out.extend_from_slice(&total.to_le_bytes());
    let mut first = 0u32;
    for sums in per_file {
        out.extend_from_slice(&first.to_le_bytes());
        out.extend_from_slice(&(sums.len() as u32).to_le_bytes());
        first += sums.len() as u32;
    }
    for sums in per_file {
        for &s in sums {
            out.extend_from_slice(&s.to_le_bytes());
        }
    }
    // Trailing signature, ignored by the decoder.
    out.extend_from_slice(&[0xAA; 128]);
    out
}

/// Storage blob image with content placed at fixed offsets.
pub struct StorageBuilder {
    buf: Vec<u8>,
}

impl StorageBuilder {
    pub fn new(cacheid: u32) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(&STORAGE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&cacheid.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        Self { buf }
    }

    /// Place `bytes` at `offset`, zero-filling any gap.
    pub fn place(&mut self, offset: u64, bytes: &[u8]) -> &mut Self {
        let end = offset as usize + bytes.len();
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[offset as usize..end].copy_from_slice(bytes);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.buf.clone()
    }
}

pub fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// IV ‖ AES-256-CBC(PKCS#7(plain)), the stored form of an encrypted chunk.
pub fn encrypt_chunk(key: &DepotKey, iv: [u8; 16], plain: &[u8]) -> Vec<u8> {
    type Enc = cbc::Encryptor<aes::Aes256>;
    let padded = (plain.len() / 16 + 1) * 16;
    let mut buf = vec![0u8; padded];
    buf[..plain.len()].copy_from_slice(plain);
    let ct = Enc::new_from_slices(key.as_bytes(), &iv)
        .unwrap()
        .encrypt_padded_mut::<Pkcs7>(&mut buf, plain.len())
        .unwrap()
        .to_vec();
    let mut out = iv.to_vec();
    out.extend_from_slice(&ct);
    out
}

pub fn write_tmp(dir: &std::path::Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, bytes).unwrap();
    p
}
