//! Remote depot retrieval over the platform's length-prefixed TCP framing.
//!
//! Every payload returned here feeds the same chunk pipeline as local
//! extraction (`storage::handle_chunk`), so downloaded files are
//! byte-for-byte identical to files extracted from a local blob.

use std::fs;
use std::io::{BufWriter, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::path::Path;
use std::time::Instant;

use regex::Regex;
use tracing::debug;

use crate::checksum::ChecksumFile;
use crate::crypto::DepotKey;
use crate::error::{DepotError, Result};
use crate::extract::ExtractReport;
use crate::index::FileType;
use crate::manifest::Manifest;
use crate::paths::materialize_path;
use crate::storage::handle_chunk;

const CMD_FILESERVERS: u8 = 0x00;
const CMD_CDR: u8 = 0x02;
const CMD_MANIFEST: u8 = 0x04;
const CMD_CHECKSUMS: u8 = 0x05;
const CMD_FILE: u8 = 0x07;
const CMD_SESSION: u8 = 0x0A;

const HANDSHAKE: u32 = 7;
const ACK: u8 = 1;

// Manifests and CDR blobs are a few MiB; anything past this is a framing bug.
const MAX_FRAME: usize = 1 << 28;

fn send_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)?;
    Ok(())
}

fn recv_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len4 = [0u8; 4];
    stream.read_exact(&mut len4)?;
    let len = u32::from_be_bytes(len4) as usize;
    if len > MAX_FRAME {
        return Err(DepotError::Protocol(format!("oversized frame of {len} bytes")));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    if *pos + n > buf.len() {
        return Err(DepotError::Protocol("short reply".to_string()));
    }
    let s = &buf[*pos..*pos + n];
    *pos += n;
    Ok(s)
}

fn take_u16(buf: &[u8], pos: &mut usize) -> Result<u16> {
    let b = take(buf, pos, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

fn take_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let b = take(buf, pos, 4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Ask a directory server which content servers carry `(depot, version)`.
pub fn get_fileservers(
    dir_addr: SocketAddrV4,
    depot: u32,
    version: u32,
    max_results: u16,
) -> Result<Vec<SocketAddrV4>> {
    let mut stream = TcpStream::connect(dir_addr)?;
    let mut req = vec![CMD_FILESERVERS];
    req.extend_from_slice(&depot.to_be_bytes());
    req.extend_from_slice(&version.to_be_bytes());
    req.extend_from_slice(&max_results.to_be_bytes());
    send_frame(&mut stream, &req)?;

    let reply = recv_frame(&mut stream)?;
    let mut pos = 0usize;
    let count = take_u16(&reply, &mut pos)?;
    let mut servers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let ip = Ipv4Addr::from(take_u32(&reply, &mut pos)?);
        let port = take_u16(&reply, &mut pos)?;
        servers.push(SocketAddrV4::new(ip, port));
    }
    debug!(?servers, "directory reply");
    Ok(servers)
}

/// Fetch the content description record and write it verbatim.
pub fn download_cdr(cfg_addr: SocketAddrV4, sink: &mut dyn Write) -> Result<u64> {
    let mut stream = TcpStream::connect(cfg_addr)?;
    send_frame(&mut stream, &[CMD_CDR])?;
    let blob = recv_frame(&mut stream)?;
    sink.write_all(&blob)?;
    Ok(blob.len() as u64)
}

/// One downloaded chunk, already stripped of wire framing but still in its
/// stored (possibly encrypted/compressed) form.
#[derive(Debug)]
pub struct NetChunk {
    pub data: Vec<u8>,
    pub raw_length: u32,
}

/// A session against one content server for one `(depot, version)`.
pub struct FileClient {
    stream: TcpStream,
    pub depot: u32,
    pub version: u32,
}

impl FileClient {
    pub fn connect(addr: SocketAddrV4, depot: u32, version: u32) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(&HANDSHAKE.to_be_bytes())?;
        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack)?;
        if ack[0] != ACK {
            return Err(DepotError::Protocol("handshake refused".to_string()));
        }
        let mut req = vec![CMD_SESSION];
        req.extend_from_slice(&depot.to_be_bytes());
        req.extend_from_slice(&version.to_be_bytes());
        send_frame(&mut stream, &req)?;
        let reply = recv_frame(&mut stream)?;
        if reply.first() != Some(&ACK) {
            return Err(DepotError::Protocol("session refused".to_string()));
        }
        debug!(depot, version, "content session open");
        Ok(FileClient { stream, depot, version })
    }

    pub fn download_manifest(&mut self) -> Result<Manifest> {
        send_frame(&mut self.stream, &[CMD_MANIFEST])?;
        let blob = recv_frame(&mut self.stream)?;
        Manifest::parse(&blob)
    }

    pub fn download_checksums(&mut self) -> Result<ChecksumFile> {
        send_frame(&mut self.stream, &[CMD_CHECKSUMS])?;
        let blob = recv_frame(&mut self.stream)?;
        ChecksumFile::parse(&blob)
    }

    /// Fetch one file as its stored chunks. Each chunk carries an MD5 digest
    /// on the wire, verified here before the chunk is accepted.
    pub fn get_file(&mut self, fileid: u32, num_chunks: u32) -> Result<(FileType, Vec<NetChunk>)> {
        let mut req = vec![CMD_FILE];
        req.extend_from_slice(&fileid.to_be_bytes());
        req.extend_from_slice(&num_chunks.to_be_bytes());
        send_frame(&mut self.stream, &req)?;

        let reply = recv_frame(&mut self.stream)?;
        let mut pos = 0usize;
        let filetype = FileType::from_byte(take(&reply, &mut pos, 1)?[0])?;
        let count = take_u32(&reply, &mut pos)?;
        let mut chunks = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let stored_len = take_u32(&reply, &mut pos)? as usize;
            let raw_length = take_u32(&reply, &mut pos)?;
            let digest: [u8; 16] = take(&reply, &mut pos, 16)?.try_into().unwrap();
            let data = take(&reply, &mut pos, stored_len)?.to_vec();
            if md5::compute(&data).0 != digest {
                return Err(DepotError::ChunkDigest(i));
            }
            chunks.push(NetChunk { data, raw_length });
        }
        Ok((filetype, chunks))
    }
}

/// Download every manifest entry under `out_root`, applying the same filter
/// and directory policy as local extraction. Files are fetched sequentially
/// over the single session and decoded through `handle_chunk`.
pub fn download_depot(
    client: &mut FileClient,
    manifest: &Manifest,
    checks: &ChecksumFile,
    key: &DepotKey,
    filter: Option<&Regex>,
    out_root: &Path,
) -> Result<ExtractReport> {
    let t0 = Instant::now();
    let matches = |rel: &str| filter.map_or(true, |re| re.is_match(rel));
    fs::create_dir_all(out_root)?;

    let mut files_written = 0u64;
    let mut files_failed = 0u64;
    let mut bytes_written = 0u64;

    for (i, entry) in manifest.entries().iter().enumerate() {
        if i == 0 {
            continue;
        }
        let rel = manifest.full_path_for_entry(i);
        if !matches(&rel) {
            continue;
        }
        let abs = materialize_path(out_root, &rel)?;
        if entry.is_dir() {
            fs::create_dir_all(&abs)?;
            continue;
        }
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)?;
        }

        println!("downloading: {rel}");
        match fetch_one(client, checks, key, entry.fileid, &abs) {
            Ok(n) => {
                files_written += 1;
                bytes_written += n;
            }
            Err(e) => {
                eprintln!("failed to download {rel}: {e}");
                files_failed += 1;
            }
        }
    }

    Ok(ExtractReport { files_written, files_failed, bytes_written, elapsed: t0.elapsed() })
}

fn fetch_one(
    client: &mut FileClient,
    checks: &ChecksumFile,
    key: &DepotKey,
    fileid: u32,
    abs: &Path,
) -> Result<u64> {
    let (filetype, chunks) = client.get_file(fileid, checks.num_checksums(fileid))?;
    let mut out = BufWriter::new(fs::File::create(abs)?);
    let mut written = 0u64;
    for chunk in &chunks {
        written += handle_chunk(&mut out, filetype, &chunk.data, chunk.raw_length as usize, key)?;
    }
    out.flush()?;
    Ok(written)
}
