use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use crc32fast::Hasher as Crc32;

use crate::error::{DepotError, Result};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_HEX_LEN: usize = 32;
const AES_BLOCK: usize = 16;

/// AES-256 key for a depot.
///
/// Depot keys travel as 32 hex characters. The platform feeds those 32 ASCII
/// bytes to the cipher as-is, so the key material is the character buffer
/// itself, not its hex decoding. The default "zero key" is thirty-two '0's.
#[derive(Clone, Copy)]
pub struct DepotKey([u8; KEY_HEX_LEN]);

impl DepotKey {
    /// Accepts exactly 32 hex characters.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != KEY_HEX_LEN {
            return Err(DepotError::BadKey(format!(
                "expected {} hex chars, got {}",
                KEY_HEX_LEN,
                s.len()
            )));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DepotError::BadKey(format!("non-hex character in {s:?}")));
        }
        let mut key = [0u8; KEY_HEX_LEN];
        key.copy_from_slice(s.as_bytes());
        Ok(Self(key))
    }

    pub fn zero() -> Self {
        Self([b'0'; KEY_HEX_LEN])
    }

    pub fn as_bytes(&self) -> &[u8; KEY_HEX_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for DepotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keys stay out of logs.
        f.write_str("DepotKey(..)")
    }
}

/// Decrypt one stored chunk: the first 16 bytes are the IV, the rest is the
/// CBC ciphertext body. Padding is left in place; callers truncate plaintext
/// to the block's raw length, which strips PKCS#7 on a file's final block.
pub fn decrypt_chunk(key: &DepotKey, chunk: &[u8]) -> Result<Vec<u8>> {
    if chunk.len() < AES_BLOCK {
        return Err(DepotError::Decrypt(format!(
            "chunk of {} bytes has no room for an IV",
            chunk.len()
        )));
    }
    let (iv, body) = chunk.split_at(AES_BLOCK);
    if body.len() % AES_BLOCK != 0 {
        return Err(DepotError::Decrypt(format!(
            "ciphertext body of {} bytes is not block-aligned",
            body.len()
        )));
    }
    let mut buf = body.to_vec();
    let dec = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| DepotError::Decrypt(e.to_string()))?;
    dec.decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| DepotError::Decrypt(e.to_string()))?;
    Ok(buf)
}

/// Per-window checksum carried by the checksum file: RFC 1950 Adler-32 of the
/// plaintext xor'd with its CRC-32.
pub fn block_sum(buf: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(buf);
    adler32(buf) ^ crc.finalize()
}

// Largest n with n*(n+1)/2*255 + (n+1)*(65521-1) below 2^32, per zlib.
const ADLER_NMAX: usize = 5552;
const ADLER_MOD: u32 = 65521;

fn adler32(buf: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for run in buf.chunks(ADLER_NMAX) {
        for &byte in run {
            a += byte as u32;
            b += a;
        }
        a %= ADLER_MOD;
        b %= ADLER_MOD;
    }
    (b << 16) | a
}
