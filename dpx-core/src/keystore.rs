use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::crypto::DepotKey;
use crate::error::Result;

/// Cache-id to AES-key map loaded from a plaintext seed file of
/// `decimal_cacheid<WS>32_hex_chars` lines. Unknown cache-ids are simply
/// absent; callers fall back to an explicit `--key` or the zero key.
#[derive(Default)]
pub struct Keystore {
    keys: HashMap<u32, DepotKey>,
}

impl Keystore {
    /// Load a seed file. A missing file yields an empty keystore; malformed
    /// lines are skipped with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no keystore file");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let mut keys = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let parsed = match (fields.next(), fields.next()) {
                (Some(id), Some(hex)) => {
                    id.parse::<u32>().ok().zip(DepotKey::from_hex(hex).ok())
                }
                _ => None,
            };
            match parsed {
                Some((id, key)) => {
                    keys.insert(id, key);
                }
                None => warn!(line = lineno + 1, "skipping malformed keystore line"),
            }
        }
        debug!(entries = keys.len(), "keystore loaded");
        Ok(Keystore { keys })
    }

    pub fn has_key(&self, cacheid: u32) -> bool {
        self.keys.contains_key(&cacheid)
    }

    pub fn get(&self, cacheid: u32) -> Option<DepotKey> {
        self.keys.get(&cacheid).copied()
    }

    /// Three-tier key policy: keystore entry for the cache, then the
    /// user-supplied hex, then the zero key.
    pub fn resolve(&self, cacheid: u32, override_hex: Option<&str>) -> Result<DepotKey> {
        if let Some(key) = self.get(cacheid) {
            debug!(cacheid, source = "keystore", "key resolved");
            return Ok(key);
        }
        if let Some(hex) = override_hex {
            debug!(cacheid, source = "argument", "key resolved");
            return DepotKey::from_hex(hex);
        }
        debug!(cacheid, source = "zero", "key resolved");
        Ok(DepotKey::zero())
    }
}
