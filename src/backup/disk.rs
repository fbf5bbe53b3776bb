//! Directory-backed backup storage.
//!
//! Each key is one file. The file name is a bounded readable prefix of the key
//! followed by the CRC32 of the whole key, so long document names never hit
//! file-name length limits. The first line of a file holds a CRC32 and the
//! hex-encoded key; the checksum covers both the key and the payload that
//! follows, so a torn or edited file reads as [`BackendError::Corrupt`]
//! instead of as a valid backup.

use super::{BackendError, BackupBackend};
use crc32fast::Hasher;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const EXTENSION: &str = "backup";
/// Key bytes spelled out in a file name before the hash.
const NAME_PREFIX_BYTES: usize = 32;
/// Keys whose names hash alike take numbered slots.
const MAX_SLOTS: usize = 16;

#[derive(Debug, Clone)]
pub struct DirBackend {
    root: PathBuf,
}

impl DirBackend {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, BackendError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(map_io)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot_path(&self, key: &str, slot: usize) -> PathBuf {
        let bytes = key.as_bytes();
        let prefix = encode_hex(&bytes[..bytes.len().min(NAME_PREFIX_BYTES)]);
        let hash = checksum(&[bytes]);
        let name = match slot {
            0 => format!("{prefix}-{hash:08x}.{EXTENSION}"),
            slot => format!("{prefix}-{hash:08x}-{slot}.{EXTENSION}"),
        };
        self.root.join(name)
    }

    /// Slot files that belong to `key`, or that are too damaged to tell.
    fn owned_slots(&self, key: &str) -> Result<Vec<(PathBuf, Option<String>)>, BackendError> {
        let mut owned = Vec::new();
        for slot in 0..MAX_SLOTS {
            let path = self.slot_path(key, slot);
            let Some(text) = read_text(&path)? else {
                continue;
            };
            match header_key(&text) {
                Some(found) if found == key => owned.push((path, Some(text))),
                Some(_) => {}
                None => owned.push((path, None)),
            }
        }
        Ok(owned)
    }
}

impl BackupBackend for DirBackend {
    fn read(&self, key: &str) -> Result<Option<String>, BackendError> {
        match self.owned_slots(key)?.into_iter().next() {
            Some((_, Some(text))) => verify(&text).map(Some),
            Some((_, None)) => Err(BackendError::Corrupt("unreadable header")),
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let path = match self.owned_slots(key)?.into_iter().next() {
            Some((path, _)) => path,
            None => (0..MAX_SLOTS)
                .map(|slot| self.slot_path(key, slot))
                .find(|path| !path.exists())
                .ok_or_else(|| {
                    BackendError::Io(io::Error::other("no free backup slot for key"))
                })?,
        };
        let encoded = encode_hex(key.as_bytes());
        let sum = checksum(&[key.as_bytes(), value.as_bytes()]);
        let contents = format!("{sum:08x} {encoded}\n{value}");
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, contents).map_err(map_io)?;
        fs::rename(&temp_path, &path).map_err(map_io)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        for (path, _) in self.owned_slots(key)? {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(BackendError::Io(err)),
            }
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(BackendError::Io(err)),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(key) = read_text(&path).ok().flatten().as_deref().and_then(header_key) {
                keys.push(key);
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

fn map_io(err: io::Error) -> BackendError {
    match err.kind() {
        io::ErrorKind::StorageFull => BackendError::QuotaExceeded,
        _ => BackendError::Io(err),
    }
}

fn checksum(parts: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

fn read_text(path: &Path) -> Result<Option<String>, BackendError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(BackendError::Io(err)),
    };
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| BackendError::Corrupt("not utf-8"))
}

/// Splits a file into checksum, key and payload.
fn split_file(text: &str) -> Option<(&str, String, &str)> {
    let (header, payload) = text.split_once('\n')?;
    let (sum, encoded) = header.split_once(' ')?;
    Some((sum, decode_hex(encoded)?, payload))
}

fn header_key(text: &str) -> Option<String> {
    split_file(text).map(|(_, key, _)| key)
}

fn verify(text: &str) -> Result<String, BackendError> {
    let (sum, key, payload) = split_file(text).ok_or(BackendError::Corrupt("unreadable header"))?;
    let expected = u32::from_str_radix(sum, 16).map_err(|_| BackendError::Corrupt("bad checksum"))?;
    if checksum(&[key.as_bytes(), payload.as_bytes()]) != expected {
        return Err(BackendError::Corrupt("checksum mismatch"));
    }
    Ok(payload.to_string())
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

fn decode_hex(encoded: &str) -> Option<String> {
    if encoded.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..encoded.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(encoded.get(index..index + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}
