use std::fs;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::error::{Error, ErrorKind, Result};

const ARCHIVE_MAGIC: u32 = 0x46535258; // "FSRX"
const ARCHIVE_VERSION: u32 = 1;
const HEADER_LEN: usize = 16;

/// Serialize a structure into a checksummed, compressed archive file. The
/// write goes to a temp file first and is renamed into place, so a crash
/// never leaves a half-written archive behind.
pub fn save_archive<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    let payload = bincode::serialize(value)?;
    let compressed = lz4_flex::compress_prepend_size(&payload);
    let checksum = crc32fast::hash(&compressed);

    let mut bytes = Vec::with_capacity(HEADER_LEN + compressed.len());
    bytes.extend_from_slice(&ARCHIVE_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&ARCHIVE_VERSION.to_le_bytes());
    bytes.extend_from_slice(&checksum.to_le_bytes());
    bytes.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&compressed);

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn load_archive<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    if bytes.len() < HEADER_LEN {
        return Err(Error::new(
            ErrorKind::Corruption,
            format!("archive {} truncated", path.display()),
        ));
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let checksum = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let length = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;

    if magic != ARCHIVE_MAGIC {
        return Err(Error::new(
            ErrorKind::Corruption,
            format!("archive {} has a foreign magic number", path.display()),
        ));
    }
    if version != ARCHIVE_VERSION {
        return Err(Error::new(
            ErrorKind::Corruption,
            format!("archive {} has unsupported version {}", path.display(), version),
        ));
    }
    let compressed = &bytes[HEADER_LEN..];
    if compressed.len() != length || crc32fast::hash(compressed) != checksum {
        return Err(Error::new(
            ErrorKind::Corruption,
            format!("archive {} failed its checksum", path.display()),
        ));
    }
    let payload = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| Error::new(ErrorKind::Corruption, e.to_string()))?;
    Ok(bincode::deserialize(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<u32>,
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        let sample = Sample {
            name: "trie".to_string(),
            values: (0..1000).collect(),
        };
        save_archive(&path, &sample).unwrap();
        let loaded: Sample = load_archive(&path).unwrap();
        assert_eq!(loaded, sample);
    }

    #[test]
    fn corruption_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        save_archive(&path, &Sample { name: "x".into(), values: vec![1, 2, 3] }).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let err = load_archive::<Sample>(&path).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corruption);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        save_archive(&path, &Sample { name: "x".into(), values: vec![] }).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
