use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::block_file::{read_u32, read_u64};
use super::{Checkpointed, FileKind, FORMAT_VERSION};
use crate::errors::{EngineError, EngineResult};

const MAGIC: [u8; 4] = *b"TSMF";
const PREAMBLE_LEN: usize = 24;

/// Atomically replaces the metadata file at `path` with `value`.
pub fn write_meta<T: Serialize>(path: &Path, kind: FileKind, value: &T, sync: bool) -> EngineResult<()> {
    let body = bincode::serde::encode_to_vec(value, bincode::config::legacy())
        .map_err(EngineError::serialization)?;

    let mut bytes = Vec::with_capacity(PREAMBLE_LEN + body.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.push(kind as u8);
    bytes.extend_from_slice(&[0u8; 3]);
    bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&body);

    let tmp = path.with_extension("meta.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        if sync {
            file.sync_all()?;
        }
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads a metadata file written by [`write_meta`] with the same kind.
pub fn read_meta<T: DeserializeOwned>(path: &Path, kind: FileKind) -> EngineResult<T> {
    let bytes = fs::read(path)?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if bytes.len() < PREAMBLE_LEN || bytes[0..4] != MAGIC {
        return Err(EngineError::Corrupted(format!("{}: not a metadata file", name)));
    }
    let version = read_u32(&bytes, 4);
    if version != FORMAT_VERSION {
        return Err(EngineError::FormatVersionMismatch {
            file: name,
            expected: FORMAT_VERSION,
            found: version,
        });
    }
    if bytes[8] != kind as u8 {
        return Err(EngineError::Corrupted(format!(
            "{}: holds kind {} metadata, expected {:?}",
            name, bytes[8], kind
        )));
    }

    let len = read_u64(&bytes, 16) as usize;
    let body = bytes
        .get(PREAMBLE_LEN..PREAMBLE_LEN.saturating_add(len))
        .ok_or_else(|| EngineError::Corrupted(format!("{}: truncated body", name)))?;
    if crc32fast::hash(body) != read_u32(&bytes, 12) {
        return Err(EngineError::Corrupted(format!("{}: checksum mismatch", name)));
    }

    let (value, _): (T, usize) = bincode::serde::decode_from_slice(body, bincode::config::legacy())
        .map_err(EngineError::serialization)?;
    Ok(value)
}

/// A metadata value together with the file it is persisted in.
///
/// Changes are made in memory and written out by [`MetaFile::save`]. Within
/// an open unit the value can be rolled back; if the file was already
/// rewritten in that unit, it is rewritten again with the restored value.
#[derive(Debug)]
pub struct MetaFile<T: Clone> {
    path: PathBuf,
    kind: FileKind,
    value: Checkpointed<T>,
    written: bool,
}

impl<T: Clone + Serialize + DeserializeOwned> MetaFile<T> {
    pub fn create(path: &Path, kind: FileKind, value: T) -> EngineResult<Self> {
        write_meta(path, kind, &value, true)?;
        Ok(MetaFile {
            path: path.to_path_buf(),
            kind,
            value: Checkpointed::new(value),
            written: false,
        })
    }

    pub fn open(path: &Path, kind: FileKind) -> EngineResult<Self> {
        let value = read_meta(path, kind)?;
        Ok(MetaFile {
            path: path.to_path_buf(),
            kind,
            value: Checkpointed::new(value),
            written: false,
        })
    }

    pub fn get(&self) -> &T {
        self.value.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn begin(&mut self) {
        self.value.begin();
    }

    pub fn save(&mut self, sync: bool) -> EngineResult<()> {
        write_meta(&self.path, self.kind, self.value.get(), sync)?;
        if self.value.is_open() {
            self.written = true;
        }
        Ok(())
    }

    pub fn commit(&mut self) {
        self.value.commit();
        self.written = false;
    }

    pub fn rollback(&mut self) -> EngineResult<()> {
        self.value.rollback();
        if self.written {
            write_meta(&self.path, self.kind, self.value.get(), false)?;
            self.written = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Directory {
        depth: u8,
        slots: Vec<u64>,
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hash.meta");
        let value = Directory {
            depth: 2,
            slots: vec![1, 2, 1, 3],
        };
        write_meta(&path, FileKind::HashIndex, &value, true).unwrap();
        let back: Directory = read_meta(&path, FileKind::HashIndex).unwrap();
        assert_eq!(back, value);
        assert!(!path.with_extension("meta.tmp").exists());
    }

    #[test]
    fn test_detects_wrong_kind_version_and_damage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hash.meta");
        let value = Directory {
            depth: 0,
            slots: vec![1],
        };
        write_meta(&path, FileKind::HashIndex, &value, false).unwrap();

        let err = read_meta::<Directory>(&path, FileKind::Trie).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);

        let original = fs::read(&path).unwrap();

        let mut damaged = original.clone();
        let last = damaged.len() - 1;
        damaged[last] ^= 0x55;
        fs::write(&path, &damaged).unwrap();
        let err = read_meta::<Directory>(&path, FileKind::HashIndex).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);

        let mut newer = original;
        newer[4..8].copy_from_slice(&2u32.to_le_bytes());
        fs::write(&path, &newer).unwrap();
        let err = read_meta::<Directory>(&path, FileKind::HashIndex).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FormatVersionMismatch);
    }

    #[test]
    fn test_rollback_rewrites_saved_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trie.meta");
        let mut meta = MetaFile::create(&path, FileKind::Trie, 10u64).unwrap();

        meta.begin();
        *meta.get_mut() = 11;
        meta.save(false).unwrap();
        assert_eq!(read_meta::<u64>(&path, FileKind::Trie).unwrap(), 11);

        meta.rollback().unwrap();
        assert_eq!(*meta.get(), 10);
        assert_eq!(read_meta::<u64>(&path, FileKind::Trie).unwrap(), 10);

        meta.begin();
        *meta.get_mut() = 12;
        meta.save(false).unwrap();
        meta.commit();
        let reopened = MetaFile::<u64>::open(&path, FileKind::Trie).unwrap();
        assert_eq!(*reopened.get(), 12);
    }
}
