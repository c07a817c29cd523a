//! The file-backed key-value store behind the node's data directory.
//!
//! One file per key, the key hex-encoded as the file name. Values are
//! written to a temporary sibling and renamed into place, so a crash
//! mid-write leaves either the old value or the new one, never a torn file.
//! Leftover temporaries are not valid hex and are invisible to reads.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use stoa_api::storage::KvStore;
use stoa_types::error::StorageError;

/// A [`KvStore`] over a directory of files.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens the store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<FileStore, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_err)?;
        Ok(FileStore { dir })
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        self.dir.join(hex::encode(key))
    }
}

fn io_err(e: io::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

impl KvStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let staging = path.with_extension("tmp");
        fs::write(&staging, value).map_err(io_err)?;
        fs::rename(&staging, &path).map_err(io_err)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Ok(key) = hex::decode(name) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            let value = fs::read(entry.path()).map_err(io_err)?;
            entries.push((key, value));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        store.put(b"a", b"2").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));
        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        store.delete(b"a").unwrap();
    }

    #[test]
    fn values_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.put(b"meta", b"7").unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"meta").unwrap(), Some(b"7".to_vec()));
    }

    #[test]
    fn prefix_iteration_is_sorted_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put(b"x::b", b"2").unwrap();
        store.put(b"x::a", b"1").unwrap();
        store.put(b"y::a", b"3").unwrap();
        let entries = store.iter_prefix(b"x::").unwrap();
        assert_eq!(
            entries,
            vec![
                (b"x::a".to_vec(), b"1".to_vec()),
                (b"x::b".to_vec(), b"2".to_vec()),
            ]
        );
    }
}
