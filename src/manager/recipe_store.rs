//! Recipe store (§4.D): per-file metadata and hashes files on the
//! manager's local disk, each guarded by a per-file reader/writer
//! lock keyed by inode. Whole-file rewrites (create, shrink-truncate)
//! go through the teacher's mkstemp+rename atomic-replace idiom;
//! in-place `wcommit` slice updates use positioned writes, since
//! rewriting the whole hashes file per commit would make every write
//! O(file size).

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use crate::error::CapfsError;
use crate::filekey::FileKey;
use crate::hash::{Hash, HASHLEN};

/// Per-file metadata persisted alongside the hashes file (§4.D).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file: FileKey,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    /// Striping parameters chosen at `open`-with-`O_CREAT` time.
    pub base: usize,
    pub pcount: usize,
    pub ssize: usize,
}

impl FileMetadata {
    pub fn hashes_path(meta_path: &Path) -> PathBuf {
        let mut p = meta_path.as_os_str().to_owned();
        p.push(".hashes");
        PathBuf::from(p)
    }
}

/// A per-file readers-writer lock, held only for the duration of the
/// recipe read/write and callback bookkeeping (§4.D, §5).
struct FileLocks {
    locks: Mutex<HashMap<FileKey, Arc<RwLock<()>>>>,
}

impl FileLocks {
    fn new() -> Self {
        FileLocks { locks: Mutex::new(HashMap::new()) }
    }

    fn get(&self, file: FileKey) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(file).or_insert_with(|| Arc::new(RwLock::new(()))).clone()
    }

    fn forget(&self, file: FileKey) {
        self.locks.lock().unwrap().remove(&file);
    }
}

pub struct RecipeStore {
    root: PathBuf,
    locks: FileLocks,
}

impl RecipeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RecipeStore {
            root: root.into(),
            locks: FileLocks::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `f` under the writer lock for `file`; the lock is held for
    /// exactly `f`'s call, then released before `f`'s return value is
    /// handed back — callers that need to dispatch callbacks do so
    /// after this returns, never while still holding the lock (§5 O4).
    pub fn with_write_lock<R>(&self, file: FileKey, f: impl FnOnce() -> R) -> R {
        let arc = self.locks.get(file);
        let _guard = arc.write().unwrap();
        f()
    }

    pub fn with_read_lock<R>(&self, file: FileKey, f: impl FnOnce() -> R) -> R {
        let arc = self.locks.get(file);
        let _guard = arc.read().unwrap();
        f()
    }

    pub fn forget_locks(&self, file: FileKey) {
        self.locks.forget(file);
    }

    /// Create the metadata + (empty) hashes files for a new path.
    pub fn create(&self, path: &Path, meta: &FileMetadata) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        self.write_metadata(path, meta)?;
        crate::tools::file_set_contents(FileMetadata::hashes_path(path), b"", None)
            .context("creating empty hashes file")?;
        Ok(())
    }

    pub fn read_metadata(&self, path: &Path) -> Result<FileMetadata, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| CapfsError::absence(format!("no such file {:?}", path)))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write_metadata(&self, path: &Path, meta: &FileMetadata) -> Result<(), Error> {
        let text = serde_json::to_vec_pretty(meta)?;
        crate::tools::file_set_contents(path, &text, None)
    }

    pub fn delete(&self, path: &Path) -> Result<(), Error> {
        let hashes = FileMetadata::hashes_path(path);
        std::fs::remove_file(path).ok();
        std::fs::remove_file(hashes).ok();
        Ok(())
    }

    /// Read the recipe slice `[begin, begin+count)`. Indices at or
    /// beyond the current hashes-file length are implicitly
    /// zero-hash (§9 open question 1: absence reads as all-zero).
    pub fn read_slice(&self, path: &Path, begin: u64, count: u64) -> Result<Vec<Hash>, Error> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let hashes_path = FileMetadata::hashes_path(path);
        let file = match OpenOptions::new().read(true).open(&hashes_path) {
            Ok(f) => f,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(vec![Hash::ZERO; count as usize]);
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        let mut out = Vec::with_capacity(count as usize);
        let mut buf = [0u8; HASHLEN];
        for i in begin..begin + count {
            let offset = i * HASHLEN as u64;
            if offset + HASHLEN as u64 > len {
                out.push(Hash::ZERO);
                continue;
            }
            file.read_exact_at(&mut buf, offset)?;
            out.push(Hash(buf));
        }
        Ok(out)
    }

    /// Write `hashes` at `[begin, begin+hashes.len())`, extending the
    /// file (and implicitly zero-filling any gap before `begin`) if
    /// needed. Must be called under the writer lock.
    pub fn write_slice(&self, path: &Path, begin: u64, hashes: &[Hash]) -> Result<(), Error> {
        if hashes.is_empty() {
            return Ok(());
        }
        let hashes_path = FileMetadata::hashes_path(path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&hashes_path)?;
        for (i, h) in hashes.iter().enumerate() {
            let offset = (begin + i as u64) * HASHLEN as u64;
            file.write_all_at(&h.0, offset)?;
        }
        file.sync_data()?;
        Ok(())
    }

    /// Truncate the hashes file to hold exactly `new_count` entries
    /// (invariant I3). No-op (the file is left to grow lazily via
    /// future commits) when `new_count` exceeds the current length.
    pub fn truncate_hashes(&self, path: &Path, new_count: u64) -> Result<(), Error> {
        let hashes_path = FileMetadata::hashes_path(path);
        let new_len = new_count * HASHLEN as u64;
        match OpenOptions::new().write(true).open(&hashes_path) {
            Ok(file) => {
                let cur_len = file.metadata()?.len();
                if new_len < cur_len {
                    file.set_len(new_len)?;
                }
                Ok(())
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn hashes_len(&self, path: &Path) -> Result<u64, Error> {
        let hashes_path = FileMetadata::hashes_path(path);
        match std::fs::metadata(&hashes_path) {
            Ok(m) => Ok(m.len() / HASHLEN as u64),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(file: FileKey) -> FileMetadata {
        FileMetadata {
            file,
            size: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            base: 0,
            pcount: 1,
            ssize: crate::hash::CHUNK,
        }
    }

    #[test]
    fn slice_past_eof_reads_as_zero_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecipeStore::new(dir.path());
        let path = dir.path().join("f");
        let fk = FileKey::new(1, 1, 1);
        store.create(&path, &meta(fk)).unwrap();

        let slice = store.read_slice(&path, 0, 3).unwrap();
        assert_eq!(slice, vec![Hash::ZERO; 3]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecipeStore::new(dir.path());
        let path = dir.path().join("f");
        let fk = FileKey::new(1, 1, 1);
        store.create(&path, &meta(fk)).unwrap();

        let hashes = vec![Hash::of(b"a"), Hash::of(b"b")];
        store.write_slice(&path, 0, &hashes).unwrap();
        let slice = store.read_slice(&path, 0, 2).unwrap();
        assert_eq!(slice, hashes);
        assert_eq!(store.hashes_len(&path).unwrap(), 2);
    }

    #[test]
    fn truncate_shrinks_hash_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecipeStore::new(dir.path());
        let path = dir.path().join("f");
        let fk = FileKey::new(1, 1, 1);
        store.create(&path, &meta(fk)).unwrap();
        store.write_slice(&path, 0, &[Hash::of(b"a"), Hash::of(b"b"), Hash::of(b"c")]).unwrap();

        store.truncate_hashes(&path, 1).unwrap();
        assert_eq!(store.hashes_len(&path).unwrap(), 1);
        let slice = store.read_slice(&path, 0, 3).unwrap();
        assert_eq!(slice[0], Hash::of(b"a"));
        assert_eq!(slice[1], Hash::ZERO);
    }

    #[test]
    fn writer_and_reader_locks_are_exclusive_and_shared() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecipeStore::new(dir.path());
        let fk = FileKey::new(1, 1, 1);

        // Two concurrent readers must not deadlock.
        store.with_read_lock(fk, || {
            store.with_read_lock(fk, || {});
        });

        store.with_write_lock(fk, || {});
    }
}
