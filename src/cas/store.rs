//! Filesystem-backed CAS store (§4.A). Grounded on the teacher's
//! `ChunkStore` (two-level directory fan-out, sentinel-gated
//! destructive sweeps, content-deterministic PUTs needing no per-hash
//! lock) with the dynamic-chunking / encryption machinery stripped out
//! — CAPFS chunks are fixed-size and stored as raw bytes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Error};
use walkdir::WalkDir;

use crate::config::CAPFSIOD_SENTINEL;
use crate::error::{CapfsError, ErrorKind};
use crate::hash::{Hash, CHUNK};
use crate::tools;

/// Per-chunk outcome of a PUT (§4.A).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    AlreadyPresent,
    /// Zero chunk: elided, never written (invariant A2).
    Elided,
}

/// Per-chunk outcome of a GET.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkStatus {
    Ok,
    NotFound,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StatFs {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub chunk_count: u64,
}

/// A filesystem-backed, content-addressable chunk store.
///
/// PUTs are content-deterministic (the file name *is* the content
/// hash), so concurrent PUTs of the same hash converge without a
/// per-hash lock (§4.A concurrency). The zero chunk is never
/// persisted (invariant A2); `GET` synthesizes it.
pub struct ChunkStore {
    name: String,
    base: PathBuf,
    bytes_stored: AtomicU64,
}

impl ChunkStore {
    /// Open an existing, already-initialized store rooted at `base`.
    pub fn open(name: &str, base: impl Into<PathBuf>) -> Result<Self, Error> {
        let base = base.into();
        if !tools::has_sentinel(base.join(CAPFSIOD_SENTINEL)) {
            bail!(
                "refusing to use {:?} as a data directory: missing {} sentinel",
                base,
                CAPFSIOD_SENTINEL
            );
        }
        Ok(ChunkStore {
            name: name.to_owned(),
            base,
            bytes_stored: AtomicU64::new(0),
        })
    }

    /// Initialize a fresh data directory: lay down the sentinel and
    /// create the two-level fan-out of subdirectories (invariant A3).
    pub fn create(name: &str, base: impl Into<PathBuf>) -> Result<Self, Error> {
        let base: PathBuf = base.into();
        std::fs::create_dir_all(&base)
            .with_context(|| format!("unable to create data dir {:?}", base))?;

        tools::ensure_sentinel(base.join(CAPFSIOD_SENTINEL))?;

        for i in 0u32..256 {
            let l1 = base.join(format!("{:02x}", i));
            std::fs::create_dir_all(&l1)
                .with_context(|| format!("unable to create fan-out dir {:?}", l1))?;
        }

        Self::open(name, base)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn chunk_path(&self, hash: &Hash) -> PathBuf {
        let (l1, l2, full) = hash.fanout_path();
        self.base.join(l1).join(l2).join(full)
    }

    /// PUT one chunk. Idempotent: if the file already exists, we trust
    /// content-addressing (invariant A1) and skip the write.
    pub fn put_chunk(&self, hash: &Hash, data: &[u8]) -> Result<PutOutcome, Error> {
        if hash.is_zero() {
            return Ok(PutOutcome::Elided);
        }
        let path = self.chunk_path(hash);
        if path.exists() {
            return Ok(PutOutcome::AlreadyPresent);
        }
        let dir = path.parent().unwrap();
        std::fs::create_dir_all(dir).ok();

        // mkstemp+rename: concurrent PUTs of the same hash converge to
        // the same on-disk bytes without a per-hash lock.
        let mut tmp = path.clone();
        tmp.set_extension("tmp");
        std::fs::write(&tmp, data)
            .map_err(|e| CapfsError::resource(format!("write {:?} failed: {}", tmp, e)))?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            CapfsError::resource(format!("rename {:?} failed: {}", path, e))
        })?;

        self.bytes_stored
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(PutOutcome::Stored)
    }

    /// PUT a batch; returns per-chunk outcome and total bytes newly
    /// stored (§4.A PUT).
    pub fn put_batch(&self, hashes: &[Hash], blocks: &[Vec<u8>]) -> Result<(Vec<PutOutcome>, u64), Error> {
        if hashes.len() != blocks.len() {
            bail!("put_batch: hashes/blocks length mismatch");
        }
        let mut out = Vec::with_capacity(hashes.len());
        let mut total = 0u64;
        for (h, b) in hashes.iter().zip(blocks.iter()) {
            let before = self.bytes_stored.load(Ordering::Relaxed);
            let outcome = self.put_chunk(h, b)?;
            let after = self.bytes_stored.load(Ordering::Relaxed);
            total += after - before;
            out.push(outcome);
        }
        Ok((out, total))
    }

    /// GET one chunk. The zero-hash is synthesized with no disk access
    /// (invariant A2, spec §8 property 2).
    pub fn get_chunk(&self, hash: &Hash) -> Result<(ChunkStatus, Vec<u8>), Error> {
        if hash.is_zero() {
            return Ok((ChunkStatus::Ok, vec![0u8; CHUNK]));
        }
        let path = self.chunk_path(hash);
        match std::fs::read(&path) {
            Ok(data) => Ok((ChunkStatus::Ok, data)),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok((ChunkStatus::NotFound, Vec::new()))
            }
            Err(e) => Err(CapfsError::new(ErrorKind::Resource, e.to_string()).into()),
        }
    }

    /// GET a batch; concatenated data plus per-chunk status (§4.A GET).
    pub fn get_batch(&self, hashes: &[Hash]) -> Result<(Vec<ChunkStatus>, Vec<u8>), Error> {
        let mut statuses = Vec::with_capacity(hashes.len());
        let mut data = Vec::new();
        for h in hashes {
            let (status, chunk) = self.get_chunk(h)?;
            statuses.push(status);
            data.extend_from_slice(&chunk);
        }
        Ok((statuses, data))
    }

    pub fn statfs(&self) -> Result<StatFs, Error> {
        let mut chunk_count = 0u64;
        for entry in WalkDir::new(&self.base).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                let name = entry.file_name().to_string_lossy();
                if name.len() == 40 && name.bytes().all(|b| b.is_ascii_hexdigit()) {
                    chunk_count += 1;
                }
            }
        }
        // Real disk usage needs statvfs(2); kept here so a caller can
        // compose it without a second traversal.
        let (total_bytes, free_bytes) = statvfs_bytes(&self.base).unwrap_or((0, 0));
        Ok(StatFs {
            total_bytes,
            free_bytes,
            chunk_count,
        })
    }

    /// Breadth-first REMOVEALL (§4.A): unlink every regular file under
    /// a directory that itself contains the sentinel; directories
    /// without it are skipped and reported, never emptied. The first
    /// traversal error is fatal; later ones are aggregated.
    ///
    /// Callers must externally serialize this against live PUT/GET
    /// traffic (§4.A concurrency) -- this store does not lock for it.
    pub fn removeall(&self, dir: &Path) -> Result<RemoveAllReport, Error> {
        if !tools::has_sentinel(dir.join(CAPFSIOD_SENTINEL)) {
            return Ok(RemoveAllReport {
                removed: 0,
                skipped_dirs: vec![dir.to_owned()],
                errors: Vec::new(),
            });
        }

        let mut removed = 0u64;
        let mut skipped_dirs = Vec::new();
        let mut errors = Vec::new();
        let mut first_error: Option<Error> = None;

        for entry in WalkDir::new(dir).min_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let err = anyhow::anyhow!("traversal error under {:?}: {}", dir, e);
                    if first_error.is_none() {
                        first_error = Some(anyhow::anyhow!("{}", err));
                    }
                    errors.push(err.to_string());
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                if !tools::has_sentinel(entry.path().join(CAPFSIOD_SENTINEL)) && entry.path() != dir {
                    skipped_dirs.push(entry.path().to_owned());
                }
                continue;
            }

            if entry.file_type().is_file() {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        let err = anyhow::anyhow!("unlink {:?} failed: {}", entry.path(), e);
                        if first_error.is_none() {
                            first_error = Some(anyhow::anyhow!("{}", err));
                        }
                        errors.push(err.to_string());
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err.context(format!(
                "removeall of {:?} failed ({} other errors aggregated)",
                dir,
                errors.len().saturating_sub(1)
            )));
        }

        Ok(RemoveAllReport {
            removed,
            skipped_dirs,
            errors,
        })
    }
}

#[derive(Debug, Default)]
pub struct RemoveAllReport {
    pub removed: u64,
    pub skipped_dirs: Vec<PathBuf>,
    pub errors: Vec<String>,
}

pub(crate) fn statvfs_bytes(path: &Path) -> Result<(u64, u64), Error> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    let total = stat.blocks() as u64 * stat.fragment_size() as u64;
    let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    Ok((total, free))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::create("test", dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn zero_chunk_never_touches_disk() {
        let (_dir, store) = store();
        let outcome = store.put_chunk(&Hash::ZERO, &vec![0u8; CHUNK]).unwrap();
        assert_eq!(outcome, PutOutcome::Elided);
        let (status, data) = store.get_chunk(&Hash::ZERO).unwrap();
        assert_eq!(status, ChunkStatus::Ok);
        assert_eq!(data, vec![0u8; CHUNK]);
        assert!(!store.chunk_path(&Hash::ZERO).exists());
    }

    #[test]
    fn hash_integrity_round_trip() {
        let (_dir, store) = store();
        let data = vec![0xA5u8; CHUNK];
        let h = crate::hash::hash_chunk(&data);
        store.put_chunk(&h, &data).unwrap();
        let (status, readback) = store.get_chunk(&h).unwrap();
        assert_eq!(status, ChunkStatus::Ok);
        assert_eq!(crate::hash::hash_chunk(&readback), h);
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = store();
        let data = vec![7u8; CHUNK];
        let h = crate::hash::hash_chunk(&data);
        assert_eq!(store.put_chunk(&h, &data).unwrap(), PutOutcome::Stored);
        assert_eq!(store.put_chunk(&h, &data).unwrap(), PutOutcome::AlreadyPresent);
    }

    #[test]
    fn get_missing_chunk_reports_not_found() {
        let (_dir, store) = store();
        let h = crate::hash::hash_chunk(b"never stored");
        let (status, data) = store.get_chunk(&h).unwrap();
        assert_eq!(status, ChunkStatus::NotFound);
        assert!(data.is_empty());
    }

    #[test]
    fn removeall_skips_unmarked_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("not-managed")).unwrap();
        let store = ChunkStore::open("t", dir.path()).err();
        assert!(store.is_some()); // no sentinel yet at root
        let managed = ChunkStore::create("t", dir.path().join("managed")).unwrap();
        let report = managed.removeall(&dir.path().join("not-managed")).unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(report.skipped_dirs, vec![dir.path().join("not-managed")]);
    }

    #[test]
    fn removeall_under_sentinel_removes_files() {
        let (_dir, store) = store();
        let data = vec![1u8; CHUNK];
        let h = crate::hash::hash_chunk(&data);
        store.put_chunk(&h, &data).unwrap();
        let report = store.removeall(store.base()).unwrap();
        assert!(report.removed >= 1);
        let (status, _) = store.get_chunk(&h).unwrap();
        assert_eq!(status, ChunkStatus::NotFound);
    }
}
