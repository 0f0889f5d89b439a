//! Metadata op engine (§4.F): the manager's state machine and every
//! named operation. Grounded on the teacher's `backup/datastore.rs`
//! open-file-table pattern (refcounted handles keyed by identity,
//! decremented at close, deferred deletion while a handle is live) and
//! on `recipe_store`/`callback_registry` for the D and E halves this
//! module ties together.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Error};

use crate::config::{CapfsConfig, IodTab};
use crate::error::CapfsError;
use crate::filekey::FileKey;
use crate::hash::{chunk_count, Hash, MAXHASHES};
use crate::manager::callback_registry::CallbackRegistry;
use crate::manager::recipe_store::{FileMetadata, RecipeStore};
use crate::policy::ConsistencyPolicy;

pub struct LookupResult {
    pub file: FileKey,
    pub size: u64,
}

pub struct OpenResult {
    pub file: FileKey,
    pub size: u64,
    pub base: usize,
    pub recipe: Option<Vec<Hash>>,
}

pub enum WcommitOutcome {
    Ok { current_hashes: Vec<Hash> },
    Conflict { current_hashes: Vec<Hash> },
}

struct OpenEntry {
    path: PathBuf,
    refcount: u32,
    unlink_pending: bool,
}

/// Process-wide manager state (§9 "Global state"): recipe store,
/// callback registry, the open-file table, and an index from `FileKey`
/// to on-disk path so RPCs that only carry a `FileKey` (gethashes,
/// wcommit, truncate, close) can find their files.
pub struct OpEngine {
    root: PathBuf,
    manager_id: u32,
    config: CapfsConfig,
    iodtab: IodTab,
    store: RecipeStore,
    callbacks: CallbackRegistry,
    open_files: Mutex<HashMap<FileKey, OpenEntry>>,
    file_index: Mutex<HashMap<FileKey, PathBuf>>,
    create_seq: AtomicU64,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl OpEngine {
    pub fn new(root: impl Into<PathBuf>, manager_id: u32, config: CapfsConfig, iodtab: IodTab) -> Self {
        let root = root.into();
        OpEngine {
            store: RecipeStore::new(&root),
            root,
            manager_id,
            config,
            iodtab,
            callbacks: CallbackRegistry::new(),
            open_files: Mutex::new(HashMap::new()),
            file_index: Mutex::new(HashMap::new()),
            create_seq: AtomicU64::new(0),
        }
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }

    fn index_path(&self, file: FileKey) -> Result<PathBuf, Error> {
        self.file_index
            .lock()
            .unwrap()
            .get(&file)
            .cloned()
            .ok_or_else(|| CapfsError::absence(format!("no such open file {:?}", file)).into())
    }

    fn index_insert(&self, file: FileKey, path: PathBuf) {
        self.file_index.lock().unwrap().insert(file, path);
    }

    fn index_remove(&self, file: FileKey) {
        self.file_index.lock().unwrap().remove(&file);
    }

    fn file_key_for(&self, path: &Path) -> Result<FileKey, Error> {
        let md = std::fs::metadata(path)?;
        Ok(FileKey::new(self.manager_id, md.dev(), md.ino()))
    }

    /// **lookup** (§4.F supplement): resolve one path against the
    /// manager's namespace, returning the identity and current size
    /// without affecting the open-file table.
    pub fn lookup(&self, name: &str) -> Result<LookupResult, Error> {
        let path = self.resolve(name);
        let meta = self.store.read_metadata(&path)?;
        self.index_insert(meta.file, path);
        Ok(LookupResult { file: meta.file, size: meta.size })
    }

    /// **open(name, flags, policy)** (§4.F).
    pub fn open(
        &self,
        name: &str,
        create: bool,
        policy_tag: &str,
        callback_id: Option<u32>,
    ) -> Result<OpenResult, Error> {
        let path = self.resolve(name);
        let policy = ConsistencyPolicy::parse(policy_tag)?;
        let flags = policy.decode();

        let (meta, created) = match self.store.read_metadata(&path) {
            Ok(meta) => (meta, false),
            Err(_) if create => (self.create_file(&path)?, true),
            Err(err) => return Err(err),
        };

        let result: Result<(), Error> = (|| {
            if flags.desire_hcache_coherence {
                if let Some(cb) = callback_id {
                    self.callbacks.add(meta.file, cb);
                }
            }
            let mut open_files = self.open_files.lock().unwrap();
            let entry = open_files.entry(meta.file).or_insert_with(|| OpenEntry {
                path: path.clone(),
                refcount: 0,
                unlink_pending: false,
            });
            entry.refcount += 1;
            Ok(())
        })();

        if let Err(err) = result {
            if created {
                self.store.delete(&path).ok();
            }
            return Err(err);
        }

        self.index_insert(meta.file, path.clone());

        let recipe = if flags.prefetch {
            let count = chunk_count(meta.size).min(MAXHASHES as u64);
            Some(self.store.read_slice(&path, 0, count)?)
        } else {
            None
        };

        Ok(OpenResult { file: meta.file, size: meta.size, base: meta.base, recipe })
    }

    fn create_file(&self, path: &Path) -> Result<FileMetadata, Error> {
        let seq = self.create_seq.fetch_add(1, Ordering::Relaxed);
        let placeholder = FileMetadata {
            file: FileKey::new(self.manager_id, 0, 0),
            size: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            atime: now_secs(),
            mtime: now_secs(),
            ctime: now_secs(),
            base: self.config_pick_base(seq),
            pcount: self.iodtab.servers.len().max(1),
            ssize: self.config.chunk_size,
        };
        self.store.create(path, &placeholder)?;

        // The real FileKey needs the inode, which only exists once the
        // metadata file has been written once.
        let file = self.file_key_for(path)?;
        let meta = FileMetadata { file, ..placeholder };
        self.store.write_metadata(path, &meta)?;
        Ok(meta)
    }

    fn config_pick_base(&self, seq: u64) -> usize {
        let n = self.iodtab.servers.len().max(1);
        match self.config.base_selection {
            crate::config::BaseSelection::RoundRobin => (seq as usize) % n,
            crate::config::BaseSelection::Random => {
                let mut x = seq ^ 0x9E3779B97F4A7C15;
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x as usize) % n
            }
        }
    }

    /// **close(file-key, times, policy)** (§4.F).
    pub fn close(&self, file: FileKey, atime: i64, mtime: i64, callback_id: Option<u32>) -> Result<(), Error> {
        if let Some(cb) = callback_id {
            self.callbacks.del(file, cb);
        }

        let path = self.index_path(file)?;
        let mut open_files = self.open_files.lock().unwrap();
        let reached_zero = match open_files.get_mut(&file) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => true,
        };

        if !reached_zero {
            return Ok(());
        }

        let unlink_pending = open_files.get(&file).map(|e| e.unlink_pending).unwrap_or(false);
        open_files.remove(&file);
        drop(open_files);

        if let Ok(mut meta) = self.store.read_metadata(&path) {
            meta.atime = atime;
            meta.mtime = mtime.max(meta.mtime);
            meta.ctime = mtime.max(meta.ctime);
            self.store.write_metadata(&path, &meta).ok();
        }

        if unlink_pending {
            self.store.delete(&path)?;
            self.index_remove(file);
        }
        Ok(())
    }

    /// **gethashes(name, begin, count)** (§4.F).
    pub fn gethashes(
        &self,
        file: FileKey,
        begin: u64,
        count: u64,
        callback_id: Option<u32>,
    ) -> Result<(Vec<Hash>, u64), Error> {
        let path = self.index_path(file)?;
        let (hashes, size) = self.store.with_read_lock(file, || -> Result<_, Error> {
            let meta = self.store.read_metadata(&path)?;
            let hashes = self.store.read_slice(&path, begin, count)?;
            Ok((hashes, meta.size))
        })?;

        if let Some(cb) = callback_id {
            self.callbacks.add(file, cb);
        }
        Ok((hashes, size))
    }

    /// **wcommit** (§4.F): the compare-and-swap core. Returns the
    /// post-commit current slice on success, or the manager's current
    /// slice (for rebase) on a CAS miss.
    pub async fn wcommit(
        &self,
        file: FileKey,
        begin: u64,
        old_hashes: &[Hash],
        new_hashes: &[Hash],
        write_size: u64,
        force_commit: bool,
        callback_id: Option<u32>,
    ) -> Result<WcommitOutcome, Error> {
        let path = self.index_path(file)?;

        enum Step {
            Conflict(Vec<Hash>),
            Committed { bitmap_before: u64, pre_image_len: usize },
        }

        let step = self.store.with_write_lock(file, || -> Result<Step, Error> {
            let mut meta = self.store.read_metadata(&path)?;
            let current = self.store.read_slice(&path, begin, new_hashes.len() as u64)?;

            if !force_commit && current != old_hashes {
                return Ok(Step::Conflict(current));
            }

            let existing_len = self.store.hashes_len(&path)?;
            let pre_image_len = if begin >= existing_len {
                0
            } else {
                ((existing_len - begin) as usize).min(new_hashes.len())
            };

            self.store.write_slice(&path, begin, new_hashes)?;
            meta.size = meta.size.max(write_size);
            let now = now_secs();
            meta.mtime = now;
            meta.atime = now;
            self.store.write_metadata(&path, &meta)?;

            let bitmap_before = self.callbacks.snapshot(file);
            Ok(Step::Committed { bitmap_before, pre_image_len })
        })?;

        match step {
            Step::Conflict(current_hashes) => Ok(WcommitOutcome::Conflict { current_hashes }),
            Step::Committed { bitmap_before, pre_image_len } => {
                self.callbacks
                    .dispatch_commit(file, callback_id, bitmap_before, pre_image_len, begin, new_hashes)
                    .await;
                Ok(WcommitOutcome::Ok { current_hashes: new_hashes.to_vec() })
            }
        }
    }

    /// **truncate(name, new_size)** (§4.F).
    pub async fn truncate(&self, file: FileKey, new_size: u64) -> Result<(), Error> {
        let path = self.index_path(file)?;
        let (old_n, new_n, bitmap) = self.store.with_write_lock(file, || -> Result<_, Error> {
            let mut meta = self.store.read_metadata(&path)?;
            let old_n = chunk_count(meta.size);
            let new_n = chunk_count(new_size);
            meta.size = new_size;
            self.store.write_metadata(&path, &meta)?;
            if new_n < old_n {
                self.store.truncate_hashes(&path, new_n)?;
            }
            let bitmap = self.callbacks.snapshot(file);
            Ok((old_n, new_n, bitmap))
        })?;

        if new_n < old_n {
            self.callbacks
                .send_invalidate(bitmap, file, Some(new_n), Some(old_n - new_n))
                .await;
        }
        Ok(())
    }

    /// **unlink(name, policy)** (§4.F): deferred while the file is
    /// open (marks unlinked-pending; `close` finishes the job).
    pub async fn unlink(&self, name: &str) -> Result<(), Error> {
        let path = self.resolve(name);
        let meta = self.store.read_metadata(&path)?;
        let file = meta.file;

        {
            let mut open_files = self.open_files.lock().unwrap();
            if let Some(entry) = open_files.get_mut(&file) {
                if entry.refcount > 0 {
                    entry.unlink_pending = true;
                    return Ok(());
                }
            }
        }

        self.store.delete(&path)?;
        self.index_remove(file);
        self.store.forget_locks(file);

        let bitmap = self.callbacks.clear_entry(file);
        self.callbacks.send_invalidate(bitmap, file, None, None).await;
        Ok(())
    }

    /// **rename(old, new)** (§4.F): two renames, restoring the first if
    /// the second fails.
    pub async fn rename(&self, old: &str, new: &str) -> Result<(), Error> {
        let old_path = self.resolve(old);
        let new_path = self.resolve(new);

        if self.store.read_metadata(&new_path).is_ok() {
            self.unlink(new).await?;
        }

        let old_hashes = FileMetadata::hashes_path(&old_path);
        let new_hashes = FileMetadata::hashes_path(&new_path);

        std::fs::rename(&old_path, &new_path)
            .with_context(|| format!("rename {:?} -> {:?} failed", old_path, new_path))?;

        if let Err(err) = std::fs::rename(&old_hashes, &new_hashes) {
            std::fs::rename(&new_path, &old_path).ok();
            return Err(err).with_context(|| {
                format!("rename of hashes file {:?} -> {:?} failed, restored metadata", old_hashes, new_hashes)
            });
        }

        if let Ok(meta) = self.store.read_metadata(&new_path) {
            self.index_insert(meta.file, new_path);
        }
        Ok(())
    }

    /// **getattr(file)**: read the persisted metadata record.
    pub fn getattr(&self, file: FileKey) -> Result<FileMetadata, Error> {
        let path = self.index_path(file)?;
        self.store.read_metadata(&path)
    }

    /// **setattr(file, mode, uid, gid)**: root-always-wins is enforced
    /// by the caller (the RPC boundary), not here.
    pub fn setattr(&self, file: FileKey, mode: Option<u32>, uid: Option<u32>, gid: Option<u32>) -> Result<(), Error> {
        let path = self.index_path(file)?;
        let mut meta = self.store.read_metadata(&path)?;
        if let Some(m) = mode {
            meta.mode = m;
        }
        if let Some(u) = uid {
            meta.uid = u;
        }
        if let Some(g) = gid {
            meta.gid = g;
        }
        meta.ctime = now_secs();
        self.store.write_metadata(&path, &meta)
    }

    /// **access(file, mode)**: permission check against the stored
    /// uid/gid/mode with the standard root-always-wins rule.
    pub fn access(&self, file: FileKey, caller_uid: u32, caller_gid: u32, want_write: bool) -> Result<bool, Error> {
        if caller_uid == 0 {
            return Ok(true);
        }
        let meta = self.getattr(file)?;
        let want = if want_write { 0o2 } else { 0o4 };
        let bits = if caller_uid == meta.uid {
            (meta.mode >> 6) & 0o7
        } else if caller_gid == meta.gid {
            (meta.mode >> 3) & 0o7
        } else {
            meta.mode & 0o7
        };
        Ok(bits & want != 0)
    }

    pub fn statfs(&self) -> Result<crate::cas::StatFs, Error> {
        let chunk_count = walkdir_file_count(&self.root);
        let (total_bytes, free_bytes) = crate::cas::store::statvfs_bytes(&self.root).unwrap_or((0, 0));
        Ok(crate::cas::StatFs { total_bytes, free_bytes, chunk_count })
    }

    /// **mkdir(name)** / **rmdir(name)**: plain directory passthrough
    /// under the manager's namespace root.
    pub fn mkdir(&self, name: &str) -> Result<(), Error> {
        std::fs::create_dir(self.resolve(name)).map_err(Error::from)
    }

    pub fn rmdir(&self, name: &str) -> Result<(), Error> {
        std::fs::remove_dir(self.resolve(name)).map_err(Error::from)
    }

    /// **symlink(name, target)** / **readlink(name)**.
    pub fn symlink(&self, name: &str, target: &str) -> Result<(), Error> {
        std::os::unix::fs::symlink(target, self.resolve(name)).map_err(Error::from)
    }

    pub fn readlink(&self, name: &str) -> Result<String, Error> {
        let target = std::fs::read_link(self.resolve(name))?;
        Ok(target.to_string_lossy().into_owned())
    }

    /// **link(old, new)**: hardlinks are compiled out (§9 open question
    /// 2) — the core rejects them rather than silently degrading.
    pub fn link(&self, _old: &str, _new: &str) -> Result<(), Error> {
        Err(CapfsError::protocol("hardlinks are not supported by this core").into())
    }

    /// **readdir/getdents(name, cursor)**: filters the `.iodtab`/
    /// `.capfsdir` sentinel names and the `.hashes` shadow files,
    /// returning a portable `(name, next_cursor)` stream. `cursor` is
    /// opaque to the client: it is simply "entries already returned".
    pub fn getdents(&self, name: &str, cursor: usize, max: usize) -> Result<(Vec<String>, usize), Error> {
        let dir = self.resolve(name);
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .with_context(|| format!("readdir {:?} failed", dir))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| {
                n != crate::config::CAPFSDIR_SENTINEL
                    && n != crate::config::CAPFSIOD_SENTINEL
                    && !n.ends_with(".hashes")
            })
            .collect();
        names.sort();

        let end = (cursor + max).min(names.len());
        let page = if cursor >= names.len() {
            Vec::new()
        } else {
            names[cursor..end].to_vec()
        };
        Ok((page, end))
    }
}

fn walkdir_file_count(root: &Path) -> u64 {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BaseSelection, CapfsConfig};

    fn engine() -> (tempfile::TempDir, OpEngine) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = CapfsConfig::default();
        cfg.base_selection = BaseSelection::RoundRobin;
        let engine = OpEngine::new(dir.path(), 1, cfg, IodTab::default());
        (dir, engine)
    }

    #[test]
    fn open_with_create_then_lookup_agree_on_file_key() {
        let (_dir, engine) = engine();
        let opened = engine.open("a.txt", true, "posix", None).unwrap();
        assert_eq!(opened.size, 0);
        let looked = engine.lookup("a.txt").unwrap();
        assert_eq!(looked.file, opened.file);
    }

    #[tokio::test]
    async fn wcommit_round_trip_then_gethashes_sees_it() {
        let (_dir, engine) = engine();
        let opened = engine.open("f", true, "posix", None).unwrap();
        let hashes = vec![Hash::of(b"a"), Hash::of(b"b")];
        let outcome = engine
            .wcommit(opened.file, 0, &[], &hashes, 2 * crate::hash::CHUNK as u64, false, None)
            .await
            .unwrap();
        match outcome {
            WcommitOutcome::Ok { current_hashes } => assert_eq!(current_hashes, hashes),
            WcommitOutcome::Conflict { .. } => panic!("expected success"),
        }
        let (got, size) = engine.gethashes(opened.file, 0, 2, None).unwrap();
        assert_eq!(got, hashes);
        assert_eq!(size, 2 * crate::hash::CHUNK as u64);
    }

    #[tokio::test]
    async fn wcommit_mismatch_returns_conflict_with_current() {
        let (_dir, engine) = engine();
        let opened = engine.open("f", true, "posix", None).unwrap();
        let first = vec![Hash::of(b"a")];
        engine.wcommit(opened.file, 0, &[], &first, crate::hash::CHUNK as u64, false, None).await.unwrap();

        let stale_old = vec![Hash::ZERO];
        let second = vec![Hash::of(b"b")];
        let outcome = engine
            .wcommit(opened.file, 0, &stale_old, &second, crate::hash::CHUNK as u64, false, None)
            .await
            .unwrap();
        match outcome {
            WcommitOutcome::Conflict { current_hashes } => assert_eq!(current_hashes, first),
            WcommitOutcome::Ok { .. } => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn truncate_shrinks_and_gethashes_reflects_it() {
        let (_dir, engine) = engine();
        let opened = engine.open("f", true, "posix", None).unwrap();
        let hashes = vec![Hash::of(b"a"), Hash::of(b"b"), Hash::of(b"c")];
        engine
            .wcommit(opened.file, 0, &[], &hashes, 3 * crate::hash::CHUNK as u64, false, None)
            .await
            .unwrap();

        engine.truncate(opened.file, crate::hash::CHUNK as u64).await.unwrap();
        let (got, _) = engine.gethashes(opened.file, 0, 3, None).unwrap();
        assert_eq!(got[0], hashes[0]);
        assert_eq!(got[1], Hash::ZERO);
    }

    #[tokio::test]
    async fn unlink_while_open_defers_to_close() {
        let (_dir, engine) = engine();
        let opened = engine.open("f", true, "posix", None).unwrap();
        engine.unlink("f").await.unwrap();
        // Still resolvable via its FileKey: deletion deferred.
        assert!(engine.getattr(opened.file).is_ok());
        engine.close(opened.file, 0, 0, None).unwrap();
        assert!(engine.getattr(opened.file).is_err());
    }

    #[tokio::test]
    async fn rename_moves_metadata_and_hashes() {
        let (_dir, engine) = engine();
        let opened = engine.open("old", true, "posix", None).unwrap();
        let hashes = vec![Hash::of(b"a")];
        engine.wcommit(opened.file, 0, &[], &hashes, crate::hash::CHUNK as u64, false, None).await.unwrap();

        engine.rename("old", "new").await.unwrap();
        let looked = engine.lookup("new").unwrap();
        assert_eq!(looked.file, opened.file);
        let (got, _) = engine.gethashes(looked.file, 0, 1, None).unwrap();
        assert_eq!(got, hashes);
    }

    #[test]
    fn getdents_filters_sentinels_and_hashes_files() {
        let (dir, engine) = engine();
        engine.open("visible", true, "posix", None).unwrap();
        std::fs::write(dir.path().join(".capfsdir"), b"").unwrap();
        let (page, _cursor) = engine.getdents(".", 0, 10).unwrap();
        assert!(page.contains(&"visible".to_string()));
        assert!(!page.contains(&".capfsdir".to_string()));
        assert!(!page.iter().any(|n| n.ends_with(".hashes")));
    }
}
