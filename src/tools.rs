//! Small filesystem helpers shared by the CAS store and the recipe
//! store. Adapted from the teacher's `tools.rs`: atomic whole-file
//! replace via `mkstemp` + `rename`, and advisory `flock`-based
//! locking, kept because they work across threads, processes, and
//! tokio tasks alike.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Error};
use nix::fcntl::{flock, FlockArg};
use nix::sys::stat;
use nix::unistd;

/// Atomically replace the contents of `path` with `data`. Used for
/// whole-file rewrites of the hashes file (create, truncate) and for
/// `.iodtab`/config files; `wcommit`'s in-place slice updates use
/// positioned writes instead (see `manager::recipe_store`).
pub fn file_set_contents<P: AsRef<Path>>(
    path: P,
    data: &[u8],
    perm: Option<stat::Mode>,
) -> Result<(), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };

    let tmp_path = tmp_path.as_path();

    let mode: stat::Mode = perm.unwrap_or_else(|| {
        stat::Mode::S_IRUSR | stat::Mode::S_IWUSR | stat::Mode::S_IRGRP | stat::Mode::S_IROTH
    });

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(tmp_path);
        bail!("fchmod {:?} failed: {}", tmp_path, err);
    }

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(tmp_path);
        bail!("write failed: {}", err);
    }
    if let Err(err) = file.sync_all() {
        let _ = unistd::unlink(tmp_path);
        bail!("fsync failed: {}", err);
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        bail!("atomic rename failed for file {:?} - {}", path, err);
    }

    Ok(())
}

/// Open (creating if needed) and exclusively `flock` a lock file.
/// Used to serialize a REMOVEALL traversal against the rest of the
/// CAS store's worker pool (§4.A concurrency).
pub fn lock_file_exclusive<P: AsRef<Path>>(path: P) -> Result<File, Error> {
    let path = path.as_ref();
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .map_err(|err| anyhow::anyhow!("unable to open lock {:?} - {}", path, err))?;

    flock(file.as_raw_fd(), FlockArg::LockExclusive)
        .map_err(|err| anyhow::anyhow!("flock {:?} failed - {}", path, err))?;

    Ok(file)
}

/// Create a marker file at `path` if absent (used for `.capfsdir` /
/// `.capfsiod` sentinels, §4.A invariant A3).
pub fn ensure_sentinel<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    if path.exists() {
        return Ok(());
    }
    file_set_contents(path, b"", None)
}

pub fn has_sentinel<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_set_contents_is_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        file_set_contents(&path, b"one", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"one");
        file_set_contents(&path, b"two", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
    }

    #[test]
    fn sentinel_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".capfsdir");
        assert!(!has_sentinel(&path));
        ensure_sentinel(&path).unwrap();
        assert!(has_sentinel(&path));
        ensure_sentinel(&path).unwrap(); // idempotent
    }
}
