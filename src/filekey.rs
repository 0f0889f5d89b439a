//! `FileKey`: the cluster-wide identity of a CAPFS file (§3).

use serde::{Deserialize, Serialize};
use std::fmt;

/// `(manager-identity, filesystem-inode, file-inode)`, globally unique
/// within a cluster. Hardlinks are not supported (§9 open question 2),
/// so `f_ino` uniquely identifies one name-bearing file per `fs_ino`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey {
    pub manager_id: u32,
    pub fs_ino: u64,
    pub f_ino: u64,
}

impl FileKey {
    pub fn new(manager_id: u32, fs_ino: u64, f_ino: u64) -> Self {
        FileKey {
            manager_id,
            fs_ino,
            f_ino,
        }
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.manager_id, self.fs_ino, self.f_ino)
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileKey({})", self)
    }
}
