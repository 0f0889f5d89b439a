//! Configuration structs and on-disk config loading (§6 "CLI surface",
//! §9 design note "Global state"). The source keeps several
//! process-wide singletons (recipe-store root, callback registry,
//! thread pools); here they are plain fields on the structs that
//! actually need them (`OpEngine`, `FileHandle`, ...) instead, per §9
//! — no wrapper context struct threaded through calls that don't need
//! most of its fields.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

use crate::policy::ConsistencyPolicy;

/// Round-robin or random base-server selection for new file striping
/// (§4.F `open`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseSelection {
    RoundRobin,
    Random,
}

/// The enumerated manager/client configuration surface of spec §6.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapfsConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub port: u16,
    pub thread_count: usize,
    pub stripe_size: usize,
    pub base_selection: BaseSelection,
    pub handle_caching: bool,
    pub chunk_size: usize,
    pub hcache_size: usize,
    pub consistency_policy: String,
}

impl Default for CapfsConfig {
    fn default() -> Self {
        CapfsConfig {
            data_dir: PathBuf::from("/var/lib/capfs"),
            log_dir: PathBuf::from("/var/log/capfs"),
            log_level: "info".into(),
            port: 7017,
            thread_count: num_cpus_fallback(),
            stripe_size: crate::hash::CHUNK,
            base_selection: BaseSelection::RoundRobin,
            handle_caching: true,
            chunk_size: crate::hash::CHUNK,
            hcache_size: crate::hash::HCACHE_COUNT,
            consistency_policy: "posix".into(),
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl CapfsConfig {
    /// Parse a `key = value` config file, one setting per line, `#`
    /// comments allowed. Unknown keys are rejected (Protocol-class
    /// error at config-load time keeps a bad deployment from starting
    /// with a silently-ignored setting).
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config {:?}", path))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut cfg = CapfsConfig::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .with_context(|| format!("line {}: expected 'key = value'", lineno + 1))?;
            let key = key.trim();
            let value = value.trim();
            match key {
                "data_dir" => cfg.data_dir = PathBuf::from(value),
                "log_dir" => cfg.log_dir = PathBuf::from(value),
                "log_level" => cfg.log_level = value.to_owned(),
                "port" => cfg.port = value.parse().context("invalid port")?,
                "thread_count" => cfg.thread_count = value.parse().context("invalid thread_count")?,
                "stripe_size" => cfg.stripe_size = value.parse().context("invalid stripe_size")?,
                "base_selection" => {
                    cfg.base_selection = match value {
                        "round-robin" => BaseSelection::RoundRobin,
                        "random" => BaseSelection::Random,
                        other => bail!("invalid base_selection '{}'", other),
                    }
                }
                "handle_caching" => cfg.handle_caching = value.parse().context("invalid handle_caching")?,
                "chunk_size" => cfg.chunk_size = value.parse().context("invalid chunk_size")?,
                "hcache_size" => cfg.hcache_size = value.parse().context("invalid hcache_size")?,
                "consistency_policy" => {
                    // validated eagerly so a typo fails at load time, not first open()
                    ConsistencyPolicy::parse(value)?;
                    cfg.consistency_policy = value.to_owned();
                }
                other => bail!("unknown config key '{}'", other),
            }
        }
        Ok(cfg)
    }

    pub fn default_policy(&self) -> ConsistencyPolicy {
        ConsistencyPolicy::parse(&self.consistency_policy).unwrap_or(ConsistencyPolicy::Posix)
    }
}

/// One entry of `.iodtab`: a data server this manager stripes files
/// across (§6 on-disk layout).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataServerEntry {
    pub index: usize,
    pub addr: SocketAddr,
}

/// Parsed `.iodtab` (§6): the ordered list of data servers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IodTab {
    pub servers: Vec<DataServerEntry>,
}

impl IodTab {
    pub const FILE_NAME: &'static str = ".iodtab";

    pub fn load(root: &Path) -> Result<Self, Error> {
        let path = root.join(Self::FILE_NAME);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("unable to read {:?}", path))?;
        let mut servers = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let addr: SocketAddr = line
                .parse()
                .with_context(|| format!("{:?}: invalid data server address '{}'", path, line))?;
            servers.push(DataServerEntry { index: i, addr });
        }
        Ok(IodTab { servers })
    }

    pub fn save(&self, root: &Path) -> Result<(), Error> {
        let path = root.join(Self::FILE_NAME);
        let mut text = String::new();
        for entry in &self.servers {
            text.push_str(&entry.addr.to_string());
            text.push('\n');
        }
        crate::tools::file_set_contents(&path, text.as_bytes(), None)
    }
}

/// The sentinel marking a manager's root metadata directory as managed
/// (§6 on-disk layout, §4.A invariant A3 analog on the manager side).
pub const CAPFSDIR_SENTINEL: &str = ".capfsdir";

/// The sentinel marking a data server's data directory as managed
/// (§4.A invariant A3).
pub const CAPFSIOD_SENTINEL: &str = ".capfsiod";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_unknown_key() {
        let err = CapfsConfig::parse("bogus = 1\n").unwrap_err();
        assert!(err.to_string().contains("unknown config key"));
    }

    #[test]
    fn parse_accepts_known_keys() {
        let cfg = CapfsConfig::parse("port = 9000\nchunk_size = 4096\nbase_selection = random\n").unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.chunk_size, 4096);
        assert_eq!(cfg.base_selection, BaseSelection::Random);
    }

    #[test]
    fn iodtab_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let tab = IodTab {
            servers: vec![
                DataServerEntry { index: 0, addr: "127.0.0.1:7001".parse().unwrap() },
                DataServerEntry { index: 1, addr: "127.0.0.1:7002".parse().unwrap() },
            ],
        };
        tab.save(dir.path()).unwrap();
        let loaded = IodTab::load(dir.path()).unwrap();
        assert_eq!(loaded.servers.len(), 2);
        assert_eq!(loaded.servers[1].addr, tab.servers[1].addr);
    }
}
