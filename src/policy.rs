//! Consistency policy adapter (§4.H). A fixed enumeration, decoded to
//! three booleans plus the open-time prefetch flag; this is the entire
//! surface of CAPFS's "pluggable" consistency system (§9 design note 3
//! — the source's plugin registration machinery is not worth
//! preserving, so we model it as a closed `enum` rather than a trait
//! object registry).

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyPolicy {
    Posix,
    Session,
    Immutable,
    Transactional,
    Force,
    Pvfs,
    /// `o`-prefixed variant: same booleans as the base policy, plus a
    /// full-file hash prefetch at open time.
    OpenFill(Box<ConsistencyPolicy>),
}

/// The decoded booleans §4.H describes, plus `prefetch`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PolicyFlags {
    pub force_commit: bool,
    pub desire_hcache_coherence: bool,
    pub delay_commit_until_close: bool,
    pub prefetch: bool,
}

impl ConsistencyPolicy {
    pub fn decode(&self) -> PolicyFlags {
        match self {
            ConsistencyPolicy::Posix => PolicyFlags {
                force_commit: false,
                desire_hcache_coherence: true,
                delay_commit_until_close: false,
                prefetch: false,
            },
            ConsistencyPolicy::Session => PolicyFlags {
                force_commit: true,
                desire_hcache_coherence: true,
                delay_commit_until_close: true,
                prefetch: false,
            },
            ConsistencyPolicy::Immutable => PolicyFlags {
                force_commit: true,
                desire_hcache_coherence: true,
                delay_commit_until_close: true,
                prefetch: false,
            },
            ConsistencyPolicy::Transactional => PolicyFlags {
                force_commit: false,
                desire_hcache_coherence: true,
                delay_commit_until_close: true,
                prefetch: false,
            },
            ConsistencyPolicy::Force => PolicyFlags {
                force_commit: true,
                desire_hcache_coherence: true,
                delay_commit_until_close: false,
                prefetch: false,
            },
            ConsistencyPolicy::Pvfs => PolicyFlags {
                force_commit: true,
                desire_hcache_coherence: false,
                delay_commit_until_close: false,
                prefetch: false,
            },
            ConsistencyPolicy::OpenFill(inner) => PolicyFlags {
                prefetch: true,
                ..inner.decode()
            },
        }
    }

    pub fn name(&self) -> String {
        match self {
            ConsistencyPolicy::Posix => "posix".into(),
            ConsistencyPolicy::Session => "session".into(),
            ConsistencyPolicy::Immutable => "immutable".into(),
            ConsistencyPolicy::Transactional => "transactional".into(),
            ConsistencyPolicy::Force => "force".into(),
            ConsistencyPolicy::Pvfs => "pvfs".into(),
            ConsistencyPolicy::OpenFill(inner) => format!("o{}", inner.name()),
        }
    }

    pub fn parse(tag: &str) -> anyhow::Result<ConsistencyPolicy> {
        if let Some(rest) = tag.strip_prefix('o') {
            if let Ok(inner) = Self::parse_base(rest) {
                return Ok(ConsistencyPolicy::OpenFill(Box::new(inner)));
            }
        }
        Self::parse_base(tag)
    }

    fn parse_base(tag: &str) -> anyhow::Result<ConsistencyPolicy> {
        Ok(match tag {
            "posix" => ConsistencyPolicy::Posix,
            "session" => ConsistencyPolicy::Session,
            "immutable" => ConsistencyPolicy::Immutable,
            "transactional" => ConsistencyPolicy::Transactional,
            "force" => ConsistencyPolicy::Force,
            "pvfs" => ConsistencyPolicy::Pvfs,
            other => anyhow::bail!("unknown consistency policy '{}'", other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_spec() {
        let f = ConsistencyPolicy::Posix.decode();
        assert!(!f.force_commit && f.desire_hcache_coherence && !f.delay_commit_until_close);

        let f = ConsistencyPolicy::Session.decode();
        assert!(f.force_commit && f.desire_hcache_coherence && f.delay_commit_until_close);

        let f = ConsistencyPolicy::Pvfs.decode();
        assert!(f.force_commit && !f.desire_hcache_coherence && !f.delay_commit_until_close);
    }

    #[test]
    fn open_fill_variant_sets_prefetch() {
        let p = ConsistencyPolicy::parse("oposix").unwrap();
        let f = p.decode();
        assert!(f.prefetch);
        assert!(f.desire_hcache_coherence);
        assert_eq!(p.name(), "oposix");
    }

    #[test]
    fn parse_round_trips_names() {
        for name in ["posix", "session", "immutable", "transactional", "force", "pvfs"] {
            let p = ConsistencyPolicy::parse(name).unwrap();
            assert_eq!(p.name(), name);
        }
    }
}
