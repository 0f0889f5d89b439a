//! Error taxonomy (§7). Internal plumbing uses [`anyhow::Error`], the
//! way the teacher's `backup/*.rs` modules do; [`CapfsError`] is the
//! typed error surfaced at RPC response boundaries, carrying a POSIX-ish
//! status code the way `proxmox::http_err!` carries an HTTP status.

use serde::{Deserialize, Serialize};

/// The seven error categories of spec §7.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Cannot reach peer, decode failure, timeout.
    Transport,
    /// Version mismatch, unknown opcode, malformed payload.
    Protocol,
    /// uid/gid/mode check failed.
    Permission,
    /// No such file/handle/hash.
    Absence,
    /// wcommit compare-and-swap miss.
    Conflict,
    /// Out of memory, disk full.
    Resource,
    /// PUT received a chunk whose hash does not match the supplied key.
    Integrity,
}

impl ErrorKind {
    /// The POSIX-style code propagated to the collaborator's syscall
    /// boundary (§7 propagation policy).
    pub fn errno_name(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "EREMOTEIO",
            ErrorKind::Protocol => "EINVAL",
            ErrorKind::Permission => "EACCES",
            ErrorKind::Absence => "ENOENT",
            ErrorKind::Conflict => "EAGAIN",
            ErrorKind::Resource => "ENOSPC",
            ErrorKind::Integrity => "EIO",
        }
    }

    /// Whether the core itself retries this class of failure (only
    /// transport errors get one local reconnect-and-retry; everything
    /// else is surfaced to the caller).
    pub fn core_retries(&self) -> bool {
        matches!(self, ErrorKind::Transport)
    }
}

#[derive(Debug, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({})", .kind.errno_name())]
pub struct CapfsError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CapfsError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CapfsError {
            kind,
            message: message.into(),
        }
    }

    pub fn absence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Absence, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, message)
    }
}

/// The wcommit compare-and-swap miss (§4.F, §8 property 4/5):
/// `EAGAIN` accompanied by the manager's current recipe slice so the
/// client can rebase and retry.
#[derive(Debug, Serialize, Deserialize)]
pub struct WcommitConflict {
    pub current_hashes: Vec<crate::hash::Hash>,
}

pub type Result<T> = anyhow::Result<T>;
