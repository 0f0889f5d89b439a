//! Wire types shared between client, manager and data-server RPC
//! stubs (§6). JSON bodies over HTTP/1.1, one endpoint per RPC name,
//! the way the teacher lays out one `api2` module per REST endpoint.
//! Every request carries a protocol version; mismatches are rejected
//! with `EINVAL` (Protocol-class, §7) before any other field is read.

use serde::{Deserialize, Serialize};

use crate::filekey::FileKey;
use crate::hash::Hash;

/// Manager-global protocol version (§6: "Each carries a manager-global
/// major/minor version; mismatched versions are rejected").
pub const PROTOCOL_MAJOR: u32 = 1;
pub const PROTOCOL_MINOR: u32 = 0;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const CURRENT: Version = Version {
        major: PROTOCOL_MAJOR,
        minor: PROTOCOL_MINOR,
    };

    /// A client and manager are compatible if majors match and the
    /// client's minor does not exceed the server's (server may be
    /// newer and backward compatible within a major).
    pub fn compatible_with(&self, server: &Version) -> bool {
        self.major == server.major && self.minor <= server.minor
    }
}

// ---- Data-server (CAS) RPCs: ping, statfs, put, get, removeall ----

#[derive(Serialize, Deserialize)]
pub struct PingRequest {
    pub version: Version,
}

#[derive(Serialize, Deserialize)]
pub struct PingResponse {
    pub version: Version,
}

#[derive(Serialize, Deserialize)]
pub struct CasStatFsResponse {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub chunk_count: u64,
}

#[derive(Serialize, Deserialize)]
pub struct PutRequest {
    pub version: Version,
    pub hashes: Vec<Hash>,
    /// base64 is avoided on the wire: chunk bytes travel as a JSON
    /// array of per-chunk byte vectors for the teacher-idiom JSON
    /// transport; a production wire would frame these as raw bytes,
    /// but the semantics (§4.A PUT) are unaffected.
    pub blocks: Vec<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum WireChunkStatus {
    Ok,
    NotFound,
    Stored,
    AlreadyPresent,
    Elided,
}

#[derive(Serialize, Deserialize)]
pub struct PutResponse {
    pub statuses: Vec<WireChunkStatus>,
    pub bytes_stored: u64,
}

#[derive(Serialize, Deserialize)]
pub struct GetRequest {
    pub version: Version,
    pub hashes: Vec<Hash>,
}

#[derive(Serialize, Deserialize)]
pub struct GetResponse {
    pub statuses: Vec<WireChunkStatus>,
    pub blocks: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
pub struct RemoveAllRequest {
    pub version: Version,
    pub dir: String,
}

#[derive(Serialize, Deserialize)]
pub struct RemoveAllResponse {
    pub removed: u64,
    pub skipped_dirs: Vec<String>,
    pub errors: Vec<String>,
}

// ---- Manager RPCs ----

#[derive(Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    pub version: Version,
    pub name: String,
    pub create: bool,
    pub policy: String,
    pub callback_id: Option<u32>,
}

#[derive(Serialize, Deserialize)]
pub struct OpenResponse {
    pub file: FileKey,
    pub size: u64,
    pub base: usize,
    /// Bounded opening recipe slice, present if the policy requested
    /// prefetch (§4.F `open`).
    pub recipe: Option<Vec<Hash>>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CloseRequest {
    pub version: Version,
    pub file: FileKey,
    pub atime: i64,
    pub mtime: i64,
    pub callback_id: Option<u32>,
}

#[derive(Serialize, Deserialize)]
pub struct CloseResponse {}

#[derive(Clone, Serialize, Deserialize)]
pub struct GetHashesRequest {
    pub version: Version,
    pub file: FileKey,
    pub begin: u64,
    pub count: u64,
    pub callback_id: Option<u32>,
}

#[derive(Serialize, Deserialize)]
pub struct GetHashesResponse {
    pub hashes: Vec<Hash>,
    pub current_size: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WcommitRequest {
    pub version: Version,
    pub file: FileKey,
    pub begin: u64,
    pub old_hashes: Vec<Hash>,
    pub new_hashes: Vec<Hash>,
    pub write_size: u64,
    pub force_commit: bool,
    /// The committer's own callback id, masked off the dispatch bitmap
    /// so it never invalidates its own hcache (§4.E "except=owner").
    pub callback_id: Option<u32>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum WcommitStatus {
    Ok,
    Conflict,
}

#[derive(Serialize, Deserialize)]
pub struct WcommitResponse {
    pub status: WcommitStatus,
    pub current_hashes: Vec<Hash>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TruncateRequest {
    pub version: Version,
    pub file: FileKey,
    pub new_size: u64,
}

#[derive(Serialize, Deserialize)]
pub struct TruncateResponse {}

#[derive(Clone, Serialize, Deserialize)]
pub struct UnlinkRequest {
    pub version: Version,
    pub name: String,
}

#[derive(Serialize, Deserialize)]
pub struct UnlinkResponse {}

#[derive(Clone, Serialize, Deserialize)]
pub struct RenameRequest {
    pub version: Version,
    pub old_name: String,
    pub new_name: String,
}

#[derive(Serialize, Deserialize)]
pub struct RenameResponse {}

#[derive(Clone, Serialize, Deserialize)]
pub struct LookupRequest {
    pub version: Version,
    pub name: String,
}

#[derive(Serialize, Deserialize)]
pub struct LookupResponse {
    pub file: FileKey,
    pub size: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CbRegRequest {
    pub version: Version,
    pub callback_id: u32,
    /// Where the manager should POST `invalidate`/`update` callbacks
    /// for this client.
    pub callback_addr: std::net::SocketAddr,
}

#[derive(Serialize, Deserialize)]
pub struct CbRegResponse {}

// ---- Manager -> client callbacks (§6) ----

#[derive(Clone, Serialize, Deserialize)]
pub struct InvalidateCallback {
    pub file: FileKey,
    /// `begin_chunk = -1, nchunks = 0` means whole file.
    pub begin_chunk: i64,
    pub nchunks: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UpdateCallback {
    pub file: FileKey,
    pub begin_chunk: u64,
    pub hashes: Vec<Hash>,
}

#[derive(Serialize, Deserialize)]
pub struct CallbackAck {
    pub status: i32,
}
