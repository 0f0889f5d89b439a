//! Content-addressable storage: the data-server-side store
//! ([`store::ChunkStore`], component A) and its RPC surface
//! ([`server`]).

pub mod server;
pub mod store;

pub use store::{ChunkStatus, ChunkStore, PutOutcome, StatFs};
