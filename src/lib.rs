//! CAPFS: a parallel, content-addressable network file system.
//!
//! A CAPFS volume splits every file into fixed-size chunks, addresses
//! each chunk by its SHA-1 digest, and spreads those chunks across a
//! pool of data servers (the content-addressable store, or CAS). A
//! single metadata manager holds the ordered list of chunk hashes (the
//! "recipe") for every file, arbitrates concurrent writers, and keeps
//! client-side hash caches coherent with an invalidation callback
//! protocol. This crate implements both sides of that system plus the
//! client library tying them together:
//!
//! - [`hash`] / [`filekey`]: content addressing and file identity.
//! - [`cas`] / [`cas_client`]: the data-server store and its client.
//! - [`manager`]: the metadata manager (recipe store, callback
//!   registry, op engine, RPC surface).
//! - [`client`]: the manager RPC stub and the chunked I/O pipeline.
//! - [`hcache`]: the bounded client-side hash cache.
//! - [`policy`]: named consistency policies.
//! - [`wire`] / [`rpc_http`]: the JSON-over-HTTP RPC plumbing shared by
//!   every server and client in the crate.
//! - [`config`] / [`tools`] / [`error`]: configuration loading, small
//!   filesystem helpers, and the crate's error types.

pub mod cas;
pub mod cas_client;
pub mod client;
pub mod config;
pub mod error;
pub mod filekey;
pub mod hash;
pub mod hcache;
pub mod manager;
pub mod policy;
pub mod rpc_http;
pub mod tools;
pub mod wire;

pub use error::CapfsError;
pub use filekey::FileKey;
pub use hash::Hash;
