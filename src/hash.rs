//! Chunk sizing and content hashing.
//!
//! CAPFS addresses chunk content by a SHA-1 digest (`HASHLEN` bytes).
//! The all-zero digest is a sentinel for the privileged zero chunk and
//! is never looked up on disk.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of a chunk, in bytes.
pub const CHUNK: usize = 16 * 1024;

/// Size of a content digest, in bytes.
pub const HASHLEN: usize = 20;

/// Upper bound on hashes carried in a single CAS wire request (§4.B).
pub const MAXHASHES: usize = 1024;

/// Default bound on hcache entry count (§4.C).
pub const HCACHE_COUNT: usize = 131_072;

/// A chunk content digest, or the zero-hash sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(#[serde(with = "hex_bytes")] pub [u8; HASHLEN]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASHLEN]);

    /// Digest of `data`. `data` need not be `CHUNK`-sized (used for the
    /// sub-`CHUNK` tail of a file as well as full chunks).
    pub fn of(data: &[u8]) -> Hash {
        let digest = openssl::sha::sha1(data);
        Hash(digest)
    }

    pub fn is_zero(&self) -> bool {
        *self == Hash::ZERO
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(HASHLEN * 2);
        for b in &self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(s: &str) -> Result<Hash, anyhow::Error> {
        if s.len() != HASHLEN * 2 {
            anyhow::bail!("invalid hash length: {}", s.len());
        }
        let mut out = [0u8; HASHLEN];
        for i in 0..HASHLEN {
            out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)?;
        }
        Ok(Hash(out))
    }

    /// Two-level directory fan-out used by the CAS store (§4.A, §3
    /// SUPPLEMENT): first two hex chars, then next two.
    pub fn fanout_path(&self) -> (String, String, String) {
        let hex = self.to_hex();
        (hex[0..2].to_owned(), hex[2..4].to_owned(), hex)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Number of chunks needed to hold `size` bytes.
pub fn chunk_count(size: u64) -> u64 {
    (size + CHUNK as u64 - 1) / CHUNK as u64
}

/// Build a full, `CHUNK`-sized zero-padded buffer out of `data`, which
/// must be `<= CHUNK` bytes. Used on the write path to complete a
/// partial tail chunk.
pub fn zero_pad_chunk(data: &[u8]) -> Vec<u8> {
    assert!(data.len() <= CHUNK);
    let mut buf = vec![0u8; CHUNK];
    buf[..data.len()].copy_from_slice(data);
    buf
}

/// Hash a full `CHUNK`-sized (or shorter, for the final chunk of a
/// file) buffer, collapsing all-zero content to [`Hash::ZERO`].
pub fn hash_chunk(data: &[u8]) -> Hash {
    if data.iter().all(|&b| b == 0) {
        Hash::ZERO
    } else {
        Hash::of(data)
    }
}

mod hex_bytes {
    use super::HASHLEN;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; HASHLEN], ser: S) -> Result<S::Ok, S::Error> {
        let mut s = String::with_capacity(HASHLEN * 2);
        for b in bytes {
            s.push_str(&format!("{:02x}", b));
        }
        ser.serialize_str(&s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; HASHLEN], D::Error> {
        let s = String::deserialize(de)?;
        if s.len() != HASHLEN * 2 {
            return Err(serde::de::Error::custom("bad hash length"));
        }
        let mut out = [0u8; HASHLEN];
        for i in 0..HASHLEN {
            out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(serde::de::Error::custom)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_is_sentinel() {
        let zero_chunk = vec![0u8; CHUNK];
        assert_eq!(hash_chunk(&zero_chunk), Hash::ZERO);
        assert!(Hash::ZERO.is_zero());
    }

    #[test]
    fn nonzero_content_hashes_to_sha1() {
        let data = vec![0xA5u8; CHUNK];
        let h = hash_chunk(&data);
        assert_ne!(h, Hash::ZERO);
        assert_eq!(h, Hash::of(&data));
    }

    #[test]
    fn hex_roundtrip() {
        let h = Hash::of(b"hello world");
        let hex = h.to_hex();
        assert_eq!(Hash::from_hex(&hex).unwrap(), h);
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK as u64), 1);
        assert_eq!(chunk_count(CHUNK as u64 + 1), 2);
    }

    #[test]
    fn fanout_path_uses_first_four_hex_chars() {
        let h = Hash::of(b"x");
        let (l1, l2, full) = h.fanout_path();
        assert_eq!(l1.len(), 2);
        assert_eq!(l2.len(), 2);
        assert!(full.starts_with(&l1));
        assert!(full[2..].starts_with(&l2));
    }
}
