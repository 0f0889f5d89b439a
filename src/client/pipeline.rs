//! Chunked client I/O pipeline (§4.G): the component that turns a
//! user-facing byte range into chunk-aligned hash lookups, CAS
//! GET/PUT traffic, and a two-phase `wcommit`. Grounded on the
//! teacher's `pxar`/backup-stream chunking loop (split range into
//! fixed windows, hash each, dedupe against a content-addressed
//! store) adapted to in-place overwrite semantics instead of
//! append-only archive writes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Error};

use crate::cas_client::CasClient;
use crate::filekey::FileKey;
use crate::hash::{chunk_count, hash_chunk, zero_pad_chunk, Hash, CHUNK};
use crate::hcache::HashCache;
use crate::policy::PolicyFlags;

use super::rpc::ManagerClient;

/// Bound on `wcommit` EAGAIN retries before surfacing the conflict to
/// the caller (§4.G write path step 6).
const MAX_COMMIT_RETRIES: u32 = 8;

struct DelayedCommit {
    begin: u64,
    new_hashes: Vec<Hash>,
    write_size: u64,
}

/// An open CAPFS file handle on the client side.
pub struct FileHandle {
    name: String,
    file: FileKey,
    base: usize,
    manager: ManagerClient,
    cas: CasClient,
    hcache: Arc<HashCache>,
    servers: HashMap<usize, SocketAddr>,
    flags: PolicyFlags,
    callback_id: Option<u32>,
    size: AtomicU64,
    delayed: std::sync::Mutex<Vec<DelayedCommit>>,
}

impl FileHandle {
    pub async fn open(
        manager: ManagerClient,
        cas: CasClient,
        hcache: Arc<HashCache>,
        servers: HashMap<usize, SocketAddr>,
        name: &str,
        create: bool,
        policy_tag: &str,
        callback_id: Option<u32>,
    ) -> Result<Self, Error> {
        let opened = manager.open(name, create, policy_tag, callback_id).await?;
        let flags = crate::policy::ConsistencyPolicy::parse(policy_tag)?.decode();
        if let Some(recipe) = &opened.recipe {
            hcache.put(opened.file, 0, recipe);
        }
        Ok(FileHandle {
            name: name.to_owned(),
            file: opened.file,
            base: opened.base,
            manager,
            cas,
            hcache,
            servers,
            flags,
            callback_id,
            size: AtomicU64::new(opened.size),
            delayed: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn file(&self) -> FileKey {
        self.file
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn server_for(&self, chunk_index: u64) -> usize {
        let n = self.servers.len().max(1);
        (self.base + chunk_index as usize) % n
    }

    /// Read path (§4.G): hash lookup, then CAS GETs, synthesizing zero
    /// chunks client-side with no request.
    pub async fn read(&self, off: u64, len: usize) -> Result<Vec<u8>, Error> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let begin = off / CHUNK as u64;
        let end = chunk_count(off + len as u64).max(begin + 1);
        let count = end - begin;

        let hashes = self.hcache.get(self.file, begin, count, &self.manager).await?;
        let chunk_data = self.fetch_chunks(begin, &hashes).await?;

        let start_in_window = (off - begin * CHUNK as u64) as usize;
        let mut out = Vec::with_capacity(len);
        for chunk in &chunk_data {
            out.extend_from_slice(chunk);
        }
        let end_in_window = (start_in_window + len).min(out.len());
        Ok(out[start_in_window..end_in_window].to_vec())
    }

    async fn fetch_chunks(&self, begin: u64, hashes: &[Hash]) -> Result<Vec<Vec<u8>>, Error> {
        let indices: Vec<u64> = (begin..begin + hashes.len() as u64).collect();
        let nonzero: Vec<u64> = indices.iter().copied().filter(|i| hashes[(*i - begin) as usize] != Hash::ZERO).collect();
        let nonzero_hashes: Vec<Hash> = nonzero.iter().map(|i| hashes[(*i - begin) as usize]).collect();

        let mut by_hash: HashMap<Hash, Vec<u8>> = HashMap::new();
        if !nonzero.is_empty() {
            let jobs = self.cas.partition_get(&self.servers, &nonzero, &nonzero_hashes, |i| self.server_for(i));
            // Each job's own hash list is the key to zipping its
            // result blocks back to the right hash: cas.get preserves
            // per-job order but jobs are grouped by server, not by the
            // original chunk-index order.
            let job_hash_lists: Vec<Vec<Hash>> = jobs.iter().map(|j| j.hashes.clone()).collect();
            let results = self.cas.get(jobs).await;
            for (job_hashes, r) in job_hash_lists.into_iter().zip(results.into_iter()) {
                let result = r?;
                for (h, block) in job_hashes.into_iter().zip(result.blocks.into_iter()) {
                    by_hash.insert(h, block);
                }
            }
        }

        let mut out = Vec::with_capacity(hashes.len());
        for h in hashes {
            if h.is_zero() {
                out.push(vec![0u8; CHUNK]);
            } else {
                match by_hash.get(h) {
                    Some(block) => out.push(block.clone()),
                    None => bail!("chunk {:?} missing from data server response", h),
                }
            }
        }
        Ok(out)
    }

    /// Write path (§4.G): pre-read partial chunks, hash full chunks,
    /// PUT non-zero chunks, then `wcommit` with bounded EAGAIN retry.
    pub async fn write(&self, off: u64, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        let begin = off / CHUNK as u64;
        let end = chunk_count(off + data.len() as u64).max(begin + 1);
        let count = end - begin;

        let first_partial = off % CHUNK as u64 != 0;
        let last_partial = (off + data.len() as u64) % CHUNK as u64 != 0;

        let mut old_hashes = self.hcache.get(self.file, begin, count, &self.manager).await?;
        let mut new_hashes = self.compute_new_hashes(begin, count, off, data, &old_hashes, first_partial, last_partial).await?;

        if self.flags.delay_commit_until_close {
            let write_size = off + data.len() as u64;
            self.put_chunks(begin, &new_hashes, off, data, first_partial, last_partial).await?;
            self.hcache.put(self.file, begin, &new_hashes);
            self.size.fetch_max(write_size, Ordering::AcqRel);
            self.delayed.lock().unwrap().push(DelayedCommit { begin, new_hashes, write_size });
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            let write_size = off + data.len() as u64;
            let resp = self
                .manager
                .wcommit(
                    self.file,
                    begin,
                    old_hashes.clone(),
                    new_hashes.clone(),
                    write_size,
                    self.flags.force_commit,
                    self.callback_id,
                )
                .await?;

            match resp.status {
                crate::wire::WcommitStatus::Ok => {
                    self.put_chunks(begin, &new_hashes, off, data, first_partial, last_partial).await?;
                    self.hcache.put(self.file, begin, &new_hashes);
                    self.size.fetch_max(write_size, Ordering::AcqRel);
                    return Ok(());
                }
                crate::wire::WcommitStatus::Conflict => {
                    attempt += 1;
                    if attempt >= MAX_COMMIT_RETRIES {
                        bail!("wcommit conflict not resolved after {} attempts", attempt);
                    }
                    old_hashes = resp.current_hashes;
                    new_hashes = self
                        .compute_new_hashes(begin, count, off, data, &old_hashes, first_partial, last_partial)
                        .await?;
                }
            }
        }
    }

    /// Builds `new_hashes` for `[begin, begin+count)`: fully-overwritten
    /// chunks hash straight from `data`; partial chunks are pre-read
    /// and merged first.
    async fn compute_new_hashes(
        &self,
        begin: u64,
        count: u64,
        off: u64,
        data: &[u8],
        old_hashes: &[Hash],
        first_partial: bool,
        last_partial: bool,
    ) -> Result<Vec<Hash>, Error> {
        let mut chunks: Vec<Vec<u8>> = Vec::with_capacity(count as usize);
        for i in 0..count {
            let chunk_index = begin + i;
            let chunk_start = chunk_index * CHUNK as u64;
            let is_first = i == 0;
            let is_last = i == count - 1;
            let needs_preread = (is_first && first_partial) || (is_last && last_partial && count > 0);

            let mut buf = if needs_preread {
                let pre_hash = old_hashes[i as usize];
                if pre_hash.is_zero() {
                    vec![0u8; CHUNK]
                } else {
                    self.fetch_chunks(chunk_index, &[pre_hash]).await?.remove(0)
                }
            } else {
                vec![0u8; CHUNK]
            };

            let overlap_start = chunk_start.max(off);
            let overlap_end = (chunk_start + CHUNK as u64).min(off + data.len() as u64);
            if overlap_start < overlap_end {
                let buf_off = (overlap_start - chunk_start) as usize;
                let data_off = (overlap_start - off) as usize;
                let len = (overlap_end - overlap_start) as usize;
                buf[buf_off..buf_off + len].copy_from_slice(&data[data_off..data_off + len]);
            }
            chunks.push(buf);
        }
        Ok(chunks.iter().map(|c| hash_chunk(c)).collect())
    }

    async fn put_chunks(
        &self,
        begin: u64,
        new_hashes: &[Hash],
        off: u64,
        data: &[u8],
        first_partial: bool,
        last_partial: bool,
    ) -> Result<(), Error> {
        let mut indices = Vec::new();
        let mut hashes = Vec::new();
        let mut blocks = Vec::new();

        for (i, h) in new_hashes.iter().enumerate() {
            if h.is_zero() {
                continue;
            }
            let chunk_index = begin + i as u64;
            let chunk_start = chunk_index * CHUNK as u64;
            let is_first = i == 0;
            let is_last = i == new_hashes.len() - 1;
            let needs_full_rebuild = (is_first && first_partial) || (is_last && last_partial);

            let block = if needs_full_rebuild {
                // Recompute the merged buffer once more for the PUT
                // body; recomputing avoids threading the buffer through
                // the hashing pass above.
                let overlap_start = chunk_start.max(off);
                let overlap_end = (chunk_start + CHUNK as u64).min(off + data.len() as u64);
                let mut buf = vec![0u8; CHUNK];
                if overlap_start < overlap_end {
                    let buf_off = (overlap_start - chunk_start) as usize;
                    let data_off = (overlap_start - off) as usize;
                    let len = (overlap_end - overlap_start) as usize;
                    buf[buf_off..buf_off + len].copy_from_slice(&data[data_off..data_off + len]);
                }
                buf
            } else {
                let chunk_start_in_data = chunk_start.saturating_sub(off) as usize;
                let slice_end = (chunk_start_in_data + CHUNK).min(data.len());
                zero_pad_chunk(&data[chunk_start_in_data..slice_end])
            };

            indices.push(chunk_index);
            hashes.push(*h);
            blocks.push(block);
        }

        if hashes.is_empty() {
            return Ok(());
        }
        let jobs = self.cas.partition_put(&self.servers, &indices, &hashes, &blocks, |i| self.server_for(i));
        for result in self.cas.put(jobs).await {
            result?;
        }
        Ok(())
    }

    /// **Truncate**: manager hash-file truncate, then invalidate the
    /// local hcache range (§4.G).
    pub async fn truncate(&self, new_size: u64) -> Result<(), Error> {
        let old_n = chunk_count(self.size());
        let new_n = chunk_count(new_size);
        self.manager.truncate(self.file, new_size).await?;
        if new_n < old_n {
            self.hcache.clear_range(self.file, new_n, old_n - new_n);
        }
        self.size.store(new_size, Ordering::Release);
        Ok(())
    }

    /// Flush any delay-committed writes, then close (§4.H
    /// `delay_commit_until_close`).
    pub async fn close(&self, atime: i64, mtime: i64) -> Result<(), Error> {
        let pending: Vec<DelayedCommit> = self.delayed.lock().unwrap().drain(..).collect();
        for commit in pending {
            self.manager
                .wcommit(self.file, commit.begin, Vec::new(), commit.new_hashes, commit.write_size, true, self.callback_id)
                .await?;
        }
        self.manager.close(self.file, atime, mtime, self.callback_id).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
