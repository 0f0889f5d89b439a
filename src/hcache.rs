//! Client-side hash cache (§4.C). A bounded `(FileKey, chunk-index) ->
//! Hash` map with miss-initiated async fetch. Eviction uses the `lru`
//! crate (see `examples/other_examples/…teleport-daemon…cache.rs` for
//! the two-tier cache precedent this is grounded on, simplified to one
//! tier since hcache entries are fixed-size 20-byte hashes, not chunk
//! bodies).

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Error;
use async_trait::async_trait;
use lru::LruCache;

use crate::filekey::FileKey;
use crate::hash::Hash;

/// The manager-side half of the miss-fetch contract (§4.C): fetch the
/// recipe slice `[begin, begin+count)` for `file`, registering the
/// caller's callback ID so later mutations can invalidate the slice.
#[async_trait]
pub trait HashFetcher: Send + Sync {
    async fn gethashes(
        &self,
        file: FileKey,
        begin: u64,
        count: u64,
    ) -> Result<(Vec<Hash>, u64), Error>;
}

pub struct HashCache {
    entries: Mutex<LruCache<(FileKey, u64), Hash>>,
}

impl HashCache {
    pub fn new(capacity: usize) -> Self {
        HashCache {
            entries: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    pub fn put(&self, file: FileKey, start: u64, hashes: &[Hash]) {
        let mut entries = self.entries.lock().unwrap();
        for (i, h) in hashes.iter().enumerate() {
            entries.put((file, start + i as u64), *h);
        }
    }

    pub fn clear(&self, file: FileKey) {
        let mut entries = self.entries.lock().unwrap();
        let keys: Vec<_> = entries
            .iter()
            .filter(|((f, _), _)| *f == file)
            .map(|(k, _)| *k)
            .collect();
        for k in keys {
            entries.pop(&k);
        }
    }

    pub fn clear_range(&self, file: FileKey, start: u64, count: u64) {
        let mut entries = self.entries.lock().unwrap();
        for i in start..start + count {
            entries.pop(&(file, i));
        }
    }

    /// Apply a manager `update` callback: push new hashes in place
    /// rather than invalidating (§4.E single-sharer fast path).
    pub fn update(&self, file: FileKey, begin: u64, hashes: &[Hash]) {
        self.put(file, begin, hashes);
    }

    fn lookup_local(&self, file: FileKey, start: u64, count: u64) -> Option<Vec<Hash>> {
        let mut entries = self.entries.lock().unwrap();
        let mut out = Vec::with_capacity(count as usize);
        for i in start..start + count {
            match entries.get(&(file, i)) {
                Some(h) => out.push(*h),
                None => return None,
            }
        }
        Some(out)
    }

    fn missing_range(&self, file: FileKey, start: u64, count: u64) -> Option<(u64, u64)> {
        let entries = self.entries.lock().unwrap();
        let mut lo = None;
        let mut hi = None;
        for i in start..start + count {
            if !entries.contains(&(file, i)) {
                lo.get_or_insert(i);
                hi = Some(i);
            }
        }
        lo.map(|lo| (lo, hi.unwrap() - lo + 1))
    }

    /// Returns exactly `count` hashes for `[start, start+count)`,
    /// fetching the minimal contiguous range covering any misses from
    /// `fetcher` and retrying locally (§4.C `get`).
    ///
    /// Invariant C1: each returned hash equalled the manager's `R[i]`
    /// at some instant between this call's entry and return; it may
    /// have been invalidated by a concurrent commit by the time the
    /// caller inspects it. Soundness rests on the wcommit CAS, not on
    /// this cache's freshness (§5 O3).
    pub async fn get(
        &self,
        file: FileKey,
        start: u64,
        count: u64,
        fetcher: &dyn HashFetcher,
    ) -> Result<Vec<Hash>, Error> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if let Some(hashes) = self.lookup_local(file, start, count) {
            return Ok(hashes);
        }

        let (miss_begin, miss_count) = self
            .missing_range(file, start, count)
            .expect("lookup_local returned None so at least one entry must be missing");

        let (fetched, _current_size) = fetcher.gethashes(file, miss_begin, miss_count).await?;
        self.put(file, miss_begin, &fetched);

        self.lookup_local(file, start, count)
            .ok_or_else(|| anyhow::anyhow!("hcache miss persisted after fetch for {:?}", file))
    }
}

/// An in-memory fetcher useful for tests and for a single-process
/// manager+client harness; production deployments fetch over the
/// client RPC stub (`client::rpc::ManagerClient` implements this too).
pub struct StaticFetcher {
    pub recipes: Mutex<HashMap<FileKey, Vec<Hash>>>,
}

#[async_trait]
impl HashFetcher for StaticFetcher {
    async fn gethashes(&self, file: FileKey, begin: u64, count: u64) -> Result<(Vec<Hash>, u64), Error> {
        let recipes = self.recipes.lock().unwrap();
        let recipe = recipes
            .get(&file)
            .ok_or_else(|| anyhow::anyhow!("no such file"))?;
        let end = (begin + count).min(recipe.len() as u64);
        let slice = if begin >= recipe.len() as u64 {
            Vec::new()
        } else {
            recipe[begin as usize..end as usize].to_vec()
        };
        Ok((slice, recipe.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fk() -> FileKey {
        FileKey::new(1, 2, 3)
    }

    #[tokio::test]
    async fn miss_triggers_fetch_and_fills() {
        let cache = HashCache::new(16);
        let mut recipes = HashMap::new();
        let want: Vec<Hash> = (0..4).map(|i| Hash::of(&[i])).collect();
        recipes.insert(fk(), want.clone());
        let fetcher = StaticFetcher { recipes: Mutex::new(recipes) };

        let got = cache.get(fk(), 0, 4, &fetcher).await.unwrap();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn cache_hit_avoids_fetch() {
        let cache = HashCache::new(16);
        let h = Hash::of(b"x");
        cache.put(fk(), 0, &[h]);

        struct PanicFetcher;
        #[async_trait]
        impl HashFetcher for PanicFetcher {
            async fn gethashes(&self, _: FileKey, _: u64, _: u64) -> Result<(Vec<Hash>, u64), Error> {
                panic!("should not be called on a cache hit");
            }
        }

        let got = cache.get(fk(), 0, 1, &PanicFetcher).await.unwrap();
        assert_eq!(got, vec![h]);
    }

    #[test]
    fn clear_range_evicts_only_requested_indices() {
        let cache = HashCache::new(16);
        let hashes: Vec<Hash> = (0..4).map(|i| Hash::of(&[i])).collect();
        cache.put(fk(), 0, &hashes);
        cache.clear_range(fk(), 1, 2);
        assert!(cache.lookup_local(fk(), 0, 1).is_some());
        assert!(cache.lookup_local(fk(), 1, 2).is_none());
        assert!(cache.lookup_local(fk(), 3, 1).is_some());
    }

    #[test]
    fn clear_drops_whole_file() {
        let cache = HashCache::new(16);
        cache.put(fk(), 0, &[Hash::of(b"a")]);
        cache.clear(fk());
        assert!(cache.lookup_local(fk(), 0, 1).is_none());
    }
}
