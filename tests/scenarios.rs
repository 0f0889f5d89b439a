//! End-to-end coordination scenarios (spec §8 S1-S6), driven through
//! a real manager + data-server pair over localhost HTTP, the way a
//! production client would see them, rather than calling `OpEngine`
//! directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use capfs::cas::server::DataServer;
use capfs::cas::ChunkStore;
use capfs::cas_client::CasClient;
use capfs::client::rpc::ManagerClient;
use capfs::client::FileHandle;
use capfs::config::{CapfsConfig, DataServerEntry, IodTab};
use capfs::hash::CHUNK;
use capfs::hcache::{HashCache, HashFetcher};
use capfs::manager::server::ManagerServer;
use capfs::manager::OpEngine;
use capfs::wire::WcommitStatus;

async fn spawn_manager(addr: SocketAddr, manager_id: u32, iodtab: IodTab) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(OpEngine::new(dir.path(), manager_id, CapfsConfig::default(), iodtab));
    let server = Arc::new(ManagerServer::new(engine));
    tokio::spawn(async move { server.serve(addr).await.unwrap() });
    wait_until_listening(addr).await;
    dir
}

async fn spawn_iod(addr: SocketAddr, name: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let store = ChunkStore::create(name, dir.path()).unwrap();
    let server = Arc::new(DataServer::new(Arc::new(store)));
    tokio::spawn(async move { server.serve(addr).await.unwrap() });
    wait_until_listening(addr).await;
    dir
}

async fn wait_until_listening(addr: SocketAddr) {
    for _ in 0..200 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("nothing listening on {} after timeout", addr);
}

struct Harness {
    _manager_dir: tempfile::TempDir,
    _iod_dir: tempfile::TempDir,
    manager: ManagerClient,
    cas: CasClient,
    servers: HashMap<usize, SocketAddr>,
    hcache: Arc<HashCache>,
}

async fn harness(manager_port: u16, iod_port: u16) -> Harness {
    let manager_addr: SocketAddr = format!("127.0.0.1:{}", manager_port).parse().unwrap();
    let iod_addr: SocketAddr = format!("127.0.0.1:{}", iod_port).parse().unwrap();

    let iodtab = IodTab { servers: vec![DataServerEntry { index: 0, addr: iod_addr }] };
    let manager_dir = spawn_manager(manager_addr, 1, iodtab.clone()).await;
    let iod_dir = spawn_iod(iod_addr, "iod0").await;

    let mut servers = HashMap::new();
    servers.insert(0usize, iod_addr);

    Harness {
        _manager_dir: manager_dir,
        _iod_dir: iod_dir,
        manager: ManagerClient::new(manager_addr),
        cas: CasClient::new(),
        servers,
        hcache: Arc::new(HashCache::new(4096)),
    }
}

#[tokio::test]
async fn s1_basic_round_trip() {
    let h = harness(27101, 27102).await;
    let file = FileHandle::open(
        h.manager.clone(),
        h.cas.clone(),
        h.hcache.clone(),
        h.servers.clone(),
        "s1.bin",
        true,
        "posix",
        None,
    )
    .await
    .unwrap();

    let data = vec![0xA5u8; 32 * 1024];
    file.write(0, &data).await.unwrap();
    file.close(0, 0).await.unwrap();

    let reopened = FileHandle::open(
        h.manager.clone(),
        h.cas.clone(),
        h.hcache.clone(),
        h.servers.clone(),
        "s1.bin",
        false,
        "posix",
        None,
    )
    .await
    .unwrap();
    let got = reopened.read(0, 32 * 1024).await.unwrap();
    assert_eq!(got, data);
    assert_eq!(reopened.size(), 32 * 1024);
}

#[tokio::test]
async fn s2_partial_chunk_write_merges_existing_chunk() {
    let h = harness(27103, 27104).await;
    let file = FileHandle::open(
        h.manager.clone(),
        h.cas.clone(),
        h.hcache.clone(),
        h.servers.clone(),
        "s2.bin",
        true,
        "posix",
        None,
    )
    .await
    .unwrap();

    file.write(0, &vec![0x5Au8; CHUNK]).await.unwrap();
    file.write(4000, &[0xFFu8; 100]).await.unwrap();

    let got = file.read(0, CHUNK).await.unwrap();
    assert!(got[..4000].iter().all(|b| *b == 0x5A));
    assert!(got[4000..4100].iter().all(|b| *b == 0xFF));
    assert!(got[4100..].iter().all(|b| *b == 0x5A));
}

#[tokio::test]
async fn s3_sparse_write_elides_leading_zero_chunks() {
    let h = harness(27105, 27106).await;
    let file = FileHandle::open(
        h.manager.clone(),
        h.cas.clone(),
        h.hcache.clone(),
        h.servers.clone(),
        "s3.bin",
        true,
        "posix",
        None,
    )
    .await
    .unwrap();

    let offset = 1_000_000u64;
    file.write(offset, &[1, 2, 3, 4]).await.unwrap();
    assert_eq!(file.size(), offset + 4);

    let head = file.read(0, CHUNK).await.unwrap();
    assert!(head.iter().all(|b| *b == 0));

    let tail = file.read(offset, 4).await.unwrap();
    assert_eq!(tail, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn s5_session_policy_delays_commit_until_close() {
    let h = harness(27107, 27108).await;
    let a = FileHandle::open(
        h.manager.clone(),
        h.cas.clone(),
        h.hcache.clone(),
        h.servers.clone(),
        "s5.bin",
        true,
        "session",
        Some(1),
    )
    .await
    .unwrap();

    a.write(0, &vec![0x11u8; CHUNK]).await.unwrap();

    // Before close, the manager has not seen the commit yet: a fresh
    // lookup from a second handle still reports size 0.
    let b_hcache = Arc::new(HashCache::new(4096));
    let b = FileHandle::open(
        h.manager.clone(),
        h.cas.clone(),
        b_hcache,
        h.servers.clone(),
        "s5.bin",
        false,
        "posix",
        Some(2),
    )
    .await
    .unwrap();
    assert_eq!(b.size(), 0);

    a.close(0, 0).await.unwrap();

    let b2 = FileHandle::open(
        h.manager.clone(),
        h.cas.clone(),
        Arc::new(HashCache::new(4096)),
        h.servers.clone(),
        "s5.bin",
        false,
        "posix",
        None,
    )
    .await
    .unwrap();
    assert_eq!(b2.size(), CHUNK as u64);
}

#[tokio::test]
async fn s6_truncate_shrinks_recipe_and_gethashes_reflects_it() {
    let h = harness(27109, 27110).await;
    let file = FileHandle::open(
        h.manager.clone(),
        h.cas.clone(),
        h.hcache.clone(),
        h.servers.clone(),
        "s6.bin",
        true,
        "posix",
        None,
    )
    .await
    .unwrap();

    file.write(0, &vec![0x7u8; 3 * CHUNK]).await.unwrap();
    file.truncate(CHUNK as u64).await.unwrap();
    assert_eq!(file.size(), CHUNK as u64);

    let (hashes, size) = h.manager.gethashes(file.file(), 0, 3).await.unwrap();
    assert_eq!(size, CHUNK as u64);
    assert!(!hashes[0].is_zero());
    assert!(hashes[1].is_zero());
    assert!(hashes[2].is_zero());
}

#[tokio::test]
async fn s4_concurrent_writers_one_wins_the_other_rebases() {
    let h = harness(27111, 27112).await;
    let opened = h.manager.open("s4.bin", true, "posix", None).await.unwrap();

    let winner_hashes = vec![capfs::hash::Hash::of(b"winner")];
    let first = h
        .manager
        .wcommit(opened.file, 0, vec![], winner_hashes.clone(), CHUNK as u64, false, None)
        .await
        .unwrap();
    assert_eq!(first.status, WcommitStatus::Ok);

    // The loser raced with a stale (empty) `old_hashes`: it must be
    // told to rebase, not silently overwrite the winner.
    let loser_hashes = vec![capfs::hash::Hash::of(b"loser")];
    let second = h
        .manager
        .wcommit(opened.file, 0, vec![], loser_hashes.clone(), CHUNK as u64, false, None)
        .await
        .unwrap();
    assert_eq!(second.status, WcommitStatus::Conflict);
    assert_eq!(second.current_hashes, winner_hashes);

    // Retry rebased on the winner's current hashes succeeds.
    let retried = h
        .manager
        .wcommit(opened.file, 0, second.current_hashes, loser_hashes.clone(), CHUNK as u64, false, None)
        .await
        .unwrap();
    assert_eq!(retried.status, WcommitStatus::Ok);
    assert_eq!(retried.current_hashes, loser_hashes);
}
