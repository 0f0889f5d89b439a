//! Client-side manager RPC stub (§6). Thin typed wrapper over
//! [`RpcClient`], and the production implementation of
//! [`crate::hcache::HashFetcher`] that the teacher's own hcache tests
//! stand in for with `StaticFetcher`.

use std::net::SocketAddr;

use anyhow::Error;
use async_trait::async_trait;

use crate::filekey::FileKey;
use crate::hash::Hash;
use crate::hcache::HashFetcher;
use crate::rpc_http::RpcClient;
use crate::wire::*;

#[derive(Clone)]
pub struct ManagerClient {
    rpc: RpcClient,
    addr: SocketAddr,
}

impl ManagerClient {
    pub fn new(addr: SocketAddr) -> Self {
        ManagerClient { rpc: RpcClient::new(), addr }
    }

    pub async fn cbreg(&self, callback_id: u32, callback_addr: SocketAddr) -> Result<(), Error> {
        let req = CbRegRequest { version: Version::CURRENT, callback_id, callback_addr };
        let _: CbRegResponse = self.rpc.post_json(self.addr, "/capfs/v1/cbreg", &req).await?;
        Ok(())
    }

    pub async fn open(
        &self,
        name: &str,
        create: bool,
        policy: &str,
        callback_id: Option<u32>,
    ) -> Result<OpenResponse, Error> {
        let req = OpenRequest {
            version: Version::CURRENT,
            name: name.to_owned(),
            create,
            policy: policy.to_owned(),
            callback_id,
        };
        self.rpc.post_json(self.addr, "/capfs/v1/open", &req).await
    }

    pub async fn close(&self, file: FileKey, atime: i64, mtime: i64, callback_id: Option<u32>) -> Result<(), Error> {
        let req = CloseRequest { version: Version::CURRENT, file, atime, mtime, callback_id };
        let _: CloseResponse = self.rpc.post_json(self.addr, "/capfs/v1/close", &req).await?;
        Ok(())
    }

    pub async fn lookup(&self, name: &str) -> Result<LookupResponse, Error> {
        let req = LookupRequest { version: Version::CURRENT, name: name.to_owned() };
        self.rpc.post_json(self.addr, "/capfs/v1/lookup", &req).await
    }

    pub async fn wcommit(
        &self,
        file: FileKey,
        begin: u64,
        old_hashes: Vec<Hash>,
        new_hashes: Vec<Hash>,
        write_size: u64,
        force_commit: bool,
        callback_id: Option<u32>,
    ) -> Result<WcommitResponse, Error> {
        let req = WcommitRequest {
            version: Version::CURRENT,
            file,
            begin,
            old_hashes,
            new_hashes,
            write_size,
            force_commit,
            callback_id,
        };
        self.rpc.post_json(self.addr, "/capfs/v1/wcommit", &req).await
    }

    pub async fn truncate(&self, file: FileKey, new_size: u64) -> Result<(), Error> {
        let req = TruncateRequest { version: Version::CURRENT, file, new_size };
        let _: TruncateResponse = self.rpc.post_json(self.addr, "/capfs/v1/truncate", &req).await?;
        Ok(())
    }

    pub async fn unlink(&self, name: &str) -> Result<(), Error> {
        let req = UnlinkRequest { version: Version::CURRENT, name: name.to_owned() };
        let _: UnlinkResponse = self.rpc.post_json(self.addr, "/capfs/v1/unlink", &req).await?;
        Ok(())
    }

    pub async fn rename(&self, old_name: &str, new_name: &str) -> Result<(), Error> {
        let req = RenameRequest { version: Version::CURRENT, old_name: old_name.to_owned(), new_name: new_name.to_owned() };
        let _: RenameResponse = self.rpc.post_json(self.addr, "/capfs/v1/rename", &req).await?;
        Ok(())
    }
}

#[async_trait]
impl HashFetcher for ManagerClient {
    async fn gethashes(&self, file: FileKey, begin: u64, count: u64) -> Result<(Vec<Hash>, u64), Error> {
        let req = GetHashesRequest { version: Version::CURRENT, file, begin, count, callback_id: None };
        let resp: GetHashesResponse = self.rpc.post_json(self.addr, "/capfs/v1/gethashes", &req).await?;
        Ok((resp.hashes, resp.current_size))
    }
}
