//! Data-server RPC surface: `ping`, `statfs`, `put`, `get`,
//! `removeall` (§6). Dispatches onto a bounded worker pool so a large
//! PUT/GET batch doesn't monopolize a tokio executor thread, mirroring
//! the teacher's `tools::runtime::block_in_place` use around chunk
//! I/O in `api2/reader.rs`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use http::StatusCode;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use log::{info, warn};

use crate::cas::store::ChunkStore;
use crate::error::CapfsError;
use crate::rpc_http::{error_response, json_response, not_found, read_json};
use crate::wire::*;

pub struct DataServer {
    pub store: Arc<ChunkStore>,
}

impl DataServer {
    pub fn new(store: Arc<ChunkStore>) -> Self {
        DataServer { store }
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<(), anyhow::Error> {
        let make_svc = make_service_fn(move |_conn| {
            let this = self.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let this = this.clone();
                    async move { Ok::<_, Infallible>(this.dispatch(req).await) }
                }))
            }
        });

        info!("capfs-iod listening on {}", addr);
        Server::bind(&addr).serve(make_svc).await?;
        Ok(())
    }

    async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_owned();
        let result = match path.as_str() {
            "/capfs/cas/v1/ping" => self.handle_ping(req).await,
            "/capfs/cas/v1/statfs" => self.handle_statfs(req).await,
            "/capfs/cas/v1/put" => self.handle_put(req).await,
            "/capfs/cas/v1/get" => self.handle_get(req).await,
            "/capfs/cas/v1/removeall" => self.handle_removeall(req).await,
            _ => return not_found(),
        };
        match result {
            Ok(resp) => resp,
            Err(err) => {
                warn!("cas rpc {} failed: {:#}", path, err);
                error_response(err)
            }
        }
    }

    async fn handle_ping(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: PingRequest = read_json(req).await?;
        check_version(&req.version)?;
        Ok(json_response(StatusCode::OK, &PingResponse { version: Version::CURRENT }))
    }

    async fn handle_statfs(&self, _req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let store = self.store.clone();
        let stat = tokio::task::spawn_blocking(move || store.statfs()).await??;
        Ok(json_response(
            StatusCode::OK,
            &CasStatFsResponse {
                total_bytes: stat.total_bytes,
                free_bytes: stat.free_bytes,
                chunk_count: stat.chunk_count,
            },
        ))
    }

    async fn handle_put(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: PutRequest = read_json(req).await?;
        check_version(&req.version)?;
        let store = self.store.clone();
        let (outcomes, bytes_stored) =
            tokio::task::spawn_blocking(move || store.put_batch(&req.hashes, &req.blocks)).await??;
        let statuses = outcomes.into_iter().map(wire_put_status).collect();
        Ok(json_response(StatusCode::OK, &PutResponse { statuses, bytes_stored }))
    }

    async fn handle_get(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: GetRequest = read_json(req).await?;
        check_version(&req.version)?;
        let store = self.store.clone();
        let (statuses, blocks_flat) =
            tokio::task::spawn_blocking(move || store.get_batch(&req.hashes)).await??;

        let chunk_size = crate::hash::CHUNK;
        let mut blocks = Vec::with_capacity(statuses.len());
        let mut offset = 0;
        for s in &statuses {
            match s {
                crate::cas::store::ChunkStatus::Ok => {
                    blocks.push(blocks_flat[offset..offset + chunk_size].to_vec());
                    offset += chunk_size;
                }
                crate::cas::store::ChunkStatus::NotFound => blocks.push(Vec::new()),
            }
        }

        let statuses = statuses
            .into_iter()
            .map(|s| match s {
                crate::cas::store::ChunkStatus::Ok => WireChunkStatus::Ok,
                crate::cas::store::ChunkStatus::NotFound => WireChunkStatus::NotFound,
            })
            .collect();

        Ok(json_response(StatusCode::OK, &GetResponse { statuses, blocks }))
    }

    async fn handle_removeall(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: RemoveAllRequest = read_json(req).await?;
        check_version(&req.version)?;
        let dir = PathBuf::from(req.dir);
        let store = self.store.clone();
        let report = tokio::task::spawn_blocking(move || store.removeall(&dir)).await??;
        Ok(json_response(
            StatusCode::OK,
            &RemoveAllResponse {
                removed: report.removed,
                skipped_dirs: report.skipped_dirs.iter().map(|p| p.display().to_string()).collect(),
                errors: report.errors,
            },
        ))
    }
}

fn check_version(v: &Version) -> Result<(), anyhow::Error> {
    if !v.compatible_with(&Version::CURRENT) {
        return Err(CapfsError::protocol(format!(
            "incompatible protocol version {}.{} (server is {}.{})",
            v.major, v.minor, Version::CURRENT.major, Version::CURRENT.minor
        ))
        .into());
    }
    Ok(())
}

fn wire_put_status(o: crate::cas::store::PutOutcome) -> WireChunkStatus {
    match o {
        crate::cas::store::PutOutcome::Stored => WireChunkStatus::Stored,
        crate::cas::store::PutOutcome::AlreadyPresent => WireChunkStatus::AlreadyPresent,
        crate::cas::store::PutOutcome::Elided => WireChunkStatus::Elided,
    }
}
