//! Manager RPC surface (§6): `open`, `close`, `lookup`, `unlink`,
//! `rename`, `truncate`, `gethashes`, `wcommit`, `cbreg`, mirroring
//! `cas::server`'s dispatch-by-path pattern over the same
//! JSON-over-HTTP plumbing.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::StatusCode;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use log::{info, warn};

use crate::error::CapfsError;
use crate::manager::op_engine::{OpEngine, WcommitOutcome};
use crate::rpc_http::{error_response, json_response, not_found, read_json};
use crate::wire::*;

pub struct ManagerServer {
    pub engine: Arc<OpEngine>,
}

impl ManagerServer {
    pub fn new(engine: Arc<OpEngine>) -> Self {
        ManagerServer { engine }
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

        info!("capfs-manager listening on {}", addr);
        Server::bind(&addr).serve(make_svc).await?;
        Ok(())
    }

    async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_owned();
        let result = match path.as_str() {
            "/capfs/v1/open" => self.handle_open(req).await,
            "/capfs/v1/close" => self.handle_close(req).await,
            "/capfs/v1/lookup" => self.handle_lookup(req).await,
            "/capfs/v1/gethashes" => self.handle_gethashes(req).await,
            "/capfs/v1/wcommit" => self.handle_wcommit(req).await,
            "/capfs/v1/truncate" => self.handle_truncate(req).await,
            "/capfs/v1/unlink" => self.handle_unlink(req).await,
            "/capfs/v1/rename" => self.handle_rename(req).await,
            "/capfs/v1/cbreg" => self.handle_cbreg(req).await,
            _ => return not_found(),
        };
        match result {
            Ok(resp) => resp,
            Err(err) => {
                warn!("manager rpc {} failed: {:#}", path, err);
                error_response(err)
            }
        }
    }

    async fn handle_open(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: OpenRequest = read_json(req).await?;
        check_version(&req.version)?;
        let engine = self.engine.clone();
        let opened = tokio::task::spawn_blocking(move || {
            engine.open(&req.name, req.create, &req.policy, req.callback_id)
        })
        .await??;
        Ok(json_response(
            StatusCode::OK,
            &OpenResponse {
                file: opened.file,
                size: opened.size,
                base: opened.base,
                recipe: opened.recipe,
            },
        ))
    }

    async fn handle_close(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: CloseRequest = read_json(req).await?;
        check_version(&req.version)?;
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.close(req.file, req.atime, req.mtime, req.callback_id))
            .await??;
        Ok(json_response(StatusCode::OK, &CloseResponse {}))
    }

    async fn handle_lookup(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: LookupRequest = read_json(req).await?;
        check_version(&req.version)?;
        let engine = self.engine.clone();
        let looked = tokio::task::spawn_blocking(move || engine.lookup(&req.name)).await??;
        Ok(json_response(StatusCode::OK, &LookupResponse { file: looked.file, size: looked.size }))
    }

    async fn handle_gethashes(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: GetHashesRequest = read_json(req).await?;
        check_version(&req.version)?;
        let engine = self.engine.clone();
        let (hashes, current_size) = tokio::task::spawn_blocking(move || {
            engine.gethashes(req.file, req.begin, req.count, req.callback_id)
        })
        .await??;
        Ok(json_response(StatusCode::OK, &GetHashesResponse { hashes, current_size }))
    }

    async fn handle_wcommit(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: WcommitRequest = read_json(req).await?;
        check_version(&req.version)?;
        let outcome = self
            .engine
            .wcommit(
                req.file,
                req.begin,
                &req.old_hashes,
                &req.new_hashes,
                req.write_size,
                req.force_commit,
                req.callback_id,
            )
            .await?;
        let (status, current_hashes) = match outcome {
            WcommitOutcome::Ok { current_hashes } => (WcommitStatus::Ok, current_hashes),
            WcommitOutcome::Conflict { current_hashes } => (WcommitStatus::Conflict, current_hashes),
        };
        Ok(json_response(StatusCode::OK, &WcommitResponse { status, current_hashes }))
    }

    async fn handle_truncate(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: TruncateRequest = read_json(req).await?;
        check_version(&req.version)?;
        self.engine.truncate(req.file, req.new_size).await?;
        Ok(json_response(StatusCode::OK, &TruncateResponse {}))
    }

    async fn handle_unlink(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: UnlinkRequest = read_json(req).await?;
        check_version(&req.version)?;
        self.engine.unlink(&req.name).await?;
        Ok(json_response(StatusCode::OK, &UnlinkResponse {}))
    }

    async fn handle_rename(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: RenameRequest = read_json(req).await?;
        check_version(&req.version)?;
        self.engine.rename(&req.old_name, &req.new_name).await?;
        Ok(json_response(StatusCode::OK, &RenameResponse {}))
    }

    async fn handle_cbreg(&self, req: Request<Body>) -> Result<Response<Body>, anyhow::Error> {
        let req: CbRegRequest = read_json(req).await?;
        check_version(&req.version)?;
        self.engine.callbacks().register_peer(req.callback_id, req.callback_addr);
        Ok(json_response(StatusCode::OK, &CbRegResponse {}))
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
