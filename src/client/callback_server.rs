//! Client-side callback listener (§4.E/§6): the manager POSTs
//! `invalidate`/`update` here against the address a client registered
//! via `cbreg`. Mirrors `cas::server`/`manager::server`'s
//! dispatch-by-path pattern, just inverted — the client is the server
//! for this one small RPC surface.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::StatusCode;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use log::info;

use crate::hcache::HashCache;
use crate::rpc_http::{json_response, not_found, read_json};
use crate::wire::{CallbackAck, InvalidateCallback, UpdateCallback};

pub struct CallbackServer {
    hcache: Arc<HashCache>,
}

impl CallbackServer {
    pub fn new(hcache: Arc<HashCache>) -> Self {
        CallbackServer { hcache }
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

        info!("capfs client callback listener on {}", addr);
        Server::bind(&addr).serve(make_svc).await?;
        Ok(())
    }

    async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        match req.uri().path() {
            "/capfs/client/v1/callback/invalidate" => self.handle_invalidate(req).await,
            "/capfs/client/v1/callback/update" => self.handle_update(req).await,
            _ => not_found(),
        }
    }

    async fn handle_invalidate(&self, req: Request<Body>) -> Response<Body> {
        let msg: InvalidateCallback = match read_json(req).await {
            Ok(m) => m,
            Err(_) => return not_found(),
        };
        if msg.begin_chunk < 0 {
            self.hcache.clear(msg.file);
        } else {
            self.hcache.clear_range(msg.file, msg.begin_chunk as u64, msg.nchunks);
        }
        json_response(StatusCode::OK, &CallbackAck { status: 0 })
    }

    async fn handle_update(&self, req: Request<Body>) -> Response<Body> {
        let msg: UpdateCallback = match read_json(req).await {
            Ok(m) => m,
            Err(_) => return not_found(),
        };
        self.hcache.update(msg.file, msg.begin_chunk, &msg.hashes);
        json_response(StatusCode::OK, &CallbackAck { status: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filekey::FileKey;
    use crate::hash::Hash;

    fn fk() -> FileKey {
        FileKey::new(1, 2, 3)
    }

    #[tokio::test]
    async fn invalidate_whole_file_clears_cache() {
        let hcache = Arc::new(HashCache::new(16));
        hcache.put(fk(), 0, &[Hash::of(b"a")]);
        let server = CallbackServer::new(hcache.clone());

        let body = serde_json::to_vec(&InvalidateCallback { file: fk(), begin_chunk: -1, nchunks: 0 }).unwrap();
        let req = Request::builder().body(Body::from(body)).unwrap();
        let resp = server.handle_invalidate(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(hcache.get(fk(), 0, 1, &crate::hcache::StaticFetcher { recipes: std::sync::Mutex::new(Default::default()) }).await.is_err());
    }

    #[tokio::test]
    async fn update_pushes_hashes_into_cache() {
        let hcache = Arc::new(HashCache::new(16));
        let server = CallbackServer::new(hcache.clone());
        let h = Hash::of(b"z");

        let body = serde_json::to_vec(&UpdateCallback { file: fk(), begin_chunk: 0, hashes: vec![h] }).unwrap();
        let req = Request::builder().body(Body::from(body)).unwrap();
        let resp = server.handle_update(req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        struct PanicFetcher;
        #[async_trait::async_trait]
        impl crate::hcache::HashFetcher for PanicFetcher {
            async fn gethashes(&self, _: FileKey, _: u64, _: u64) -> Result<(Vec<Hash>, u64), anyhow::Error> {
                panic!("update should have filled the cache");
            }
        }
        let got = hcache.get(fk(), 0, 1, &PanicFetcher).await.unwrap();
        assert_eq!(got, vec![h]);
    }
}
