//! Minimal JSON-over-HTTP RPC plumbing shared by the manager and CAS
//! servers/clients. The teacher's `api2` layer leans on a heavyweight
//! `Router`/`ApiMethod` macro framework built around its own privilege
//! schema; CAPFS's RPC surface is a small, fixed set of named
//! operations (§6) with no ACL model beyond uid/gid (a stated
//! Non-goal), so routing here is a direct `match` on path the way the
//! teacher's `reader.rs` matches `"chunk"`/`"download"`/`"speedtest"`
//! under one `READER_API_ROUTER`, just without the macro layer.

use std::net::SocketAddr;

use anyhow::{Context, Error};
use http::StatusCode;
use hyper::{Body, Client, Request, Response};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CapfsError, ErrorKind};

pub async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, Error> {
    let body = hyper::body::to_bytes(req.into_body())
        .await
        .context("reading request body")?;
    serde_json::from_slice(&body).map_err(|e| {
        anyhow::Error::new(CapfsError::new(
            ErrorKind::Protocol,
            format!("malformed request payload: {}", e),
        ))
    })
}

pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap()
}

/// Map a [`CapfsError`] kind (§7) to an HTTP status, mirroring the
/// propagation policy: transport/protocol/permission/absence/conflict
/// all have a natural HTTP analog; resource and integrity errors map
/// to 5xx.
pub fn error_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
        ErrorKind::Protocol => StatusCode::BAD_REQUEST,
        ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::Absence => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Resource => StatusCode::INSUFFICIENT_STORAGE,
        ErrorKind::Integrity => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

/// Turn any operation error into an HTTP response, downcasting to
/// [`CapfsError`] when the handler raised one and falling back to a
/// generic 500 (Resource-class) otherwise.
pub fn error_response(err: Error) -> Response<Body> {
    match err.downcast::<CapfsError>() {
        Ok(ce) => {
            let status = error_status(ce.kind);
            json_response(status, &ce)
        }
        Err(err) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &CapfsError::resource(err.to_string()),
        ),
    }
}

pub fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("no such RPC"))
        .unwrap()
}

/// A tiny typed JSON-RPC client over `hyper::Client`, used by both the
/// CAS client (component B) and the client-side manager RPC stub.
#[derive(Clone)]
pub struct RpcClient {
    client: Client<hyper::client::HttpConnector>,
}

impl Default for RpcClient {
    fn default() -> Self {
        RpcClient {
            client: Client::new(),
        }
    }
}

impl RpcClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        addr: SocketAddr,
        path: &str,
        req: &Req,
    ) -> Result<Resp, Error> {
        let uri: hyper::Uri = format!("http://{}{}", addr, path).parse()?;
        let body = serde_json::to_vec(req)?;
        let http_req = Request::builder()
            .method("POST")
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))?;

        let resp = self.client.request(http_req).await.map_err(|e| {
            anyhow::Error::new(CapfsError::transport(format!(
                "request to {} failed: {}",
                addr, e
            )))
        })?;

        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body()).await?;

        if status.is_success() {
            Ok(serde_json::from_slice(&bytes)
                .with_context(|| format!("decoding response from {}{}", addr, path))?)
        } else if let Ok(ce) = serde_json::from_slice::<CapfsError>(&bytes) {
            Err(anyhow::Error::new(ce))
        } else {
            Err(anyhow::Error::new(CapfsError::transport(format!(
                "{} returned {}",
                addr, status
            ))))
        }
    }
}
