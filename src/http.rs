//! HTTP front end: `POST /convert`, `GET /health` and a service banner.
//!
//! Connections are accepted on a blocking `tiny_http` loop; each request is
//! handed to the tokio runtime so requests waiting on the pool hold no thread.

use crate::api::{ConvertRequest, ConvertResponse};
use crate::{Backend, Error, Result, Service};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use tiny_http::{Header, Method, Request, Response, Server};
use tokio::runtime::Handle;

/// Request bodies above this size are rejected with 413
pub const MAX_BODY_BYTES: u64 = 32 * 1024 * 1024;

/// A routed response: status code plus JSON body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        let body = serde_json::to_string(value)
            .unwrap_or_else(|e| format!(r#"{{"success":false,"error":"serialization failed: {}"}}"#, e));
        Self { status, body }
    }

    fn too_large(limit: u64) -> Self {
        Self::json(
            413,
            &ConvertResponse::failure(format!("request body exceeds the {} byte limit", limit)),
        )
    }
}

enum Body {
    Complete(Vec<u8>),
    TooLarge,
}

/// Route one request. Kept free of any socket handling so it can be tested
/// directly.
pub async fn route<B: Backend>(service: &Service<B>, method: &Method, url: &str, body: &[u8]) -> Reply {
    let path = url.split('?').next().unwrap_or("");
    match path {
        "/convert" => convert(service, method, body).await,
        "/health" => Reply::json(200, &json!({ "healthy": true })),
        _ => Reply::json(
            200,
            &json!({
                "service": "html2image",
                "version": env!("CARGO_PKG_VERSION"),
                "endpoints": "POST /convert - render HTML to an image",
            }),
        ),
    }
}

async fn convert<B: Backend>(service: &Service<B>, method: &Method, body: &[u8]) -> Reply {
    if *method != Method::Post {
        return Reply::json(405, &ConvertResponse::failure("only POST requests are supported"));
    }

    let request: ConvertRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return Reply::json(
                400,
                &ConvertResponse::failure(format!("invalid request body: {}", e)),
            )
        }
    };

    match service.convert(request).await {
        Ok(image) => {
            info!("Converted HTML to an image of {} bytes", image.len());
            Reply::json(200, &ConvertResponse::image(&image))
        }
        Err(e) if e.is_client_error() => Reply::json(400, &ConvertResponse::failure(e.to_string())),
        Err(e) => {
            warn!("Conversion failed: {}", e);
            Reply::json(500, &ConvertResponse::failure(format!("conversion failed: {}", e)))
        }
    }
}

/// Stops a running [`HttpServer`] from another thread or task
#[derive(Clone)]
pub struct StopHandle {
    server: Arc<Server>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.server.unblock();
    }
}

/// Listening HTTP server
pub struct HttpServer {
    server: Arc<Server>,
    addr: SocketAddr,
    body_limit: u64,
}

impl HttpServer {
    /// Bind `addr` (for example `0.0.0.0:8080`; port 0 picks a free port).
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = std::net::TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        let server = Server::from_listener(listener, None)
            .map_err(|e| Error::ServerError(format!("failed to listen on {}: {}", addr, e)))?;
        Ok(Self {
            server: Arc::new(server),
            addr,
            body_limit: MAX_BODY_BYTES,
        })
    }

    /// Replace the [`MAX_BODY_BYTES`] request body limit.
    pub fn with_body_limit(mut self, limit: u64) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            server: Arc::clone(&self.server),
        }
    }

    /// Accept requests until [`StopHandle::stop`] is called. Blocks the
    /// calling thread; handlers run on `runtime`.
    pub fn run<B: Backend>(&self, service: Service<B>, runtime: Handle) {
        info!("HTML2Image service listening on {}", self.addr);
        for request in self.server.incoming_requests() {
            let service = service.clone();
            let limit = self.body_limit;
            runtime.spawn(async move {
                let read = tokio::task::spawn_blocking(move || read_body(request, limit)).await;
                let (request, body) = match read {
                    Ok(Ok(read)) => read,
                    Ok(Err(e)) => {
                        warn!("Failed to read request body: {}", e);
                        return;
                    }
                    Err(e) => {
                        warn!("Request reader aborted: {}", e);
                        return;
                    }
                };

                let method = request.method().clone();
                let url = request.url().to_string();
                let reply = match body {
                    Body::Complete(body) => route(&service, &method, &url, &body).await,
                    Body::TooLarge => {
                        warn!("Rejected {} {}: body over {} bytes", method, url, limit);
                        Reply::too_large(limit)
                    }
                };
                debug!("{} {} -> {}", method, url, reply.status);

                let _ = tokio::task::spawn_blocking(move || respond(request, reply)).await;
            });
        }
        info!("HTTP server on {} stopped accepting requests", self.addr);
    }
}

fn read_body(mut request: Request, limit: u64) -> std::io::Result<(Request, Body)> {
    if request.body_length().map_or(false, |len| len as u64 > limit) {
        return Ok((request, Body::TooLarge));
    }
    // Chunked bodies carry no length up front.
    let body = match read_limited(request.as_reader(), limit)? {
        Some(body) => Body::Complete(body),
        None => Body::TooLarge,
    };
    Ok((request, body))
}

/// Read at most `limit` bytes; `None` when the reader holds more.
fn read_limited<R: Read>(reader: R, limit: u64) -> std::io::Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut body)?;
    if body.len() as u64 > limit {
        return Ok(None);
    }
    Ok(Some(body))
}

fn respond(request: Request, reply: Reply) {
    let mut response = Response::from_string(reply.body).with_status_code(reply.status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response = response.with_header(header);
    }
    if let Err(e) = request.respond(response) {
        debug!("Failed to send response: {}", e);
    }
}
