//! Ephemeral HTTP server that serves a single HTML document.
//!
//! Used by local-serve rendering for content that `data:` URIs mishandle
//! (relative and same-origin loads). The server binds an OS-assigned
//! loopback port, answers `GET /` with the document and stops listening when
//! dropped.

use crate::{Error, Result};
use log::debug;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tiny_http::{Header, Response, Server};

/// A running single-document server; see the module docs.
pub struct ContentServer {
    server: Arc<Server>,
    port: u16,
    served: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

fn header(raw: &str) -> Result<Header> {
    raw.parse::<Header>()
        .map_err(|_| Error::ServerError(format!("invalid header '{}'", raw)))
}

impl ContentServer {
    /// Bind a free loopback port and start serving `html` from a background thread.
    pub fn start(html: String) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let server = Server::from_listener(listener, None)
            .map_err(|e| Error::ServerError(format!("failed to start content server: {}", e)))?;
        let server = Arc::new(server);

        let content_type = header("Content-Type: text/html; charset=utf-8")?;
        let allow_origin = header("Access-Control-Allow-Origin: *")?;
        let served = Arc::new(AtomicUsize::new(0));

        let worker = {
            let server = Arc::clone(&server);
            let served = Arc::clone(&served);
            thread::Builder::new()
                .name(format!("content-server-{}", port))
                .spawn(move || {
                    for request in server.incoming_requests() {
                        let path = request.url().split('?').next().unwrap_or("");
                        let response = if path == "/" || path.is_empty() {
                            served.fetch_add(1, Ordering::SeqCst);
                            Response::from_string(html.clone())
                                .with_header(content_type.clone())
                                .with_header(allow_origin.clone())
                        } else {
                            Response::from_string("Not Found")
                                .with_status_code(404)
                                .with_header(allow_origin.clone())
                        };
                        if let Err(e) = request.respond(response) {
                            debug!("content server on port {} failed to respond: {}", port, e);
                        }
                    }
                })?
        };

        debug!("content server listening on 127.0.0.1:{}", port);
        Ok(Self {
            server,
            port,
            served,
            worker: Some(worker),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    /// Number of times the document has been served
    pub fn requests_served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for ContentServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        debug!(
            "content server on port {} stopped after {} request(s)",
            self.port,
            self.requests_served()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::fetch_page;
    use std::net::TcpStream;
    use std::time::Duration;

    #[test]
    fn serves_html_with_cors_header() {
        let html = "<html><body>Served</body></html>";
        let server = ContentServer::start(html.to_string()).unwrap();
        assert!(server.url().starts_with("http://127.0.0.1:"));

        let page = fetch_page(&server.url()).unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(page.allow_origin.as_deref(), Some("*"));
        assert_eq!(page.content_type.as_deref(), Some("text/html; charset=utf-8"));
        assert_eq!(page.body, html);
        assert_eq!(server.requests_served(), 1);
    }

    #[test]
    fn other_paths_are_not_found() {
        let server = ContentServer::start("<p>x</p>".to_string()).unwrap();
        let page = fetch_page(&format!("http://127.0.0.1:{}/favicon.ico", server.port())).unwrap();
        assert_eq!(page.status, 404);
        assert_eq!(server.requests_served(), 0);
    }

    #[test]
    fn serves_non_ascii_html_verbatim() {
        let html = "<html><body>Grüße, 世界 ✓</body></html>";
        let server = ContentServer::start(html.to_string()).unwrap();
        let page = fetch_page(&server.url()).unwrap();
        assert_eq!(page.body, html);
    }

    #[test]
    fn each_server_gets_its_own_port() {
        let a = ContentServer::start(String::new()).unwrap();
        let b = ContentServer::start(String::new()).unwrap();
        assert_ne!(a.port(), b.port());
    }

    #[test]
    fn stops_listening_once_dropped() {
        let server = ContentServer::start("<p>bye</p>".to_string()).unwrap();
        let port = server.port();
        assert!(TcpStream::connect(("127.0.0.1", port)).is_ok());
        drop(server);

        let refused = (0..40).any(|_| {
            if TcpStream::connect(("127.0.0.1", port)).is_err() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
            false
        });
        assert!(refused, "port {} still accepting connections", port);
    }
}
