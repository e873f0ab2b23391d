//! Async façade over the pool and the orchestrator.
//!
//! Browser backends are blocking, so each render runs on tokio's blocking
//! thread pool with the lease moved into it: the context only returns to the
//! pool once the browser work on it has actually finished.

use crate::api::ConvertRequest;
use crate::{Backend, Error, InstancePool, RenderOptions, Renderer, Result};
use log::{debug, info};
use std::sync::Arc;
use std::time::Instant;

/// Checkout → render → checkin, shared by every request handler.
pub struct Service<B: Backend> {
    pool: InstancePool<B>,
    renderer: Arc<Renderer>,
}

impl<B: Backend> Clone for Service<B> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            renderer: Arc::clone(&self.renderer),
        }
    }
}

impl<B: Backend> Service<B> {
    pub fn new(pool: InstancePool<B>, options: RenderOptions) -> Self {
        Self {
            pool,
            renderer: Arc::new(Renderer::new(options)),
        }
    }

    pub fn pool(&self) -> &InstancePool<B> {
        &self.pool
    }

    /// Render `html` with a pooled context, waiting for one if all are busy.
    pub async fn render(&self, html: String, prefer_local_server: bool) -> Result<Vec<u8>> {
        let waited = Instant::now();
        let lease = self.pool.checkout().await;
        debug!("Checked out a browser context after {:?}", waited.elapsed());

        let renderer = Arc::clone(&self.renderer);
        tokio::task::spawn_blocking(move || {
            let result = renderer.render(lease.backend(), lease.context(), &html, prefer_local_server);
            drop(lease);
            result
        })
        .await
        .map_err(|e| Error::Other(format!("render task aborted: {}", e)))?
    }

    /// Decode a conversion request and render it.
    pub async fn convert(&self, request: ConvertRequest) -> Result<Vec<u8>> {
        let html = request.html()?;
        if request.use_local_server {
            info!("Converting with the local content server...");
        } else {
            info!("Converting with an inline data URL...");
        }
        self.render(html, request.use_local_server).await
    }
}
