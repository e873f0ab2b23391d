//! html2image
//!
//! Renders HTML markup into screenshot images by driving headless Chrome.
//! Launching a browser per request is slow, so the crate keeps a fixed pool
//! of pre-warmed tabs that are checked out for one render and returned.
//!
//! # Features
//!
//! - **Instance pool**: bounded, async checkout with RAII check-in and a
//!   timeout-bounded shutdown
//! - **Render orchestrator**: inline `data:` URL delivery with an automatic
//!   fallback to an ephemeral local content server
//! - **CDP backend** (default): headless Chrome via the `headless_chrome` crate
//! - **HTTP front end**: a small JSON API (`POST /convert`)
//!
//! # Example
//!
//! ```no_run
//! use html2image::{cdp::CdpBackend, InstancePool, LaunchConfig, RenderOptions, Service};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = CdpBackend::launch(&LaunchConfig::default())?;
//! let pool = InstancePool::new(backend, 5)?;
//! let service = Service::new(pool.clone(), RenderOptions::default());
//!
//! let png = service.render("<html><body>Hello</body></html>".into(), false).await?;
//! println!("rendered {} bytes", png.len());
//!
//! pool.shutdown(std::time::Duration::from_secs(60)).await;
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, Instant};

pub mod error;
pub use error::{Error, Result};

pub mod config;
pub use config::{parse_pool_size, LaunchConfig, PoolConfig, RenderOptions, DEFAULT_POOL_SIZE};

pub mod pool;
pub use pool::{InstancePool, Lease, ShutdownReport};

pub mod delivery;
pub use delivery::Delivery;

pub mod content_server;

pub mod render;
pub use render::{Rendered, Renderer};

pub mod service;
pub use service::Service;

pub mod api;
pub use api::{ConvertRequest, ConvertResponse};

pub mod http;

#[cfg(feature = "cdp")]
pub mod cdp;

// In-memory backend for tests and benchmarks (no Chrome required)
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

/// A point in time by which a render task must finish.
///
/// Every browser call made on behalf of a task receives the task's deadline
/// and bounds itself by [`Deadline::remaining`].
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    budget: Duration,
    at: Instant,
}

impl Deadline {
    /// A deadline `budget` from now
    pub fn after(budget: Duration) -> Self {
        Self {
            budget,
            at: Instant::now() + budget,
        }
    }

    /// Time left before the deadline (zero once it has passed)
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Total budget the deadline was created with
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Remaining time, or [`Error::Timeout`] if the deadline has passed.
    pub fn check(&self) -> Result<Duration> {
        let left = self.remaining();
        if left.is_zero() {
            Err(Error::Timeout(self.budget.as_millis() as u64))
        } else {
            Ok(left)
        }
    }
}

/// Browser-automation capability the pool and the orchestrator are built on.
///
/// A backend value is the shared *allocator*: it spawns every execution
/// context handed to the pool and releases them all on [`Backend::cancel`].
/// Methods are blocking; async callers run them on a blocking thread.
pub trait Backend: Send + Sync + 'static {
    /// One live browser session (a tab for the CDP backend)
    type Context: Send + Sync + 'static;

    /// Create a new execution context from the allocator
    fn create_context(&self) -> Result<Self::Context>;

    /// Best-effort warm-up run once per context when the pool is built
    fn warm_up(&self, ctx: &Self::Context) -> Result<()>;

    /// Navigate to a URL (`data:` URI or `http://`) and wait for the load
    fn navigate(&self, ctx: &Self::Context, url: &str, deadline: Deadline) -> Result<()>;

    /// Wait until an element matching `selector` is visible
    fn wait_visible(&self, ctx: &Self::Context, selector: &str, deadline: Deadline) -> Result<()>;

    /// Repeatedly evaluate `predicate` until it is truthy (`Ok(true)`) or
    /// `timeout` elapses (`Ok(false)`).
    fn poll(&self, ctx: &Self::Context, predicate: &str, timeout: Duration) -> Result<bool>;

    /// Capture the whole page. `quality` is 0-100; 100 requests a lossless image.
    fn capture_full_page(&self, ctx: &Self::Context, quality: u8, deadline: Deadline) -> Result<Vec<u8>>;

    /// Release one context
    fn cancel_context(&self, ctx: Self::Context);

    /// Release the allocator itself. Called once, after the pool has drained.
    fn cancel(&self);
}
