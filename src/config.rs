//! Configuration for the browser pool, the Chrome launcher and render tasks.

use log::warn;
use std::path::PathBuf;
use std::time::Duration;

/// Number of pooled contexts used when none (or an invalid count) is configured.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Pool configuration
///
/// # Examples
///
/// ```
/// let cfg = html2image::PoolConfig::default();
/// assert_eq!(cfg.capacity, 5);
/// assert_eq!(cfg.shutdown_timeout.as_secs(), 60);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of contexts created at warm-up
    pub capacity: usize,
    /// Upper bound on how long shutdown waits for borrowed contexts to return
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_SIZE,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// Options used when launching the shared Chrome process
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Explicit Chrome/Chromium binary; `None` lets headless_chrome discover one
    pub chrome_path: Option<PathBuf>,
    /// Browser window size, which is also the screenshot viewport width
    pub window_size: (u32, u32),
    /// How long Chrome may sit without CDP traffic before headless_chrome kills it
    pub idle_browser_timeout: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            window_size: (1280, 720),
            idle_browser_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Timing and quality knobs for a single render task
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Deadline for the whole task, shared by every delivery strategy attempted
    pub task_timeout: Duration,
    /// Upper bound for the readiness poll inside one strategy
    pub poll_timeout: Duration,
    /// Image quality for inline-embed captures (100 => lossless PNG)
    pub inline_quality: u8,
    /// Image quality for local-serve captures
    pub local_quality: u8,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(15),
            inline_quality: 100,
            local_quality: 90,
        }
    }
}

/// Parse a configured pool size, falling back to [`DEFAULT_POOL_SIZE`] when the
/// value is absent, not a number, or not positive.
pub fn parse_pool_size(raw: Option<&str>) -> usize {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_POOL_SIZE;
    };
    match raw.parse::<i64>() {
        Ok(n) if n > 0 => n as usize,
        _ => {
            warn!(
                "Invalid pool size '{}', using default of {}",
                raw, DEFAULT_POOL_SIZE
            );
            DEFAULT_POOL_SIZE
        }
    }
}
