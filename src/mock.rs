//! A scriptable in-memory [`Backend`] for tests and benchmarks.
//!
//! `MockBackend` records every call it receives and can be told to fail
//! navigations, stall, report unready pages or return empty captures. When
//! `fetch_http` is enabled, navigations to `http://` URLs perform a real GET
//! so local-serve rendering can be checked end to end without Chrome.

use crate::{Backend, Deadline, Error, Result};
use reqwest::header::{HeaderMap, HeaderName, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// PNG signature, returned as the default capture so callers see plausible bytes
pub const FAKE_IMAGE: &[u8] = b"\x89PNG\r\n\x1a\nmock-image";

/// Context handed out by [`MockBackend`]
#[derive(Debug, PartialEq, Eq)]
pub struct MockContext {
    id: usize,
}

impl MockContext {
    pub fn id(&self) -> usize {
        self.id
    }
}

/// A page fetched from a local content server during a mock navigation
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    /// `Access-Control-Allow-Origin` response header
    pub allow_origin: Option<String>,
    pub body: String,
}

/// In-memory backend; see the module docs.
#[derive(Debug)]
pub struct MockBackend {
    next_id: AtomicUsize,
    fail_create_after: Option<usize>,
    fail_warm_up: bool,
    failing_prefixes: Vec<String>,
    navigate_delay: Duration,
    poll_result: bool,
    capture: Vec<u8>,
    fetch_http: bool,
    cancel_delay: Duration,

    warm_ups: AtomicUsize,
    allocator_cancelled: AtomicBool,
    navigations: Mutex<Vec<String>>,
    polls: Mutex<Vec<(String, Duration)>>,
    captures: Mutex<Vec<u8>>,
    cancelled: Mutex<Vec<usize>>,
    fetched: Mutex<Vec<FetchedPage>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(0),
            fail_create_after: None,
            fail_warm_up: false,
            failing_prefixes: Vec::new(),
            navigate_delay: Duration::ZERO,
            poll_result: true,
            capture: FAKE_IMAGE.to_vec(),
            fetch_http: false,
            cancel_delay: Duration::ZERO,
            warm_ups: AtomicUsize::new(0),
            allocator_cancelled: AtomicBool::new(false),
            navigations: Mutex::new(Vec::new()),
            polls: Mutex::new(Vec::new()),
            captures: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// Context creation fails once `n` contexts exist
    pub fn fail_create_after(mut self, n: usize) -> Self {
        self.fail_create_after = Some(n);
        self
    }

    /// Every warm-up navigation fails
    pub fn fail_warm_up(mut self) -> Self {
        self.fail_warm_up = true;
        self
    }

    /// Navigations to URLs starting with `prefix` fail
    pub fn fail_navigation_to(mut self, prefix: &str) -> Self {
        self.failing_prefixes.push(prefix.to_string());
        self
    }

    /// Each navigation takes this long (bounded by the task deadline)
    pub fn with_navigate_delay(mut self, delay: Duration) -> Self {
        self.navigate_delay = delay;
        self
    }

    /// Result reported by `poll`; `false` makes polling run out its timeout
    pub fn with_poll_result(mut self, ready: bool) -> Self {
        self.poll_result = ready;
        self
    }

    /// Bytes returned by `capture_full_page`
    pub fn with_capture(mut self, bytes: &[u8]) -> Self {
        self.capture = bytes.to_vec();
        self
    }

    /// Perform a real HTTP GET when navigating to `http://` URLs
    pub fn fetch_http(mut self) -> Self {
        self.fetch_http = true;
        self
    }

    /// `cancel_context` and `cancel` each block for `delay`, like closing a
    /// real tab or browser process
    pub fn with_cancel_delay(mut self, delay: Duration) -> Self {
        self.cancel_delay = delay;
        self
    }

    pub fn contexts_created(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn warm_ups(&self) -> usize {
        self.warm_ups.load(Ordering::SeqCst)
    }

    pub fn allocator_cancelled(&self) -> bool {
        self.allocator_cancelled.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> Vec<String> {
        lock(&self.navigations).clone()
    }

    /// Predicate and timeout of each `poll`, in call order
    pub fn polls(&self) -> Vec<(String, Duration)> {
        lock(&self.polls).clone()
    }

    /// Quality requested by each capture, in call order
    pub fn captures(&self) -> Vec<u8> {
        lock(&self.captures).clone()
    }

    /// Ids of contexts released via `cancel_context`
    pub fn cancelled_contexts(&self) -> Vec<usize> {
        lock(&self.cancelled).clone()
    }

    pub fn fetched_pages(&self) -> Vec<FetchedPage> {
        lock(&self.fetched).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn header(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// GET `url` the way a browser would fetch a served page.
///
/// Blocking; call it from a plain thread, never from inside an async task.
pub fn fetch_page(url: &str) -> reqwest::Result<FetchedPage> {
    let client = reqwest::blocking::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()?;
    let response = client.get(url).send()?;
    let status = response.status().as_u16();
    let content_type = header(response.headers(), CONTENT_TYPE);
    let allow_origin = header(response.headers(), ACCESS_CONTROL_ALLOW_ORIGIN);
    let body = response.text()?;
    Ok(FetchedPage {
        url: url.to_string(),
        status,
        content_type,
        allow_origin,
        body,
    })
}

impl Backend for MockBackend {
    type Context = MockContext;

    fn create_context(&self) -> Result<MockContext> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_create_after {
            if id >= limit {
                self.next_id.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::InitializationError(format!(
                    "mock refused context #{}",
                    id + 1
                )));
            }
        }
        Ok(MockContext { id })
    }

    fn warm_up(&self, _ctx: &MockContext) -> Result<()> {
        self.warm_ups.fetch_add(1, Ordering::SeqCst);
        if self.fail_warm_up {
            return Err(Error::LoadError("mock warm-up failure".into()));
        }
        Ok(())
    }

    fn navigate(&self, _ctx: &MockContext, url: &str, deadline: Deadline) -> Result<()> {
        lock(&self.navigations).push(url.to_string());

        if !self.navigate_delay.is_zero() {
            let left = deadline.remaining();
            if self.navigate_delay >= left {
                std::thread::sleep(left);
                return Err(Error::Timeout(deadline.budget().as_millis() as u64));
            }
            std::thread::sleep(self.navigate_delay);
        }

        if self.failing_prefixes.iter().any(|p| url.starts_with(p)) {
            return Err(Error::LoadError(format!("mock navigation to {} failed", url)));
        }

        if self.fetch_http && url.starts_with("http://") {
            let page = fetch_page(url).map_err(|e| Error::LoadError(e.to_string()))?;
            if page.status != 200 {
                return Err(Error::LoadError(format!("{} answered {}", url, page.status)));
            }
            lock(&self.fetched).push(page);
        }
        Ok(())
    }

    fn wait_visible(&self, _ctx: &MockContext, _selector: &str, deadline: Deadline) -> Result<()> {
        deadline.check().map(|_| ())
    }

    fn poll(&self, _ctx: &MockContext, predicate: &str, timeout: Duration) -> Result<bool> {
        lock(&self.polls).push((predicate.to_string(), timeout));
        if !self.poll_result {
            std::thread::sleep(timeout);
        }
        Ok(self.poll_result)
    }

    fn capture_full_page(&self, _ctx: &MockContext, quality: u8, deadline: Deadline) -> Result<Vec<u8>> {
        deadline.check()?;
        lock(&self.captures).push(quality);
        Ok(self.capture.clone())
    }

    fn cancel_context(&self, ctx: MockContext) {
        std::thread::sleep(self.cancel_delay);
        lock(&self.cancelled).push(ctx.id);
    }

    fn cancel(&self) {
        std::thread::sleep(self.cancel_delay);
        self.allocator_cancelled.store(true, Ordering::SeqCst);
    }
}
