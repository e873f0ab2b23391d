//! Chrome DevTools Protocol backend

use crate::{Backend, Deadline, Error, LaunchConfig, Result};
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, info, warn};
use serde::Deserialize;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Flags passed to every pooled Chrome process. Sandboxing is off so Chrome
/// runs inside containers; the rest trim background work and GPU use.
const CHROME_FLAGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-breakpad",
    "--disable-client-side-phishing-detection",
    "--disable-component-update",
    "--disable-default-apps",
    "--disable-ipc-flooding-protection",
    "--disable-popup-blocking",
    "--disable-prompt-on-repost",
    "--disable-renderer-backgrounding",
    "--disable-sync",
    "--disable-translate",
    "--metrics-recording-only",
    "--no-first-run",
    "--safebrowsing-disable-auto-update",
    "--enable-automation",
    "--password-store=basic",
    "--use-mock-keychain",
    "--allow-running-insecure-content",
];

/// Interval between readiness predicate evaluations
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const PAGE_SIZE_SCRIPT: &str = r#"JSON.stringify({
    width: Math.max(document.documentElement.scrollWidth, document.body ? document.body.scrollWidth : 0),
    height: Math.max(document.documentElement.scrollHeight, document.body ? document.body.scrollHeight : 0)
})"#;

#[derive(Debug, Deserialize)]
struct PageSize {
    width: f64,
    height: f64,
}

/// Backend over one headless Chrome process (uses the `headless_chrome` crate)
///
/// The browser process is the allocator: every pooled context is a tab in it,
/// and cancelling the backend drops the `Browser`, which terminates Chrome.
pub struct CdpBackend {
    browser: Mutex<Option<Browser>>,
}

impl CdpBackend {
    /// Launch Chrome with the pool's flag set.
    pub fn launch(config: &LaunchConfig) -> Result<Self> {
        let args: Vec<&OsStr> = CHROME_FLAGS.iter().map(OsStr::new).collect();

        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false)
            .path(config.chrome_path.clone())
            .window_size(Some(config.window_size))
            .idle_browser_timeout(config.idle_browser_timeout)
            .args(args)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::InitializationError(format!("Failed to launch browser: {}", e)))?;
        info!("Launched headless Chrome ({} flags)", CHROME_FLAGS.len());

        Ok(Self {
            browser: Mutex::new(Some(browser)),
        })
    }

    fn browser(&self) -> MutexGuard<'_, Option<Browser>> {
        self.browser.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Backend for CdpBackend {
    type Context = Arc<Tab>;

    fn create_context(&self) -> Result<Arc<Tab>> {
        let guard = self.browser();
        let browser = guard
            .as_ref()
            .ok_or_else(|| Error::InitializationError("browser has been shut down".into()))?;
        browser
            .new_tab()
            .map_err(|e| Error::InitializationError(format!("Failed to create tab: {}", e)))
    }

    fn warm_up(&self, tab: &Arc<Tab>) -> Result<()> {
        tab.navigate_to("about:blank")
            .and_then(|t| t.wait_until_navigated())
            .map_err(|e| Error::LoadError(format!("Warm-up navigation failed: {}", e)))?;
        Ok(())
    }

    fn navigate(&self, tab: &Arc<Tab>, url: &str, deadline: Deadline) -> Result<()> {
        tab.set_default_timeout(deadline.check()?);
        tab.navigate_to(url)
            .map_err(|e| Error::LoadError(format!("Navigation failed: {}", e)))?;
        tab.wait_until_navigated()
            .map_err(|e| Error::LoadError(format!("Wait for navigation failed: {}", e)))?;
        Ok(())
    }

    fn wait_visible(&self, tab: &Arc<Tab>, selector: &str, deadline: Deadline) -> Result<()> {
        let left = deadline.check()?;
        tab.wait_for_element_with_custom_timeout(selector, left)
            .map_err(|e| Error::LoadError(format!("'{}' never became visible: {}", selector, e)))?;
        Ok(())
    }

    fn poll(&self, tab: &Arc<Tab>, predicate: &str, timeout: Duration) -> Result<bool> {
        let started = Instant::now();
        loop {
            let left = timeout.saturating_sub(started.elapsed());
            if left.is_zero() {
                return Ok(false);
            }
            tab.set_default_timeout(left);

            match tab.evaluate(predicate, false) {
                Ok(result) => {
                    if result.value.as_ref().and_then(|v| v.as_bool()) == Some(true) {
                        debug!("readiness predicate held after {:?}", started.elapsed());
                        return Ok(true);
                    }
                }
                // The document may be mid-navigation; keep polling until timeout.
                Err(e) => debug!("readiness predicate evaluation failed: {}", e),
            }

            std::thread::sleep(POLL_INTERVAL.min(timeout.saturating_sub(started.elapsed())));
        }
    }

    fn capture_full_page(&self, tab: &Arc<Tab>, quality: u8, deadline: Deadline) -> Result<Vec<u8>> {
        tab.set_default_timeout(deadline.check()?);

        let measured = tab.evaluate(PAGE_SIZE_SCRIPT, false)?;
        let size: PageSize = measured
            .value
            .as_ref()
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str(s).ok())
            .ok_or_else(|| Error::RenderError("Page size measurement returned no value".into()))?;

        let clip = Page::Viewport {
            x: 0.0,
            y: 0.0,
            width: size.width.max(1.0),
            height: size.height.max(1.0),
            scale: 1.0,
        };

        // Chrome ignores quality for PNG, so "full quality" means lossless.
        let (format, quality) = if quality >= 100 {
            (Page::CaptureScreenshotFormatOption::Png, None)
        } else {
            (Page::CaptureScreenshotFormatOption::Jpeg, Some(u32::from(quality)))
        };

        Ok(tab.capture_screenshot(format, quality, Some(clip), true)?)
    }

    fn cancel_context(&self, tab: Arc<Tab>) {
        if let Err(e) = tab.close(false) {
            warn!("Failed to close tab: {}", e);
        }
    }

    fn cancel(&self) {
        // Dropping the last handle terminates the Chrome process.
        if self.browser().take().is_some() {
            info!("Closed headless Chrome");
        }
    }
}
