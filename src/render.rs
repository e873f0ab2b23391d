//! Render orchestration: drive a borrowed context through an ordered list of
//! delivery strategies until one produces an image.

use crate::delivery::Delivery;
use crate::{Backend, Deadline, Error, RenderOptions, Result};
use log::{debug, info, warn};
use std::fmt;
use std::time::Instant;

/// In-page readiness check used between navigation and capture.
///
/// Ready once the document has loaded and every `<img>` has finished. An image
/// that failed to load counts as finished (`complete` with a zero
/// `naturalHeight`), and two seconds after polling began the page is ready
/// regardless, so broken or slow images cannot stall a render.
pub const READY_PREDICATE: &str = r#"(function() {
    const start = window.__html2imagePollStart || (window.__html2imagePollStart = Date.now());
    if (Date.now() - start > 2000) return true;
    if (document.readyState !== 'complete') return false;
    return Array.from(document.querySelectorAll('img')).every(img => img.complete);
})()"#;

/// Selector waited on before readiness polling starts
const BODY_SELECTOR: &str = "body";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Created,
    Navigating(Delivery),
    Ready(Delivery),
    Captured(Delivery),
    Failed(Delivery),
    Done,
    DoneWithError,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Created => write!(f, "created"),
            TaskState::Navigating(d) => write!(f, "navigating ({})", d),
            TaskState::Ready(d) => write!(f, "ready ({})", d),
            TaskState::Captured(d) => write!(f, "captured ({})", d),
            TaskState::Failed(d) => write!(f, "failed ({})", d),
            TaskState::Done => write!(f, "done"),
            TaskState::DoneWithError => write!(f, "done with error"),
        }
    }
}

struct Task {
    state: TaskState,
    started: Instant,
}

impl Task {
    fn new() -> Self {
        debug!("render task {}", TaskState::Created);
        Self {
            state: TaskState::Created,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, next: TaskState) {
        debug!(
            "render task {} -> {} after {:?}",
            self.state,
            next,
            self.started.elapsed()
        );
        self.state = next;
    }
}

/// A successful render and how it was delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub image: Vec<u8>,
    /// Strategy that produced the image
    pub delivery: Delivery,
    /// Page requests answered by the content server; zero for inline embedding
    pub requests_served: usize,
}

/// Renders HTML with a borrowed execution context.
#[derive(Debug, Clone, Default)]
pub struct Renderer {
    options: RenderOptions,
}

impl Renderer {
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Render `html` to image bytes.
    ///
    /// Tries inline embedding and falls back to a local content server once;
    /// with `prefer_local_server` only the local server is used. The whole task,
    /// fallback included, is bounded by [`RenderOptions::task_timeout`].
    pub fn render<B: Backend>(
        &self,
        backend: &B,
        ctx: &B::Context,
        html: &str,
        prefer_local_server: bool,
    ) -> Result<Vec<u8>> {
        self.render_with_plan(backend, ctx, html, &Delivery::plan(prefer_local_server))
            .map(|rendered| rendered.image)
    }

    /// Render using an explicit, ordered list of strategies.
    pub fn render_with_plan<B: Backend>(
        &self,
        backend: &B,
        ctx: &B::Context,
        html: &str,
        plan: &[Delivery],
    ) -> Result<Rendered> {
        let deadline = Deadline::after(self.options.task_timeout);
        let mut task = Task::new();
        let mut failures: Vec<(Delivery, Error)> = Vec::with_capacity(plan.len());

        for &delivery in plan {
            if deadline.is_expired() {
                break;
            }
            task.enter(TaskState::Navigating(delivery));
            match self.attempt(backend, ctx, html, delivery, deadline, &mut task) {
                Ok(rendered) => {
                    task.enter(TaskState::Done);
                    info!(
                        "Rendered {} bytes via {} in {:?}",
                        rendered.image.len(),
                        delivery,
                        task.started.elapsed()
                    );
                    return Ok(rendered);
                }
                Err(e) => {
                    task.enter(TaskState::Failed(delivery));
                    warn!("{} delivery failed: {}", delivery, e);
                    failures.push((delivery, e));
                }
            }
        }

        task.enter(TaskState::DoneWithError);
        if deadline.is_expired() {
            warn!(
                "Render task exceeded its {:?} deadline after {} attempt(s)",
                deadline.budget(),
                failures.len()
            );
            return Err(Error::Timeout(deadline.budget().as_millis() as u64));
        }
        Err(exhausted(&failures))
    }

    fn attempt<B: Backend>(
        &self,
        backend: &B,
        ctx: &B::Context,
        html: &str,
        delivery: Delivery,
        deadline: Deadline,
        task: &mut Task,
    ) -> Result<Rendered> {
        deadline.check()?;
        // Dropping the target at the end of this attempt stops any content server.
        let target = delivery.prepare(html)?;

        backend.navigate(ctx, target.url(), deadline)?;
        deadline.check()?;
        backend.wait_visible(ctx, BODY_SELECTOR, deadline)?;

        let poll_timeout = self.options.poll_timeout.min(deadline.check()?);
        if !backend.poll(ctx, READY_PREDICATE, poll_timeout)? {
            return Err(Error::Timeout(poll_timeout.as_millis() as u64));
        }
        task.enter(TaskState::Ready(delivery));

        let image = backend.capture_full_page(ctx, delivery.quality(&self.options), deadline)?;
        if image.is_empty() {
            return Err(Error::RenderError("capture returned an empty image".into()));
        }
        task.enter(TaskState::Captured(delivery));
        Ok(Rendered {
            image,
            delivery,
            requests_served: target.server().map_or(0, |server| server.requests_served()),
        })
    }
}

fn exhausted(failures: &[(Delivery, Error)]) -> Error {
    let detail = failures
        .iter()
        .map(|(delivery, e)| format!("{}: {}", delivery, e))
        .collect::<Vec<_>>()
        .join("; ");
    Error::RenderError(format!("all delivery strategies failed ({})", detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, FAKE_IMAGE};
    use std::net::TcpStream;
    use std::time::Duration;

    const HELLO: &str = "<html><body>Hello</body></html>";

    fn render(backend: &MockBackend, options: RenderOptions, html: &str, local: bool) -> Result<Vec<u8>> {
        let ctx = backend.create_context().unwrap();
        Renderer::new(options).render(backend, &ctx, html, local)
    }

    fn port_of(url: &str) -> u16 {
        url.trim_start_matches("http://127.0.0.1:")
            .trim_end_matches('/')
            .parse()
            .unwrap()
    }

    fn assert_closed(port: u16) {
        let closed = (0..40).any(|_| {
            if TcpStream::connect(("127.0.0.1", port)).is_err() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
            false
        });
        assert!(closed, "content server on {} outlived its task", port);
    }

    #[test]
    fn inline_embed_is_tried_first() {
        let backend = MockBackend::new();
        let image = render(&backend, RenderOptions::default(), HELLO, false).unwrap();

        assert_eq!(image, FAKE_IMAGE);
        let navs = backend.navigations();
        assert_eq!(navs.len(), 1);
        assert!(navs[0].starts_with("data:text/html;charset=utf-8;base64,"));
        assert_eq!(backend.captures(), vec![100]);
    }

    #[test]
    fn failed_inline_embed_falls_back_to_local_serve() {
        let backend = MockBackend::new().fail_navigation_to("data:").fetch_http();
        let image = render(&backend, RenderOptions::default(), HELLO, false).unwrap();

        assert_eq!(image, FAKE_IMAGE);
        let navs = backend.navigations();
        assert_eq!(navs.len(), 2);
        assert!(navs[0].starts_with("data:"));
        assert!(navs[1].starts_with("http://127.0.0.1:"));
        assert_eq!(backend.captures(), vec![90]);

        let pages = backend.fetched_pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].body, HELLO);
        assert_closed(port_of(&navs[1]));
    }

    #[test]
    fn preferring_local_serve_skips_inline() {
        let backend = MockBackend::new().fetch_http();
        render(&backend, RenderOptions::default(), HELLO, true).unwrap();

        let navs = backend.navigations();
        assert_eq!(navs.len(), 1);
        assert!(navs[0].starts_with("http://127.0.0.1:"));

        let pages = backend.fetched_pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].body, HELLO);
        assert_eq!(pages[0].status, 200);
        assert_eq!(pages[0].allow_origin.as_deref(), Some("*"));
        assert_closed(port_of(&navs[0]));
    }

    #[test]
    fn report_names_strategy_and_page_requests() {
        let backend = MockBackend::new().fetch_http();
        let ctx = backend.create_context().unwrap();
        let renderer = Renderer::default();

        let inline = renderer
            .render_with_plan(&backend, &ctx, HELLO, &[Delivery::InlineEmbed])
            .unwrap();
        assert_eq!(inline.delivery, Delivery::InlineEmbed);
        assert_eq!(inline.requests_served, 0);

        let local = renderer
            .render_with_plan(&backend, &ctx, HELLO, &[Delivery::LocalServe])
            .unwrap();
        assert_eq!(local.delivery, Delivery::LocalServe);
        assert_eq!(local.requests_served, 1);
        assert_eq!(local.image, FAKE_IMAGE);
    }

    #[test]
    fn local_serve_failure_has_no_fallback() {
        let backend = MockBackend::new().fail_navigation_to("http://");
        let err = render(&backend, RenderOptions::default(), HELLO, true).unwrap_err();

        assert_eq!(backend.navigations().len(), 1);
        let msg = err.to_string();
        assert!(msg.contains("local-serve"), "{}", msg);
        assert!(!msg.contains("inline-embed"), "{}", msg);
    }

    #[test]
    fn both_strategies_failing_reports_each() {
        let backend = MockBackend::new()
            .fail_navigation_to("data:")
            .fail_navigation_to("http://");
        let err = render(&backend, RenderOptions::default(), HELLO, false).unwrap_err();

        assert!(matches!(err, Error::RenderError(_)));
        let msg = err.to_string();
        assert!(msg.contains("inline-embed"), "{}", msg);
        assert!(msg.contains("local-serve"), "{}", msg);
        assert_eq!(backend.navigations().len(), 2);
        assert!(backend.captures().is_empty());
    }

    #[test]
    fn readiness_timeout_triggers_fallback_and_is_bounded() {
        let backend = MockBackend::new().with_poll_result(false);
        let options = RenderOptions {
            poll_timeout: Duration::from_millis(50),
            ..Default::default()
        };

        let started = Instant::now();
        let err = render(&backend, options, HELLO, false).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.to_string().contains("timed out after 50ms"), "{}", err);
        assert_eq!(backend.navigations().len(), 2);
    }

    #[test]
    fn task_deadline_is_shared_across_strategies() {
        let backend = MockBackend::new().with_navigate_delay(Duration::from_millis(500));
        let options = RenderOptions {
            task_timeout: Duration::from_millis(100),
            ..Default::default()
        };

        let started = Instant::now();
        let err = render(&backend, options, HELLO, false).unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(matches!(err, Error::Timeout(100)), "{:?}", err);
        // The deadline was gone before local-serve could start.
        assert_eq!(backend.navigations().len(), 1);
    }

    #[test]
    fn empty_capture_counts_as_failure() {
        let backend = MockBackend::new().with_capture(b"");
        let err = render(&backend, RenderOptions::default(), HELLO, false).unwrap_err();

        assert!(err.to_string().contains("empty image"), "{}", err);
        assert_eq!(backend.captures(), vec![100, 90]);
    }

    #[test]
    fn empty_html_still_renders() {
        let backend = MockBackend::new();
        let image = render(&backend, RenderOptions::default(), "", false).unwrap();
        assert!(!image.is_empty());
        assert_eq!(backend.navigations()[0], "data:text/html;charset=utf-8;base64,");
    }

    #[test]
    fn polls_readiness_within_the_poll_window() {
        let backend = MockBackend::new();
        render(&backend, RenderOptions::default(), HELLO, false).unwrap();

        let polls = backend.polls();
        assert_eq!(polls.len(), 1);
        let (predicate, timeout) = &polls[0];
        assert_eq!(predicate, READY_PREDICATE);
        assert!(*timeout <= Duration::from_secs(15));
        assert!(*timeout > Duration::from_secs(14));
    }

    #[test]
    fn poll_window_is_clipped_to_the_task_deadline() {
        let backend = MockBackend::new();
        let options = RenderOptions {
            task_timeout: Duration::from_secs(2),
            ..RenderOptions::default()
        };
        render(&backend, options, HELLO, false).unwrap();

        let (_, timeout) = &backend.polls()[0];
        assert!(*timeout <= Duration::from_secs(2));
    }

    #[test]
    fn ready_predicate_has_a_two_second_escape() {
        assert!(READY_PREDICATE.contains("> 2000"));
        assert!(READY_PREDICATE.contains("img.complete"));
        assert!(READY_PREDICATE.contains("readyState"));
    }
}
