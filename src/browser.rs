//! Headless-browser page fetching.
//!
//! One browser process per session. Every fetch opens its own tab and closes
//! it before returning; concurrent tab use is bounded by [`TabPool`].

use crate::budget;
use crate::config::BrowserConfig;
use crate::error::{PubfillError, Result};
use crate::html;
use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig as CdpConfig, Page};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Interval between content polls while waiting for markers.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Upper bound on the `document.readyState` wait once markers are present.
const READY_STATE_WAIT: Duration = Duration::from_secs(5);
/// Content-type HEAD request timeout.
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);
/// Slack on top of settle + budget before the pool gives up on a fetcher.
const POOL_GRACE: Duration = Duration::from_secs(5);
/// Upper bound on waiting for abandoned tabs to close.
const CLOSE_DRAIN: Duration = Duration::from_secs(5);

/// Classified page-fetch failure. Every variant is recoverable for the stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("page wait timed out")]
    Timeout,
    #[error("CAPTCHA detected")]
    Captcha,
    #[error("url points to a PDF")]
    IsPdf,
    #[error("fetch failed: {0}")]
    Generic(String),
}

/// Something that must be on the page before its content is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// Every word of the title in one visible text node
    Title(String),
    /// Case-insensitive phrase in the visible text
    Phrase(String),
    /// CSS selector with at least one match
    Selector(String),
}

impl Marker {
    pub fn is_met(&self, page: &str) -> bool {
        match self {
            Marker::Title(title) => html::title_on_page(page, title),
            Marker::Phrase(phrase) => html::contains_phrase(page, phrase),
            Marker::Selector(css) => html::has_selector(page, css),
        }
    }
}

/// One page load.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// All must be satisfied
    pub markers: Vec<Marker>,
    /// Fixed wait after the tab opens
    pub settle: Duration,
    /// Marker wait after settling
    pub budget: Duration,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, settle: Duration, budget: Duration) -> Self {
        Self {
            url: url.into(),
            markers: Vec::new(),
            settle,
            budget,
        }
    }

    pub fn marker(mut self, marker: Marker) -> Self {
        self.markers.push(marker);
        self
    }

    pub fn satisfied_by(&self, page: &str) -> bool {
        self.markers.iter().all(|m| m.is_met(page))
    }
}

/// Loads a URL and hands back its HTML once the request's markers appear.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> std::result::Result<String, FetchError>;

    /// Release the browser. Later fetches fail with `Generic`.
    async fn shutdown(&self);
}

/// Acquires the per-session browser.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn PageFetcher>>;
}

/// Semaphore-bounded access to a session's fetcher.
#[derive(Clone)]
pub struct TabPool {
    fetcher: Arc<dyn PageFetcher>,
    permits: Arc<Semaphore>,
}

impl TabPool {
    pub fn new(fetcher: Arc<dyn PageFetcher>, concurrency: usize) -> Self {
        Self {
            fetcher,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Fetch with a tab permit held for the whole load.
    pub async fn fetch(&self, request: &FetchRequest) -> std::result::Result<String, FetchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Generic("tab pool closed".into()))?;

        let limit = request.settle + request.budget + POOL_GRACE;
        budget::within(limit, self.fetcher.fetch(request))
            .await
            .unwrap_or(Err(FetchError::Timeout))
    }
}

/// Tab closes running in the background. Shutdown drains them before the
/// browser goes away.
#[derive(Clone, Default)]
struct CloseTracker {
    tracker: TaskTracker,
}

impl CloseTracker {
    fn close_later<F>(&self, close: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match Handle::try_current() {
            Ok(handle) => {
                self.tracker.spawn_on(close, &handle);
            }
            Err(_) => debug!("No runtime for tab close; leaving it to browser shutdown"),
        }
    }

    async fn drain(&self) {
        self.tracker.close();
        if tokio::time::timeout(CLOSE_DRAIN, self.tracker.wait()).await.is_err() {
            warn!(pending = self.tracker.len(), "Tab closes still pending at shutdown");
        }
    }
}

/// Tab owned by one fetch. Closed explicitly on the normal path; a dropped
/// guard (cancelled task) closes the tab through the tracker.
struct TabGuard {
    page: Page,
    closes: CloseTracker,
    closed: bool,
}

impl TabGuard {
    fn new(page: Page, closes: CloseTracker) -> Self {
        Self {
            page,
            closes,
            closed: false,
        }
    }

    async fn close(mut self) {
        self.closed = true;
        if let Err(e) = self.page.clone().close().await {
            debug!(error = %e, "Failed to close tab");
        }
    }
}

impl Drop for TabGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let page = self.page.clone();
        self.closes.close_later(async move {
            if let Err(e) = page.close().await {
                debug!(error = %e, "Failed to close abandoned tab");
            }
        });
    }
}

/// Chromium over CDP.
pub struct ChromeFetcher {
    browser: RwLock<Option<Browser>>,
    handler: Mutex<Option<JoinHandle<()>>>,
    closes: CloseTracker,
    http: reqwest::Client,
}

impl ChromeFetcher {
    async fn content_type_is_pdf(&self, url: &str) -> bool {
        let response = match self.http.head(url).timeout(HEAD_TIMEOUT).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %url, error = %e, "Content-type check failed");
                return false;
            }
        };
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(html::is_pdf_hint)
    }

    async fn open_tab(&self, url: &str) -> std::result::Result<TabGuard, FetchError> {
        let guard = self.browser.read().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| FetchError::Generic("browser already released".into()))?;
        let page = browser
            .new_page(url)
            .await
            .map_err(|e| FetchError::Generic(e.to_string()))?;
        Ok(TabGuard::new(page, self.closes.clone()))
    }

    /// Bounded and non-fatal.
    async fn wait_ready_state(page: &Page) {
        let deadline = Instant::now() + READY_STATE_WAIT;
        while Instant::now() < deadline {
            let state = match page.evaluate("document.readyState").await {
                Ok(value) => value.into_value::<String>().unwrap_or_default(),
                Err(_) => return,
            };
            if state == "complete" {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        debug!("Page never reached readyState=complete");
    }
}

#[async_trait]
impl PageFetcher for ChromeFetcher {
    async fn fetch(&self, request: &FetchRequest) -> std::result::Result<String, FetchError> {
        if html::is_pdf_hint(&request.url) || self.content_type_is_pdf(&request.url).await {
            return Err(FetchError::IsPdf);
        }

        debug!(url = %request.url, "Opening tab");
        let tab = self.open_tab(&request.url).await?;
        tokio::time::sleep(request.settle).await;

        let deadline = Instant::now() + request.budget;
        let mut last = String::new();
        loop {
            match tab.page.content().await {
                Ok(content) if request.satisfied_by(&content) => {
                    Self::wait_ready_state(&tab.page).await;
                    let content = tab.page.content().await.unwrap_or(content);
                    tab.close().await;
                    return Ok(content);
                }
                Ok(content) => last = content,
                Err(e) => debug!(url = %request.url, error = %e, "Content read failed"),
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        tab.close().await;
        if html::looks_like_captcha(&last) {
            warn!(url = %request.url, "CAPTCHA on page");
            Err(FetchError::Captcha)
        } else {
            debug!(url = %request.url, "Markers never appeared");
            Err(FetchError::Timeout)
        }
    }

    async fn shutdown(&self) {
        let browser = self.browser.write().await.take();
        self.closes.drain().await;
        if let Some(mut browser) = browser {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "Browser close failed");
            }
            if let Err(e) = browser.wait().await {
                debug!(error = %e, "Browser process wait failed");
            }
            info!("Browser released");
        }
        if let Some(handle) = self.handler.lock().await.take() {
            handle.abort();
        }
    }
}

/// Launches a local Chromium.
pub struct ChromeLauncher {
    config: BrowserConfig,
}

impl ChromeLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn PageFetcher>> {
        let mut builder = CdpConfig::builder();
        if let Some(path) = &self.config.chrome_path {
            builder = builder.chrome_executable(path);
        }
        if !self.config.headless {
            builder = builder.with_head();
        }
        let cdp_config = builder
            .args(["--no-sandbox", "--disable-gpu", "--disable-dev-shm-usage"])
            .build()
            .map_err(PubfillError::Browser)?;

        info!(headless = self.config.headless, "Launching browser");
        let (browser, mut handler) = Browser::launch(cdp_config)
            .await
            .map_err(|e| PubfillError::Browser(e.to_string()))?;

        let handle = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            debug!("Browser event loop exited");
        });

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| PubfillError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Arc::new(ChromeFetcher {
            browser: RwLock::new(Some(browser)),
            handler: Mutex::new(Some(handle)),
            closes: CloseTracker::default(),
            http,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowFetcher {
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl PageFetcher for SlowFetcher {
        async fn fetch(&self, _request: &FetchRequest) -> std::result::Result<String, FetchError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok("<html></html>".into())
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn test_drain_waits_for_pending_closes() {
        let closes = CloseTracker::default();
        let outstanding = Arc::new(AtomicUsize::new(0));
        for i in 0..5 {
            let outstanding = Arc::clone(&outstanding);
            outstanding.fetch_add(1, Ordering::SeqCst);
            closes.close_later(async move {
                tokio::time::sleep(Duration::from_millis(10 * (i + 1))).await;
                outstanding.fetch_sub(1, Ordering::SeqCst);
            });
        }
        assert_eq!(outstanding.load(Ordering::SeqCst), 5);

        closes.drain().await;
        assert_eq!(outstanding.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_markers_all_required() {
        let page = r#"<html><body><h1>Deep Residual Learning</h1><div class="abs">x</div></body></html>"#;
        let request = FetchRequest::new("u", Duration::ZERO, Duration::ZERO)
            .marker(Marker::Title("Deep residual learning".into()))
            .marker(Marker::Selector("div.abs".into()));
        assert!(request.satisfied_by(page));

        let request = request.marker(Marker::Phrase("not present".into()));
        assert!(!request.satisfied_by(page));
    }

    #[tokio::test]
    async fn test_tab_pool_bounds_concurrency() {
        let fetcher = Arc::new(SlowFetcher {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::from_millis(30),
        });
        let pool = TabPool::new(fetcher.clone(), 2);

        let mut handles = Vec::new();
        for i in 0..6 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let request = FetchRequest::new(format!("u{}", i), Duration::ZERO, Duration::from_secs(1));
                pool.fetch(&request).await
            }));
        }
        for handle in handles {
            assert!(handle.await.expect("join").is_ok());
        }
        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 2);
    }
}
