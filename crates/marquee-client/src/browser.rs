use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use marquee_core::error::CrawlError;
use marquee_core::traits::{FetchMode, FetchedDoc, Fetcher, PageInteractor};

/// Rendered-fetch tuning.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Fixed sleep after navigation so reverse-proxy/CDN tunneling and
    /// late script execution settle before the DOM is read.
    pub settle: Duration,
    /// Bound on every explicit wait-for-element poll.
    pub wait_timeout: Duration,
    /// Bound on navigation itself.
    pub nav_timeout: Duration,
    /// Element that must be present before a page counts as rendered.
    pub wait_selector: Option<String>,
    pub user_agent: Option<String>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(15),
            nav_timeout: Duration::from_secs(30),
            wait_selector: None,
            user_agent: None,
        }
    }
}

impl BrowserOptions {
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_wait_selector(mut self, selector: impl Into<String>) -> Self {
        self.wait_selector = Some(selector.into());
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }
}

/// Headless-browser fetcher using Chromium via the Chrome DevTools Protocol.
///
/// Unlike the plain HTTP fetcher this executes JavaScript before returning
/// the DOM, which the anti-bot-fronted listing pages require. One Chromium
/// process and one tab are shared by every clone: the tab is stateful
/// (current page, cookies, DOM), so navigations are serialized through an
/// async mutex and only one may be in flight at a time. The returned
/// document carries a live [`BrowserPage`] so extraction can keep
/// interacting with the same navigation.
#[derive(Clone)]
pub struct BrowserFetcher {
    // Kept alive for the life of the fetcher; dropping it kills Chromium.
    _browser: Arc<Browser>,
    page: Arc<Page>,
    nav_lock: Arc<tokio::sync::Mutex<()>>,
    opts: Arc<BrowserOptions>,
}

impl BrowserFetcher {
    /// Launches a headless Chromium with default options.
    ///
    /// Requires a Chromium / Chrome binary reachable via `$PATH` (or the
    /// default locations checked by `chromiumoxide`).
    pub async fn launch() -> Result<Self, CrawlError> {
        Self::launch_with(BrowserOptions::default()).await
    }

    pub async fn launch_with(opts: BrowserOptions) -> Result<Self, CrawlError> {
        let mut builder = BrowserConfig::builder();
        builder = builder.no_sandbox().disable_default_args();

        // Snap-packaged Chromium exposes a wrapper that rejects standard
        // Chrome CLI flags (--headless, --disable-gpu, …).  We try to
        // locate the *real* binary buried inside the snap, falling back
        // to any other Chrome/Chromium the user may have installed.
        if let Some(bin) = Self::find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .arg("--window-size=1920,1080")
            .build()
            .map_err(|e| CrawlError::Browser(format!("browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CrawlError::Browser(format!("failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| CrawlError::Browser(format!("failed to open tab: {e}")))?;

        if let Some(ua) = &opts.user_agent {
            page.set_user_agent(ua.as_str())
                .await
                .map_err(|e| CrawlError::Browser(format!("failed to set user agent: {e}")))?;
        }

        Ok(Self {
            _browser: Arc::new(browser),
            page: Arc::new(page),
            nav_lock: Arc::new(tokio::sync::Mutex::new(())),
            opts: Arc::new(opts),
        })
    }

    /// Tries to locate the real Chrome/Chromium binary.
    ///
    /// On systems where Chromium is installed via **snap**, the wrapper at
    /// `/snap/bin/chromium` strips unknown CLI flags, breaking headless
    /// mode. We look for the real binary inside the snap first, then fall
    /// back to well-known system paths. If nothing is found we return
    /// `None` and let `chromiumoxide` do its own lookup.
    fn find_chrome_binary() -> Option<PathBuf> {
        let candidates: &[&str] = &[
            // Snap (Ubuntu default)
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            // Flatpak
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            // Common apt / manual installs
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        // Also honour an explicit override via env var.
        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        candidates.iter().map(PathBuf::from).find(|p| p.exists())
    }

    fn handle(&self) -> BrowserPage {
        BrowserPage {
            page: Arc::clone(&self.page),
        }
    }
}

impl Fetcher for BrowserFetcher {
    type Page = BrowserPage;

    async fn fetch(&self, url: &str, _mode: FetchMode) -> Result<FetchedDoc<BrowserPage>, CrawlError> {
        // The tab is stateful; one navigation at a time.
        let _nav = self.nav_lock.lock().await;

        match tokio::time::timeout(self.opts.nav_timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(CrawlError::Browser(format!("navigation to {url} failed: {e}")));
            }
            Err(_) => return Err(CrawlError::Timeout(self.opts.nav_timeout.as_secs())),
        }

        tokio::time::sleep(self.opts.settle).await;

        if let Some(selector) = &self.opts.wait_selector {
            if !self.handle().wait_for(selector, self.opts.wait_timeout).await? {
                tracing::debug!(%url, %selector, "Wait-for element never appeared");
            }
        }

        let html = self
            .page
            .content()
            .await
            .map_err(|e| CrawlError::Browser(format!("failed to read page content: {e}")))?;

        let final_url = self
            .page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());

        Ok(FetchedDoc {
            url: final_url,
            html,
            page: Some(self.handle()),
        })
    }
}

/// Live handle onto the shared tab's current navigation.
#[derive(Clone, Debug)]
pub struct BrowserPage {
    page: Arc<Page>,
}

impl PageInteractor for BrowserPage {
    async fn click_nth(&self, selector: &str, index: usize) -> Result<(), CrawlError> {
        let elements = self
            .page
            .find_elements(selector)
            .await
            .map_err(|e| CrawlError::Browser(format!("find {selector} failed: {e}")))?;
        let element = elements.into_iter().nth(index).ok_or_else(|| {
            CrawlError::Browser(format!("no element #{index} matching {selector}"))
        })?;
        element
            .click()
            .await
            .map_err(|e| CrawlError::Browser(format!("click on {selector} failed: {e}")))?;
        Ok(())
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool, CrawlError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn text_first(&self, selector: &str) -> Result<Option<String>, CrawlError> {
        match self.page.find_element(selector).await {
            Ok(element) => element
                .inner_text()
                .await
                .map_err(|e| CrawlError::Browser(format!("inner_text of {selector} failed: {e}"))),
            Err(_) => Ok(None),
        }
    }

    async fn press_escape(&self) -> Result<(), CrawlError> {
        self.page
            .find_element("body")
            .await
            .map_err(|e| CrawlError::Browser(format!("no body element: {e}")))?
            .press_key("Escape")
            .await
            .map_err(|e| CrawlError::Browser(format!("escape failed: {e}")))?;
        Ok(())
    }

    async fn content(&self) -> Result<String, CrawlError> {
        self.page
            .content()
            .await
            .map_err(|e| CrawlError::Browser(format!("failed to read page content: {e}")))
    }
}
