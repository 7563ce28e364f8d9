//! Per-host request pacing.
//!
//! Wraps any [`Fetcher`] with a minimum per-host delay plus jitter, and
//! adapts to the target: an exponentially weighted average of observed
//! response latency raises the effective delay for hosts that answer
//! slowly. Target sites rate-limit aggressively, so pacing is load-bearing,
//! not optional.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use marquee_core::throttle::{ThrottleConfig, ThrottledFetcher};
//! # use marquee_core::traits::{FetchMode, FetchedDoc, Fetcher, NoPage};
//! # #[derive(Clone)] struct MyFetcher;
//! # impl Fetcher for MyFetcher {
//! #     type Page = NoPage;
//! #     async fn fetch(&self, _: &str, _: FetchMode) -> Result<FetchedDoc<NoPage>, marquee_core::CrawlError> { todo!() }
//! # }
//! let config = ThrottleConfig::new(Duration::from_secs(2))
//!     .with_jitter(Duration::from_millis(500));
//! let fetcher = ThrottledFetcher::new(MyFetcher, config);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use url::Url;

use crate::error::CrawlError;
use crate::traits::{FetchMode, FetchedDoc, Fetcher};

/// Configuration for the throttled fetcher.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum delay between consecutive requests to the same host.
    pub delay: Duration,

    /// Maximum random jitter added on top (uniform [0, jitter]).
    /// Randomises request timing to appear more human-like.
    pub jitter: Duration,

    /// Multiplier on the smoothed response latency; the effective delay is
    /// the larger of `delay` and `latency_factor × avg latency`. Zero
    /// disables adaptation.
    pub latency_factor: f64,
}

impl ThrottleConfig {
    /// New config with the given per-host delay, no jitter, no adaptation.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
            latency_factor: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_latency_factor(mut self, factor: f64) -> Self {
        self.latency_factor = factor;
        self
    }

    /// Effective delay for one wait: max(base, adapted latency) + jitter.
    fn effective_delay(&self, avg_latency: Option<Duration>) -> Duration {
        let mut base = self.delay;
        if self.latency_factor > 0.0 {
            if let Some(latency) = avg_latency {
                base = base.max(latency.mul_f64(self.latency_factor));
            }
        }
        if self.jitter.is_zero() {
            return base;
        }
        base + Duration::from_millis(rand_jitter_ms(self.jitter.as_millis() as u64))
    }
}

impl Default for ThrottleConfig {
    /// 2 s delay, 500 ms jitter, 1.5× latency back-off — matches the pacing
    /// the target sites tolerate.
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            jitter: Duration::from_millis(500),
            latency_factor: 1.5,
        }
    }
}

#[derive(Debug, Default)]
struct HostState {
    last_request: Option<Instant>,
    avg_latency: Option<Duration>,
}

impl HostState {
    /// EWMA with α = 0.5: responsive to slowdowns, forgiving of one-offs.
    fn observe(&mut self, latency: Duration) {
        self.avg_latency = Some(match self.avg_latency {
            Some(avg) => (avg + latency) / 2,
            None => latency,
        });
    }
}

/// A [`Fetcher`] wrapper enforcing per-host pacing.
///
/// Tracks the last request time and smoothed latency per host key
/// (scheme + host + port). Thread-safe; the lock is dropped while sleeping
/// so a slow host never blocks requests to other hosts.
#[derive(Clone)]
pub struct ThrottledFetcher<F> {
    inner: F,
    config: ThrottleConfig,
    hosts: Arc<Mutex<HashMap<String, HostState>>>,
}

impl<F: Fetcher> ThrottledFetcher<F> {
    pub fn new(inner: F, config: ThrottleConfig) -> Self {
        Self {
            inner,
            config,
            hosts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Host key for a URL (scheme://host:port).
    fn host_key(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        let host = url.host_str()?;
        let port = url
            .port_or_known_default()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        Some(format!("{}://{}{}", url.scheme(), host, port))
    }

    /// Wait until the per-host delay has elapsed, then record now as the
    /// host's last request time.
    async fn wait_for_host(&self, host: &str) {
        let mut hosts = self.hosts.lock().await;
        let (last, avg) = {
            let state = hosts.entry(host.to_string()).or_default();
            (state.last_request, state.avg_latency)
        };

        if let Some(last) = last {
            let required = self.config.effective_delay(avg);
            let elapsed = last.elapsed();
            if elapsed < required {
                let sleep_duration = required - elapsed;
                // Drop the lock while sleeping so other hosts aren't blocked.
                drop(hosts);
                tracing::debug!(
                    host = %host,
                    sleep_ms = %sleep_duration.as_millis(),
                    "Throttling request"
                );
                tokio::time::sleep(sleep_duration).await;
                let mut hosts = self.hosts.lock().await;
                hosts.entry(host.to_string()).or_default().last_request = Some(Instant::now());
                return;
            }
        }
        hosts.entry(host.to_string()).or_default().last_request = Some(Instant::now());
    }

    async fn observe_latency(&self, host: &str, latency: Duration) {
        let mut hosts = self.hosts.lock().await;
        hosts.entry(host.to_string()).or_default().observe(latency);
    }
}

impl<F: Fetcher> Fetcher for ThrottledFetcher<F> {
    type Page = F::Page;

    async fn fetch(&self, url: &str, mode: FetchMode) -> Result<FetchedDoc<F::Page>, CrawlError> {
        let Some(host) = Self::host_key(url) else {
            return self.inner.fetch(url, mode).await;
        };
        self.wait_for_host(&host).await;
        let started = Instant::now();
        let result = self.inner.fetch(url, mode).await;
        self.observe_latency(&host, started.elapsed()).await;
        result
    }
}

// ---------------------------------------------------------------------------
// Deterministic jitter based on std — avoids pulling in the `rand` crate.
// Uses a simple xorshift seeded from the current time.
// ---------------------------------------------------------------------------

fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    // Seed from high-resolution clock — good enough for jitter, not crypto.
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockFetcher;

    #[test]
    fn host_key_extracts_correctly() {
        assert_eq!(
            ThrottledFetcher::<MockFetcher>::host_key("https://example.com/path?q=1"),
            Some("https://example.com:443".to_string())
        );
        assert_eq!(
            ThrottledFetcher::<MockFetcher>::host_key("http://example.com:8080/page"),
            Some("http://example.com:8080".to_string())
        );
        assert_eq!(ThrottledFetcher::<MockFetcher>::host_key("not-a-url"), None);
    }

    #[test]
    fn effective_delay_without_adaptation() {
        let config = ThrottleConfig::new(Duration::from_secs(1));
        assert_eq!(config.effective_delay(None), Duration::from_secs(1));
        assert_eq!(
            config.effective_delay(Some(Duration::from_secs(10))),
            Duration::from_secs(1),
            "factor 0 ignores latency"
        );
    }

    #[test]
    fn effective_delay_adapts_to_slow_hosts() {
        let config = ThrottleConfig::new(Duration::from_secs(1)).with_latency_factor(2.0);
        // Fast host: base delay wins.
        assert_eq!(
            config.effective_delay(Some(Duration::from_millis(100))),
            Duration::from_secs(1)
        );
        // Slow host: adapted delay wins.
        assert_eq!(
            config.effective_delay(Some(Duration::from_secs(3))),
            Duration::from_secs(6)
        );
    }

    #[test]
    fn effective_delay_with_jitter_is_bounded() {
        let config =
            ThrottleConfig::new(Duration::from_millis(100)).with_jitter(Duration::from_millis(50));
        for _ in 0..100 {
            let d = config.effective_delay(None);
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(150));
        }
    }

    #[test]
    fn latency_ewma_smooths() {
        let mut state = HostState::default();
        state.observe(Duration::from_millis(100));
        assert_eq!(state.avg_latency, Some(Duration::from_millis(100)));
        state.observe(Duration::from_millis(300));
        assert_eq!(state.avg_latency, Some(Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn throttle_enforces_delay_on_same_host() {
        let inner = MockFetcher::new().route("http://example.com/1", "<html>ok</html>").route(
            "http://example.com/2",
            "<html>ok</html>",
        );
        let config = ThrottleConfig::new(Duration::from_millis(100));
        let fetcher = ThrottledFetcher::new(inner, config);

        let start = Instant::now();
        fetcher
            .fetch("http://example.com/1", FetchMode::Static)
            .await
            .unwrap();
        fetcher
            .fetch("http://example.com/2", FetchMode::Static)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(100),
            "second same-host request should wait, elapsed: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn throttle_does_not_delay_different_hosts() {
        let inner = MockFetcher::new()
            .route("http://example.com/1", "<html>ok</html>")
            .route("http://other.com/1", "<html>ok</html>");
        let config = ThrottleConfig::new(Duration::from_millis(200));
        let fetcher = ThrottledFetcher::new(inner, config);

        let start = Instant::now();
        fetcher
            .fetch("http://example.com/1", FetchMode::Static)
            .await
            .unwrap();
        fetcher
            .fetch("http://other.com/1", FetchMode::Static)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(
            elapsed < Duration::from_millis(150),
            "different hosts are independent, elapsed: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn throttle_passes_through_errors() {
        let inner = MockFetcher::new()
            .route_error("http://example.com/", CrawlError::permanent("HTTP 404"));
        let fetcher = ThrottledFetcher::new(inner, ThrottleConfig::new(Duration::ZERO));

        let err = fetcher
            .fetch("http://example.com/", FetchMode::Static)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Fetch { .. }));
    }
}
