//! Test utilities: mock implementations of the core traits plus fixture
//! profiles.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks use
//! `Arc<Mutex<_>>` for interior mutability, allowing test assertions on
//! recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use crate::error::CrawlError;
use crate::profile::SiteProfile;
use crate::record::EntityRecord;
use crate::traits::{FetchMode, FetchedDoc, Fetcher, PageInteractor, RecordSink};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher with per-URL scripted responses.
///
/// Each URL holds a queue of responses consumed front to back (so a retry
/// test can script an error followed by a success); a drained queue serves
/// a default document. Unrouted URLs fail permanently. Every call is
/// recorded with its fetch mode.
#[derive(Clone, Default)]
pub struct MockFetcher {
    routes: Arc<Mutex<HashMap<String, VecDeque<Result<String, CrawlError>>>>>,
    page: Option<MockPage>,
    pub fetched: Arc<Mutex<Vec<(String, FetchMode)>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: &str, html: &str) -> Self {
        self.push_response(url, Ok(html.to_string()));
        self
    }

    pub fn route_error(self, url: &str, error: CrawlError) -> Self {
        self.push_response(url, Err(error));
        self
    }

    /// Page handle attached to every rendered fetch.
    pub fn with_page(mut self, page: MockPage) -> Self {
        self.page = Some(page);
        self
    }

    fn push_response(&self, url: &str, response: Result<String, CrawlError>) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    /// Number of fetches issued for URLs containing `fragment`.
    pub fn fetch_count(&self, fragment: &str) -> usize {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .filter(|(url, _)| url.contains(fragment))
            .count()
    }
}

impl Fetcher for MockFetcher {
    type Page = MockPage;

    async fn fetch(&self, url: &str, mode: FetchMode) -> Result<FetchedDoc<MockPage>, CrawlError> {
        self.fetched.lock().unwrap().push((url.to_string(), mode));

        let response = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(url) {
                Some(queue) => queue
                    .pop_front()
                    .unwrap_or_else(|| Ok("<html><body>default</body></html>".to_string())),
                None => Err(CrawlError::permanent(format!("no mock route for {url}"))),
            }
        };

        let html = response?;
        let page = if mode == FetchMode::Rendered {
            self.page.clone()
        } else {
            None
        };
        Ok(FetchedDoc {
            url: url.to_string(),
            html,
            page,
        })
    }
}

// ---------------------------------------------------------------------------
// MockPage
// ---------------------------------------------------------------------------

/// Mock live-page handle recording interactions.
#[derive(Clone, Default, Debug)]
pub struct MockPage {
    pub clicks: Arc<Mutex<Vec<(String, usize)>>>,
    pub escapes: Arc<Mutex<u32>>,
    modal_text: Arc<Mutex<Option<String>>>,
    refreshed_content: Arc<Mutex<Option<String>>>,
    wait_succeeds: Arc<Mutex<bool>>,
}

impl MockPage {
    pub fn new() -> Self {
        let page = Self::default();
        *page.wait_succeeds.lock().unwrap() = true;
        page
    }

    /// Text every `text_first` call returns (the revealed modal).
    pub fn with_modal_text(self, text: &str) -> Self {
        *self.modal_text.lock().unwrap() = Some(text.to_string());
        self
    }

    /// DOM returned by `content()` after interactions.
    pub fn with_refreshed_content(self, html: &str) -> Self {
        *self.refreshed_content.lock().unwrap() = Some(html.to_string());
        self
    }

    /// Make every `wait_for` time out.
    pub fn with_wait_timeout(self) -> Self {
        *self.wait_succeeds.lock().unwrap() = false;
        self
    }
}

impl PageInteractor for MockPage {
    async fn click_nth(&self, selector: &str, index: usize) -> Result<(), CrawlError> {
        self.clicks
            .lock()
            .unwrap()
            .push((selector.to_string(), index));
        Ok(())
    }

    async fn wait_for(&self, _selector: &str, _timeout: Duration) -> Result<bool, CrawlError> {
        Ok(*self.wait_succeeds.lock().unwrap())
    }

    async fn text_first(&self, _selector: &str) -> Result<Option<String>, CrawlError> {
        Ok(self.modal_text.lock().unwrap().clone())
    }

    async fn press_escape(&self) -> Result<(), CrawlError> {
        *self.escapes.lock().unwrap() += 1;
        Ok(())
    }

    async fn content(&self) -> Result<String, CrawlError> {
        self.refreshed_content
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CrawlError::Browser("no refreshed content scripted".into()))
    }
}

// ---------------------------------------------------------------------------
// MockSink
// ---------------------------------------------------------------------------

/// Sink that records every written record, in emission order.
#[derive(Clone, Default)]
pub struct MockSink {
    pub records: Arc<Mutex<Vec<EntityRecord>>>,
    write_error: Arc<Mutex<Option<CrawlError>>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose first write fails.
    pub fn with_write_error(error: CrawlError) -> Self {
        let sink = Self::default();
        *sink.write_error.lock().unwrap() = Some(error);
        sink
    }

    pub fn emitted(&self) -> Vec<EntityRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl RecordSink for MockSink {
    async fn write(&self, record: &EntityRecord) -> Result<(), CrawlError> {
        if let Some(e) = self.write_error.lock().unwrap().take() {
            return Err(e);
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Crawl reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl crate::engine::CrawlReporter for MockReporter {
    fn report(&self, event: crate::engine::CrawlEvent<'_>) {
        let label = match &event {
            crate::engine::CrawlEvent::TaskStarted { .. } => "TaskStarted",
            crate::engine::CrawlEvent::TaskRetried { .. } => "TaskRetried",
            crate::engine::CrawlEvent::TaskAbandoned { .. } => "TaskAbandoned",
            crate::engine::CrawlEvent::DuplicateDropped { .. } => "DuplicateDropped",
            crate::engine::CrawlEvent::IdentityMissing { .. } => "IdentityMissing",
            crate::engine::CrawlEvent::LookupUnmatched { .. } => "LookupUnmatched",
            crate::engine::CrawlEvent::RecordEmitted { .. } => "RecordEmitted",
            crate::engine::CrawlEvent::QuotaReached { .. } => "QuotaReached",
            crate::engine::CrawlEvent::Finished { .. } => "Finished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Fixture profiles
// ---------------------------------------------------------------------------

/// Listing-crawl profile: movie details plus a reviews sub-resource with a
/// spoiler-reveal interaction.
pub fn movie_profile() -> SiteProfile {
    serde_json::from_value(json!({
        "name": "example-movies",
        "allowed_domains": ["example.com"],
        "listing": {
            "url_template": "https://example.com/browse/?min={year_min}&max={year_max}&page={page}",
            "link_selector": "a[href*=\"/title/\"]",
            "link_contains": ["/title/"],
            "link_excludes": ["/browse/"]
        },
        "detail": {
            "entity": "movie",
            "identity": { "rule": "path_token", "prefix": "tt" },
            "identity_field": "movie_id",
            "fields": [
                { "name": "title", "sources": [{ "source": "css", "selector": "h1" }] },
                { "name": "genres", "sources": [
                    { "source": "json_ld", "path": ["genre"] },
                    { "source": "css_all", "selector": ".genre" }
                ] },
                { "name": "rating", "sources": [
                    { "source": "json_ld", "path": ["aggregateRating", "ratingValue"] }
                ] },
                { "name": "duration", "sources": [
                    { "source": "css", "selector": ".runtime", "transform": "runtime_minutes" }
                ] },
                { "name": "source_url" }
            ]
        },
        "subresources": [
            {
                "name": "user_reviews",
                "entity": "review",
                "url_template": "https://example.com/title/{id}/reviews/",
                "item_selector": "div.review",
                "max_items": 20,
                "fields": [
                    { "name": "movie_id" },
                    { "name": "user_name", "sources": [{ "source": "css", "selector": "a.user" }] },
                    { "name": "review_score", "sources": [{ "source": "css", "selector": "span.score" }] },
                    { "name": "review_text", "sources": [{ "source": "css", "selector": "div.quote" }] }
                ],
                "spoiler": {
                    "field": "review_text",
                    "marker": "[SPOILER ALERT: This review contains spoilers.]",
                    "read_more_selector": "button.read-more",
                    "modal_selector": "div.modal",
                    "modal_text_selector": "div.modal-text"
                },
                "fetch_mode": "rendered"
            }
        ]
    }))
    .expect("fixture profile is valid")
}

/// Lookup profile: title search → sales detail with label rows and
/// page-text grosses → credits sub-resource.
pub fn lookup_profile() -> SiteProfile {
    serde_json::from_value(json!({
        "name": "example-sales",
        "allowed_domains": ["example.com"],
        "search": {
            "url_template": "https://example.com/search/?q={query}",
            "candidate_selector": "a[href^=\"/title/tt\"]"
        },
        "detail": {
            "entity": "sales",
            "identity": { "rule": "path_token", "prefix": "tt" },
            "identity_field": "movie_id",
            "label_rows": {
                "row_selector": "table tr",
                "fallback_row_selector": "div.spec-row"
            },
            "fields": [
                { "name": "input_title" },
                { "name": "input_year" },
                { "name": "bom_title", "sources": [{ "source": "css", "selector": "h1" }] },
                { "name": "gross_domestic", "sources": [{ "source": "page_money", "label": "Domestic" }] },
                { "name": "gross_international", "sources": [{ "source": "page_money", "label": "International" }] },
                { "name": "gross_worldwide", "sources": [{ "source": "page_money", "label": "Worldwide" }] },
                { "name": "opening_weekend", "sources": [
                    { "source": "label", "name": "Domestic Opening", "transform": "money" }
                ] },
                { "name": "release_date", "sources": [
                    { "source": "label", "name": "Release Date" },
                    { "source": "label", "name": "Earliest Release Date" }
                ] },
                { "name": "runtime_minutes", "sources": [
                    { "source": "label", "name": "Running Time", "transform": "runtime_minutes" }
                ] },
                { "name": "source_url" }
            ]
        },
        "subresources": [
            {
                "name": "credits",
                "entity": "credit",
                "url_template": "https://example.com/title/{id}/credits/",
                "item_selector": "table.credits tr",
                "fields": [
                    { "name": "movie_id" },
                    { "name": "name", "sources": [{ "source": "css", "selector": "td:nth-child(1)" }] },
                    { "name": "role", "sources": [{ "source": "css", "selector": "td:nth-child(2)" }] }
                ],
                "require_fields": ["name", "role"]
            }
        ]
    }))
    .expect("fixture profile is valid")
}
