use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CrawlError;
use crate::record::EntityRecord;

/// How a document should be obtained.
///
/// `Static` returns the raw response body; `Rendered` runs the page through a
/// browser engine so client-side scripts have executed before extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Static,
    Rendered,
}

/// A fetched document.
///
/// `page` is `Some` only for rendered fetches: the live browser handle scoped
/// to this navigation, so a later extraction step can still interact with the
/// page (click a "read more", wait for a modal) before the next fetch.
#[derive(Debug, Clone)]
pub struct FetchedDoc<P> {
    /// Final URL after redirects.
    pub url: String,
    /// Document body (rendered DOM for browser fetches).
    pub html: String,
    /// Live page handle, rendered fetches only.
    pub page: Option<P>,
}

impl<P> FetchedDoc<P> {
    /// A document with no live page attached.
    pub fn body(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
            page: None,
        }
    }

    /// Convert into a document typed for a different page handle, dropping
    /// any attached page.
    pub fn without_page<Q>(self) -> FetchedDoc<Q> {
        FetchedDoc {
            url: self.url,
            html: self.html,
            page: None,
        }
    }
}

/// Operations available on a live, already-navigated browser page.
///
/// Extraction code that needs mid-extraction interaction asks for this
/// capability explicitly instead of reaching into the fetch layer.
pub trait PageInteractor: Send + Sync + Clone {
    /// Click the `index`-th element matching `selector`.
    fn click_nth(
        &self,
        selector: &str,
        index: usize,
    ) -> impl Future<Output = Result<(), CrawlError>> + Send;

    /// Poll until `selector` matches or the timeout elapses. Returns whether
    /// the element appeared.
    fn wait_for(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, CrawlError>> + Send;

    /// Inner text of the first element matching `selector`.
    fn text_first(
        &self,
        selector: &str,
    ) -> impl Future<Output = Result<Option<String>, CrawlError>> + Send;

    /// Send Escape to the page (closes modals).
    fn press_escape(&self) -> impl Future<Output = Result<(), CrawlError>> + Send;

    /// Re-read the current DOM.
    fn content(&self) -> impl Future<Output = Result<String, CrawlError>> + Send;
}

/// Page handle for fetchers that never produce a live page. Every operation
/// fails; static documents cannot be interacted with.
#[derive(Debug, Clone, Copy)]
pub struct NoPage;

impl PageInteractor for NoPage {
    async fn click_nth(&self, _selector: &str, _index: usize) -> Result<(), CrawlError> {
        Err(CrawlError::RenderedUnavailable)
    }

    async fn wait_for(&self, _selector: &str, _timeout: Duration) -> Result<bool, CrawlError> {
        Err(CrawlError::RenderedUnavailable)
    }

    async fn text_first(&self, _selector: &str) -> Result<Option<String>, CrawlError> {
        Err(CrawlError::RenderedUnavailable)
    }

    async fn press_escape(&self) -> Result<(), CrawlError> {
        Err(CrawlError::RenderedUnavailable)
    }

    async fn content(&self) -> Result<String, CrawlError> {
        Err(CrawlError::RenderedUnavailable)
    }
}

/// Fetches documents in either mode. The crawl engine is generic over this,
/// so extraction logic never depends on the fetch mechanism.
pub trait Fetcher: Send + Sync + Clone {
    type Page: PageInteractor;

    fn fetch(
        &self,
        url: &str,
        mode: FetchMode,
    ) -> impl Future<Output = Result<FetchedDoc<Self::Page>, CrawlError>> + Send;
}

/// Receives completed records. Sinks have no dedup or validation
/// responsibility; a record handed to a sink is final.
pub trait RecordSink: Send + Sync + Clone {
    fn write(&self, record: &EntityRecord) -> impl Future<Output = Result<(), CrawlError>> + Send;

    fn flush(&self) -> impl Future<Output = Result<(), CrawlError>> + Send {
        async { Ok(()) }
    }
}

/// Sink that discards every record.
#[derive(Debug, Clone, Copy)]
pub struct NullSink;

impl RecordSink for NullSink {
    async fn write(&self, _record: &EntityRecord) -> Result<(), CrawlError> {
        Ok(())
    }
}
