//! The multi-stage crawl engine.
//!
//! A single cooperative loop drains a task queue through the stage graph:
//! Listing tasks discover detail links (or match search candidates),
//! Detail tasks extract and emit the parent record, SubResource tasks fetch
//! the dependent pages (reviews, credits, actor bios) keyed by the parent
//! identity. Transient failures are retried up to a cap and then abandoned;
//! nothing a single page does can abort the run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::CrawlError;
use crate::extract;
use crate::profile::{SiteProfile, SpoilerSpec, SubResourceSpec};
use crate::record::EntityKind;
use crate::session::{CrawlSession, CrawlStats};
use crate::task::{CrawlConfig, CrawlTask, Stage};
use crate::traits::{Fetcher, PageInteractor, RecordSink};

/// Ctx key for the lookup title a search task is resolving.
pub const CTX_INPUT_TITLE: &str = "input_title";
/// Ctx key for the lookup year.
pub const CTX_INPUT_YEAR: &str = "input_year";
/// Ctx key naming which sub-resource spec a task belongs to.
pub const CTX_SUBRESOURCE: &str = "subresource";

/// Record field filled with the fetched document URL when declared.
const FIELD_SOURCE_URL: &str = "source_url";

/// Events emitted by the engine for monitoring/logging.
#[derive(Debug, Clone)]
pub enum CrawlEvent<'a> {
    TaskStarted {
        stage: Stage,
        url: &'a str,
    },
    TaskRetried {
        stage: Stage,
        url: &'a str,
        attempt: u32,
        error: &'a str,
    },
    TaskAbandoned {
        stage: Stage,
        url: &'a str,
        error: &'a str,
    },
    DuplicateDropped {
        id: &'a str,
    },
    IdentityMissing {
        url: &'a str,
    },
    LookupUnmatched {
        title: &'a str,
    },
    RecordEmitted {
        entity: EntityKind,
        id: &'a str,
    },
    QuotaReached {
        emitted: u64,
    },
    Finished {
        stats: &'a CrawlStats,
    },
}

/// Trait for receiving crawl events (decoupled logging).
pub trait CrawlReporter: Send + Sync {
    fn report(&self, event: CrawlEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl CrawlReporter for TracingReporter {
    fn report(&self, event: CrawlEvent<'_>) {
        match event {
            CrawlEvent::TaskStarted { stage, url } => {
                tracing::debug!(%stage, %url, "Processing task");
            }
            CrawlEvent::TaskRetried {
                stage,
                url,
                attempt,
                error,
            } => {
                tracing::info!(%stage, %url, %attempt, %error, "Retrying task");
            }
            CrawlEvent::TaskAbandoned { stage, url, error } => {
                tracing::warn!(%stage, %url, %error, "Task abandoned");
            }
            CrawlEvent::DuplicateDropped { id } => {
                tracing::debug!(%id, "Duplicate identity dropped");
            }
            CrawlEvent::IdentityMissing { url } => {
                tracing::warn!(%url, "No resolvable identity, dropping");
            }
            CrawlEvent::LookupUnmatched { title } => {
                tracing::warn!(%title, "Search returned no candidates");
            }
            CrawlEvent::RecordEmitted { entity, id } => {
                tracing::info!(%entity, %id, "Record emitted");
            }
            CrawlEvent::QuotaReached { emitted } => {
                tracing::info!(%emitted, "Item quota reached, draining dependent tasks");
            }
            CrawlEvent::Finished { stats } => {
                tracing::info!(
                    records = stats.records_emitted,
                    parents = stats.parents_emitted,
                    duplicates = stats.duplicates_dropped,
                    missing_identity = stats.identity_missing,
                    unmatched = stats.lookup_unmatched,
                    abandoned = stats.tasks_abandoned,
                    "Crawl finished"
                );
            }
        }
    }
}

/// Crawl engine generic over the fetch mechanism and the record sink.
pub struct CrawlEngine<F, S>
where
    F: Fetcher,
    S: RecordSink,
{
    fetcher: F,
    sink: S,
    profile: SiteProfile,
    config: CrawlConfig,
    session: Arc<CrawlSession>,
    queue: VecDeque<CrawlTask>,
}

impl<F, S> CrawlEngine<F, S>
where
    F: Fetcher,
    S: RecordSink,
{
    pub fn new(fetcher: F, sink: S, profile: SiteProfile, config: CrawlConfig) -> Self {
        let session = Arc::new(CrawlSession::new(config.max_items));
        Self {
            fetcher,
            sink,
            profile,
            config,
            session,
            queue: VecDeque::new(),
        }
    }

    /// Shared session handle (ledger, counters) for external inspection.
    pub fn session(&self) -> Arc<CrawlSession> {
        Arc::clone(&self.session)
    }

    pub fn enqueue(&mut self, task: CrawlTask) {
        self.queue.push_back(task);
    }

    /// Seed one Listing task per page of the configured year window.
    pub fn seed_listing(
        &mut self,
        year_min: i32,
        year_max: i32,
        pages: u32,
    ) -> Result<(), CrawlError> {
        for page in 1..=pages {
            let url = self.profile.listing_url(page, year_min, year_max)?;
            self.queue.push_back(CrawlTask::new(Stage::Listing, url));
        }
        Ok(())
    }

    /// Seed a search task for one `{title, year}` lookup target.
    pub fn seed_lookup(&mut self, title: &str, year: Option<i32>) -> Result<(), CrawlError> {
        let url = self.profile.search_url(title)?;
        let mut task = CrawlTask::new(Stage::Listing, url).with_ctx(CTX_INPUT_TITLE, title);
        if let Some(year) = year {
            task = task.with_ctx(CTX_INPUT_YEAR, year.to_string());
        }
        self.queue.push_back(task);
        Ok(())
    }

    /// Run until the queue drains, the quota gate closes everything down,
    /// or the token is cancelled. Always returns the run's stats; single
    /// bad pages surface as counters and warnings, not errors.
    pub async fn run<R: CrawlReporter>(
        &mut self,
        cancel: CancellationToken,
        reporter: &R,
    ) -> Result<CrawlStats, CrawlError> {
        while let Some(task) = self.next_task() {
            if cancel.is_cancelled() {
                tracing::info!("Cancellation requested, stopping crawl");
                break;
            }

            reporter.report(CrawlEvent::TaskStarted {
                stage: task.stage,
                url: &task.url,
            });

            match self.process(&task, reporter).await {
                Ok(children) => {
                    for child in children {
                        self.queue.push_back(child);
                    }
                }
                Err(CrawlError::MissingIdentity { url }) => {
                    self.session.note_identity_missing();
                    reporter.report(CrawlEvent::IdentityMissing { url: &url });
                }
                Err(e) if e.is_transient() && task.can_retry(self.config.retry_cap) => {
                    reporter.report(CrawlEvent::TaskRetried {
                        stage: task.stage,
                        url: &task.url,
                        attempt: task.attempt + 1,
                        error: &e.to_string(),
                    });
                    self.queue.push_back(task.retry());
                }
                Err(e) => {
                    self.session.note_abandoned();
                    reporter.report(CrawlEvent::TaskAbandoned {
                        stage: task.stage,
                        url: &task.url,
                        error: &e.to_string(),
                    });
                }
            }
        }

        self.sink.flush().await?;
        let stats = self.session.stats();
        reporter.report(CrawlEvent::Finished { stats: &stats });
        Ok(stats)
    }

    /// Next admissible task. Once the quota is reached no new Listing or
    /// Detail work is admitted; queued SubResource tasks drain so dependents
    /// of already-emitted parents still complete.
    fn next_task(&mut self) -> Option<CrawlTask> {
        while let Some(task) = self.queue.pop_front() {
            if self.session.quota_reached() && task.stage != Stage::SubResource {
                self.session.note_quota_skipped();
                continue;
            }
            return Some(task);
        }
        None
    }

    async fn process<R: CrawlReporter>(
        &self,
        task: &CrawlTask,
        reporter: &R,
    ) -> Result<Vec<CrawlTask>, CrawlError> {
        match task.stage {
            Stage::Listing => self.process_listing(task, reporter).await,
            Stage::Detail => self.process_detail(task, reporter).await,
            Stage::SubResource => self.process_subresource(task, reporter).await,
        }
    }

    /// Listing pages come in two shapes: a paginated browse page yielding
    /// every detail link that passes the filters, or a search-results page
    /// (lookup flow) yielding exactly one best-matched detail link.
    async fn process_listing<R: CrawlReporter>(
        &self,
        task: &CrawlTask,
        reporter: &R,
    ) -> Result<Vec<CrawlTask>, CrawlError> {
        if let Some(title) = task.ctx.get(CTX_INPUT_TITLE) {
            let search = self.profile.search.as_ref().ok_or_else(|| {
                CrawlError::Profile(format!("profile {} has no search flow", self.profile.name))
            })?;
            let doc = self.fetcher.fetch(&task.url, search.fetch_mode).await?;
            let candidates = extract::search_candidates(&doc.html, &search.candidate_selector);
            if candidates.is_empty() {
                self.session.note_lookup_unmatched();
                reporter.report(CrawlEvent::LookupUnmatched { title });
                return Ok(Vec::new());
            }
            let year = task.ctx.get(CTX_INPUT_YEAR).map(String::as_str);
            let Some(best) = extract::pick_candidate(&candidates, year, search.match_policy)
            else {
                return Ok(Vec::new());
            };
            let url = join_url(&doc.url, &best.href)?;
            return Ok(vec![
                CrawlTask::new(Stage::Detail, url).with_context(task.ctx.clone()),
            ]);
        }

        let listing = self.profile.listing.as_ref().ok_or_else(|| {
            CrawlError::Profile(format!("profile {} has no listing flow", self.profile.name))
        })?;
        let doc = self.fetcher.fetch(&task.url, listing.fetch_mode).await?;

        // Rendered listings may hide entries behind a "load more" button;
        // click it a bounded number of times, then re-read the DOM.
        let mut html = doc.html;
        if let (Some(lm), Some(page)) = (&listing.load_more, &doc.page) {
            for _ in 0..lm.max_clicks {
                if page.click_nth(&lm.selector, 0).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(lm.pause_ms)).await;
            }
            if let Ok(fresh) = page.content().await {
                html = fresh;
            }
        }

        let mut children = Vec::new();
        for href in extract::listing_links(&html, listing) {
            let url = match join_url(&doc.url, &href) {
                Ok(u) => u,
                Err(_) => {
                    tracing::debug!(%href, "Skipping unjoinable listing link");
                    continue;
                }
            };
            if !self.domain_allowed(&url) {
                continue;
            }
            children.push(CrawlTask::new(Stage::Detail, url));
        }
        Ok(children)
    }

    /// Detail pages produce the parent record. The record is emitted before
    /// any dependent task is scheduled, so a sub-resource failure can only
    /// ever degrade — never lose — the parent.
    async fn process_detail<R: CrawlReporter>(
        &self,
        task: &CrawlTask,
        reporter: &R,
    ) -> Result<Vec<CrawlTask>, CrawlError> {
        let detail = &self.profile.detail;
        let doc = self.fetcher.fetch(&task.url, detail.fetch_mode).await?;

        let id = extract::identity_from_url(&doc.url, &detail.identity)
            .or_else(|| extract::identity_from_url(&task.url, &detail.identity))
            .ok_or_else(|| CrawlError::MissingIdentity {
                url: task.url.clone(),
            })?;

        // First discovery wins; the same entity reached via another link is
        // dropped silently here.
        if !self.session.claim(&id) {
            self.session.note_duplicate();
            reporter.report(CrawlEvent::DuplicateDropped { id: &id });
            return Ok(Vec::new());
        }

        let mut record =
            extract::extract_entity(&doc.html, detail.entity, &detail.fields, detail.label_rows.as_ref());
        record.set(&detail.identity_field, Value::String(id.clone()));
        record.fill_missing(FIELD_SOURCE_URL, &doc.url);
        for (key, value) in &task.ctx {
            record.fill_missing(key, value);
        }

        self.sink.write(&record).await?;
        let emitted = self.session.record_parent_emitted();
        reporter.report(CrawlEvent::RecordEmitted {
            entity: detail.entity,
            id: &id,
        });
        if self.session.quota() == Some(emitted) {
            reporter.report(CrawlEvent::QuotaReached { emitted });
        }

        // Dependents are scheduled only after the parent record is out.
        let mut children = Vec::new();
        for sub in &self.profile.subresources {
            if let Some(template) = &sub.url_template {
                let url = template.replace("{id}", &id);
                children.push(self.subresource_task(task, sub, &id, url));
            }
            if let Some(rule) = &sub.links {
                for href in extract::rule_links(&doc.html, rule) {
                    match join_url(&doc.url, &href) {
                        Ok(url) => children.push(self.subresource_task(task, sub, &id, url)),
                        Err(_) => tracing::debug!(%href, "Skipping unjoinable sub-resource link"),
                    }
                }
            }
        }
        Ok(children)
    }

    fn subresource_task(
        &self,
        parent: &CrawlTask,
        sub: &SubResourceSpec,
        id: &str,
        url: String,
    ) -> CrawlTask {
        CrawlTask::new(Stage::SubResource, url)
            .with_context(parent.ctx.clone())
            .with_ctx(self.profile.detail.identity_field.clone(), id)
            .with_ctx(CTX_SUBRESOURCE, sub.name.clone())
    }

    /// Sub-resource pages emit per-item records correlated to the parent by
    /// its identity. Spoiler-gated fields are resolved through the live page
    /// when one is available; otherwise they stay null.
    async fn process_subresource<R: CrawlReporter>(
        &self,
        task: &CrawlTask,
        reporter: &R,
    ) -> Result<Vec<CrawlTask>, CrawlError> {
        let name = task.ctx.get(CTX_SUBRESOURCE).cloned().unwrap_or_default();
        let sub = self.profile.subresource(&name).ok_or_else(|| {
            CrawlError::Profile(format!("unknown sub-resource {name} in task context"))
        })?;
        let doc = self.fetcher.fetch(&task.url, sub.fetch_mode).await?;

        let drafts = extract::extract_items(&doc.html, sub);
        let mut spoiler_index = 0usize;
        for draft in drafts {
            let mut record = draft.record;

            if draft.needs_interaction {
                let index = spoiler_index;
                spoiler_index += 1;
                if let (Some(sp), Some(page)) = (&sub.spoiler, doc.page.as_ref()) {
                    match reveal_spoiler(page, sp, index).await {
                        Ok(Some(text)) => record.set(&sp.field, Value::String(text)),
                        Ok(None) => {
                            tracing::debug!(url = %task.url, "Spoiler modal never appeared")
                        }
                        Err(e) => {
                            tracing::debug!(url = %task.url, error = %e, "Spoiler reveal failed")
                        }
                    }
                }
            }

            for (key, value) in &task.ctx {
                if key != CTX_SUBRESOURCE {
                    record.fill_missing(key, value);
                }
            }

            let identity_field = &self.profile.detail.identity_field;
            let Some(id) = record.identity(identity_field).map(str::to_string) else {
                self.session.note_identity_missing();
                reporter.report(CrawlEvent::IdentityMissing { url: &task.url });
                continue;
            };

            self.sink.write(&record).await?;
            self.session.record_emitted();
            reporter.report(CrawlEvent::RecordEmitted {
                entity: sub.entity,
                id: &id,
            });
        }
        Ok(Vec::new())
    }

    fn domain_allowed(&self, url: &str) -> bool {
        if self.profile.allowed_domains.is_empty() {
            return true;
        }
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        self.profile
            .allowed_domains
            .iter()
            .any(|d| host == d || host.ends_with(&format!(".{d}")))
    }
}

/// Click the Nth "read more", wait for the modal, read its text, close it.
/// Every failure path degrades to `None`/error at the call site — gated text
/// is optional data.
async fn reveal_spoiler<P: PageInteractor>(
    page: &P,
    spec: &SpoilerSpec,
    index: usize,
) -> Result<Option<String>, CrawlError> {
    page.click_nth(&spec.read_more_selector, index).await?;
    let appeared = page
        .wait_for(&spec.modal_selector, Duration::from_millis(spec.modal_wait_ms))
        .await?;
    if !appeared {
        return Ok(None);
    }
    let text = page.text_first(&spec.modal_text_selector).await?;
    page.press_escape().await?;
    Ok(text.map(|t| extract::collapse_ws(&t)))
}

fn join_url(base: &str, href: &str) -> Result<String, CrawlError> {
    let base = Url::parse(base)
        .map_err(|e| CrawlError::Profile(format!("invalid base url {base}: {e}")))?;
    let joined = base
        .join(href)
        .map_err(|e| CrawlError::Profile(format!("cannot join {href} onto {base}: {e}")))?;
    Ok(joined.to_string())
}
