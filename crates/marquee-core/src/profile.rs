//! Per-site crawl configuration.
//!
//! A profile holds everything site-specific — URL templates, CSS selectors,
//! field rules, interaction details — so one generic engine crawls every
//! site. Profiles are JSON files; selector strings are data, not code.

use std::collections::BTreeMap;
use std::path::Path;

use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::error::CrawlError;
use crate::record::EntityKind;
use crate::traits::FetchMode;

fn default_fetch_mode() -> FetchMode {
    FetchMode::Static
}

fn default_href() -> String {
    "href".to_string()
}

fn default_row_selector() -> String {
    "table tr".to_string()
}

fn default_modal_wait_ms() -> u64 {
    3000
}

/// Site profile: one per target site, driving the whole stage graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteProfile {
    pub name: String,
    /// Discovered links outside these domains are ignored. Empty = allow all.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Extra request headers the fetcher should send for this site.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Paginated listing discovery; absent for lookup-only profiles.
    #[serde(default)]
    pub listing: Option<ListingSpec>,
    /// Title search flow; absent for listing-only profiles.
    #[serde(default)]
    pub search: Option<SearchSpec>,
    pub detail: DetailSpec,
    #[serde(default)]
    pub subresources: Vec<SubResourceSpec>,
}

/// Paginated listing pages, seeded up front from a year range and page count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSpec {
    /// Template with `{page}`, `{year_min}`, `{year_max}` placeholders.
    pub url_template: String,
    /// Anchors whose href points at detail pages.
    pub link_selector: String,
    /// Href must contain every one of these substrings.
    #[serde(default)]
    pub link_contains: Vec<String>,
    /// Href must contain none of these substrings.
    #[serde(default)]
    pub link_excludes: Vec<String>,
    #[serde(default = "default_fetch_mode")]
    pub fetch_mode: FetchMode,
    /// Optional "load more" interaction on rendered listings.
    #[serde(default)]
    pub load_more: Option<LoadMoreSpec>,
}

/// Bounded load-more clicking; the pause keeps the site from flagging the
/// session as abusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadMoreSpec {
    pub selector: String,
    pub max_clicks: u32,
    pub pause_ms: u64,
}

/// Search-results flow for `{title, year}` lookup targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSpec {
    /// Template with a `{query}` placeholder (URL-encoded title).
    pub url_template: String,
    /// Anchors linking candidate detail pages.
    pub candidate_selector: String,
    #[serde(default)]
    pub match_policy: MatchPolicy,
    #[serde(default = "default_fetch_mode")]
    pub fetch_mode: FetchMode,
}

/// How a lookup target is matched against several search candidates.
/// Year-first is a best-effort heuristic, not a correctness guarantee, so it
/// stays configurable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Candidate whose surrounding text contains `(year)` wins; otherwise
    /// the first listed candidate.
    #[default]
    YearThenFirst,
    /// Always take the first listed candidate.
    FirstListed,
}

/// Entity detail page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailSpec {
    pub entity: EntityKind,
    pub identity: IdentityRule,
    /// Record field the identity lands in (and the ctx key children inherit).
    pub identity_field: String,
    pub fields: Vec<FieldSpec>,
    #[serde(default = "default_fetch_mode")]
    pub fetch_mode: FetchMode,
    /// Enables `label` sources: a label→value map scraped from table or
    /// flex rows.
    #[serde(default)]
    pub label_rows: Option<LabelRowsSpec>,
}

/// How an entity identity is pulled out of a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum IdentityRule {
    /// First path segment that is `prefix` followed by digits
    /// (e.g. `tt` → `tt32642706`).
    PathToken { prefix: String },
    /// Last non-empty path segment (slug-style ids).
    LastSegment,
}

/// Label→value row scraping. Primary selector finds table rows (first cell
/// label, second cell value); the fallback covers label/value span pairs in
/// flex rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelRowsSpec {
    #[serde(default = "default_row_selector")]
    pub row_selector: String,
    #[serde(default)]
    pub fallback_row_selector: Option<String>,
}

/// One record field with its ordered fallback sources. The first source
/// producing a non-empty value wins; none ⇒ the field is an explicit null.
/// An empty source list declares a field filled from task context only
/// (e.g. `movie_id` on review records).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
}

/// Where a field value comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Joined text of the first element matching the selector.
    Css {
        selector: String,
        #[serde(default)]
        transform: Transform,
    },
    /// Text of every match: trimmed, deduplicated (set semantics — original
    /// order is not preserved), emitted as a list.
    CssAll {
        selector: String,
        #[serde(default)]
        transform: Transform,
    },
    /// Attribute of the first element matching the selector.
    Attr {
        selector: String,
        attr: String,
        #[serde(default)]
        transform: Transform,
    },
    /// Path into an embedded `application/ld+json` block. Listed before
    /// markup selectors for fields whose visual markup is populated by
    /// client-side script.
    JsonLd {
        path: Vec<String>,
        #[serde(default)]
        transform: Transform,
    },
    /// Value from the label→value row map (requires `label_rows`).
    Label {
        name: String,
        #[serde(default)]
        transform: Transform,
    },
    /// Money amount scanned from the whole visible page text after `label`,
    /// tolerating a `(NN.N%)` share between label and amount.
    PageMoney { label: String },
}

impl SourceSpec {
    fn selector(&self) -> Option<&str> {
        match self {
            SourceSpec::Css { selector, .. }
            | SourceSpec::CssAll { selector, .. }
            | SourceSpec::Attr { selector, .. } => Some(selector),
            _ => None,
        }
    }
}

/// Normalization applied to a raw extracted string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    /// Collapse whitespace; empty ⇒ null.
    #[default]
    Text,
    /// `$` + grouped digits ⇒ integer dollars; `N/A`/empty ⇒ null.
    Money,
    /// `N hr` / `N min` components ⇒ total minutes; neither ⇒ null.
    RuntimeMinutes,
    /// Drop a leading "By "/"by ", then collapse whitespace.
    StripByPrefix,
}

/// A dependent page fetched per parent entity, keyed by its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubResourceSpec {
    pub name: String,
    pub entity: EntityKind,
    /// Template with an `{id}` placeholder (reviews, credits pages).
    #[serde(default)]
    pub url_template: Option<String>,
    /// Or: links discovered on the parent detail page (actor bios).
    #[serde(default)]
    pub links: Option<LinkRule>,
    /// Container selector for per-item records; absent = whole page is one
    /// item.
    #[serde(default)]
    pub item_selector: Option<String>,
    #[serde(default)]
    pub max_items: Option<usize>,
    pub fields: Vec<FieldSpec>,
    /// Items where any of these fields stayed null are discarded (e.g.
    /// credits rows missing a name or a role).
    #[serde(default)]
    pub require_fields: Vec<String>,
    /// Spoiler-gated text needing live browser interaction to reveal.
    #[serde(default)]
    pub spoiler: Option<SpoilerSpec>,
    #[serde(default = "default_fetch_mode")]
    pub fetch_mode: FetchMode,
}

/// Link discovery on the parent document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRule {
    pub selector: String,
    #[serde(default = "default_href")]
    pub attr: String,
    #[serde(default)]
    pub max: Option<usize>,
}

/// Reveal flow for text hidden behind a "Read More" interstitial: click the
/// Nth button, wait for the modal, read its text, press Escape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoilerSpec {
    /// Field whose extracted value marks the item as gated.
    pub field: String,
    /// Marker substring identifying a gated item.
    pub marker: String,
    pub read_more_selector: String,
    pub modal_selector: String,
    pub modal_text_selector: String,
    #[serde(default = "default_modal_wait_ms")]
    pub modal_wait_ms: u64,
}

impl SiteProfile {
    /// Load and validate a profile from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, CrawlError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CrawlError::Profile(format!("failed to read profile {}: {e}", path.display()))
        })?;
        let profile: SiteProfile = serde_json::from_str(&raw).map_err(|e| {
            CrawlError::Profile(format!("invalid JSON in profile {}: {e}", path.display()))
        })?;
        profile.validate()?;
        Ok(profile)
    }

    /// Check every selector parses and every template carries its
    /// placeholders, so failures surface at startup instead of mid-crawl.
    pub fn validate(&self) -> Result<(), CrawlError> {
        let mut selectors: Vec<&str> = Vec::new();

        if let Some(listing) = &self.listing {
            if !listing.url_template.contains("{page}") {
                return Err(CrawlError::Profile(format!(
                    "listing url_template for {} lacks a {{page}} placeholder",
                    self.name
                )));
            }
            selectors.push(&listing.link_selector);
            if let Some(lm) = &listing.load_more {
                selectors.push(&lm.selector);
            }
        }

        if let Some(search) = &self.search {
            if !search.url_template.contains("{query}") {
                return Err(CrawlError::Profile(format!(
                    "search url_template for {} lacks a {{query}} placeholder",
                    self.name
                )));
            }
            selectors.push(&search.candidate_selector);
        }

        if self.listing.is_none() && self.search.is_none() {
            return Err(CrawlError::Profile(format!(
                "profile {} declares neither a listing nor a search flow",
                self.name
            )));
        }

        for field in &self.detail.fields {
            selectors.extend(field.sources.iter().filter_map(SourceSpec::selector));
        }
        if let Some(rows) = &self.detail.label_rows {
            selectors.push(&rows.row_selector);
            if let Some(fb) = &rows.fallback_row_selector {
                selectors.push(fb);
            }
        }

        for sub in &self.subresources {
            if sub.url_template.is_none() && sub.links.is_none() {
                return Err(CrawlError::Profile(format!(
                    "subresource {} has neither a url_template nor a link rule",
                    sub.name
                )));
            }
            if let Some(tpl) = &sub.url_template {
                if !tpl.contains("{id}") {
                    return Err(CrawlError::Profile(format!(
                        "subresource {} url_template lacks an {{id}} placeholder",
                        sub.name
                    )));
                }
            }
            if let Some(links) = &sub.links {
                selectors.push(&links.selector);
            }
            if let Some(sel) = &sub.item_selector {
                selectors.push(sel);
            }
            for field in &sub.fields {
                selectors.extend(field.sources.iter().filter_map(SourceSpec::selector));
            }
            if let Some(sp) = &sub.spoiler {
                selectors.push(&sp.read_more_selector);
                selectors.push(&sp.modal_selector);
                selectors.push(&sp.modal_text_selector);
            }
        }

        for sel in selectors {
            Selector::parse(sel).map_err(|_| CrawlError::Selector(sel.to_string()))?;
        }
        Ok(())
    }

    /// Fill a listing URL for one page of the configured year window.
    pub fn listing_url(&self, page: u32, year_min: i32, year_max: i32) -> Result<String, CrawlError> {
        let listing = self
            .listing
            .as_ref()
            .ok_or_else(|| CrawlError::Profile(format!("profile {} has no listing flow", self.name)))?;
        Ok(listing
            .url_template
            .replace("{page}", &page.to_string())
            .replace("{year_min}", &year_min.to_string())
            .replace("{year_max}", &year_max.to_string()))
    }

    /// Fill a search URL for a lookup title.
    pub fn search_url(&self, title: &str) -> Result<String, CrawlError> {
        let search = self
            .search
            .as_ref()
            .ok_or_else(|| CrawlError::Profile(format!("profile {} has no search flow", self.name)))?;
        let query: String = url::form_urlencoded::byte_serialize(title.as_bytes()).collect();
        Ok(search.url_template.replace("{query}", &query))
    }

    pub fn subresource(&self, name: &str) -> Option<&SubResourceSpec> {
        self.subresources.iter().find(|s| s.name == name)
    }

    /// True if any stage of this profile needs a browser.
    pub fn uses_rendered(&self) -> bool {
        let listing = self
            .listing
            .as_ref()
            .is_some_and(|l| l.fetch_mode == FetchMode::Rendered);
        let search = self
            .search
            .as_ref()
            .is_some_and(|s| s.fetch_mode == FetchMode::Rendered);
        listing
            || search
            || self.detail.fetch_mode == FetchMode::Rendered
            || self
                .subresources
                .iter()
                .any(|s| s.fetch_mode == FetchMode::Rendered)
    }

    /// Union of declared field names for an entity kind, identity first,
    /// then declaration order across the detail spec and every sub-resource.
    /// This is the sink schema: every emitted key, nulls for absent data.
    pub fn declared_fields(&self, entity: EntityKind) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |name: &str, out: &mut Vec<String>| {
            if !out.iter().any(|n| n == name) {
                out.push(name.to_string());
            }
        };

        push(&self.detail.identity_field, &mut out);
        if self.detail.entity == entity {
            for f in &self.detail.fields {
                push(&f.name, &mut out);
            }
        }
        for sub in &self.subresources {
            if sub.entity == entity {
                for f in &sub.fields {
                    push(&f.name, &mut out);
                }
            }
        }
        out
    }
}
