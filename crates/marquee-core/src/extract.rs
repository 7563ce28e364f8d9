//! Field extraction: document → record.
//!
//! All functions here are synchronous — a parsed `scraper::Html` is never
//! held across an await point, so engine futures stay `Send`. Anything that
//! needs live browser interaction (spoiler-gated text) is detected here and
//! resolved by the engine through the `PageInteractor` capability.

use std::collections::{BTreeMap, HashSet};

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use url::Url;

use crate::profile::{
    FieldSpec, IdentityRule, LabelRowsSpec, LinkRule, ListingSpec, MatchPolicy, SourceSpec,
    SubResourceSpec, Transform,
};
use crate::record::{EntityKind, EntityRecord};

/// Per-document context shared by every field of one extraction pass:
/// the label→value row map, parsed JSON-LD blocks, and (when needed) the
/// whole visible page text.
struct DocContext {
    labels: BTreeMap<String, String>,
    json_ld: Vec<Value>,
    page_text: Option<String>,
}

impl DocContext {
    fn build(doc: &Html, fields: &[FieldSpec], label_rows: Option<&LabelRowsSpec>) -> Self {
        let needs_json_ld = fields
            .iter()
            .flat_map(|f| f.sources.iter())
            .any(|s| matches!(s, SourceSpec::JsonLd { .. }));
        let needs_page_text = fields
            .iter()
            .flat_map(|f| f.sources.iter())
            .any(|s| matches!(s, SourceSpec::PageMoney { .. }));

        Self {
            labels: label_rows.map(|spec| label_map(doc, spec)).unwrap_or_default(),
            json_ld: if needs_json_ld {
                json_ld_blocks(doc)
            } else {
                Vec::new()
            },
            page_text: needs_page_text.then(|| visible_text(doc)),
        }
    }
}

/// Extract one record from a whole document. Every declared field ends up
/// present; fields no source could fill stay null.
pub fn extract_entity(
    html: &str,
    entity: EntityKind,
    fields: &[FieldSpec],
    label_rows: Option<&LabelRowsSpec>,
) -> EntityRecord {
    let doc = Html::parse_document(html);
    let ctx = DocContext::build(&doc, fields, label_rows);
    let mut record = EntityRecord::new(entity, fields.iter().map(|f| f.name.as_str()));
    fill_fields(&mut record, doc.root_element(), &ctx, fields);
    record
}

/// A per-item record plus whether one of its fields is gated behind a live
/// browser interaction (spoiler reveal).
#[derive(Debug, Clone)]
pub struct ItemDraft {
    pub record: EntityRecord,
    pub needs_interaction: bool,
}

/// Extract per-item records from a sub-resource page. With an item selector
/// each matching container yields one record (capped); without one the whole
/// page is a single item. Items whose gated field carries the spoiler marker
/// are flagged and the field reset to null for the engine to resolve.
pub fn extract_items(html: &str, sub: &SubResourceSpec) -> Vec<ItemDraft> {
    let doc = Html::parse_document(html);
    let ctx = DocContext::build(&doc, &sub.fields, None);

    let roots: Vec<ElementRef<'_>> = match &sub.item_selector {
        Some(raw) => match Selector::parse(raw) {
            Ok(sel) => doc.select(&sel).collect(),
            Err(_) => {
                tracing::debug!(selector = %raw, "Skipping unparseable item selector");
                Vec::new()
            }
        },
        None => vec![doc.root_element()],
    };

    let cap = sub.max_items.unwrap_or(usize::MAX);
    roots
        .into_iter()
        .map(|root| {
            let mut record = EntityRecord::new(sub.entity, sub.fields.iter().map(|f| f.name.as_str()));
            fill_fields(&mut record, root, &ctx, &sub.fields);

            let mut needs_interaction = false;
            if let Some(sp) = &sub.spoiler {
                let gated = record
                    .get(&sp.field)
                    .and_then(Value::as_str)
                    .is_some_and(|text| text.contains(&sp.marker));
                if gated {
                    record.set(&sp.field, Value::Null);
                    needs_interaction = true;
                }
            }
            ItemDraft {
                record,
                needs_interaction,
            }
        })
        .filter(|draft| {
            sub.require_fields
                .iter()
                .all(|name| !draft.record.is_unfilled(name))
        })
        .take(cap)
        .collect()
}

fn fill_fields(
    record: &mut EntityRecord,
    root: ElementRef<'_>,
    ctx: &DocContext,
    fields: &[FieldSpec],
) {
    for field in fields {
        for source in &field.sources {
            let value = eval_source(root, ctx, source);
            if !value.is_null() {
                record.set(&field.name, value);
                break;
            }
        }
    }
}

/// Evaluate one source against an element scope. Returns `Null` for "no
/// usable value" so the caller can fall through to the next source.
fn eval_source(root: ElementRef<'_>, ctx: &DocContext, source: &SourceSpec) -> Value {
    match source {
        SourceSpec::Css { selector, transform } => match parse_selector(selector) {
            Some(sel) => root
                .select(&sel)
                .next()
                .map(|el| apply_transform(&element_text(el), *transform))
                .unwrap_or(Value::Null),
            None => Value::Null,
        },
        SourceSpec::CssAll { selector, transform } => match parse_selector(selector) {
            Some(sel) => {
                let items: Vec<Value> = root
                    .select(&sel)
                    .map(|el| apply_transform(&element_text(el), *transform))
                    .filter(|v| !v.is_null())
                    .collect();
                dedupe_list(items)
            }
            None => Value::Null,
        },
        SourceSpec::Attr {
            selector,
            attr,
            transform,
        } => match parse_selector(selector) {
            Some(sel) => root
                .select(&sel)
                .next()
                .and_then(|el| el.value().attr(attr))
                .map(|raw| apply_transform(raw, *transform))
                .unwrap_or(Value::Null),
            None => Value::Null,
        },
        SourceSpec::JsonLd { path, transform } => {
            transform_json(json_ld_value(&ctx.json_ld, path), *transform)
        }
        SourceSpec::Label { name, transform } => ctx
            .labels
            .get(name)
            .map(|raw| apply_transform(raw, *transform))
            .unwrap_or(Value::Null),
        SourceSpec::PageMoney { label } => ctx
            .page_text
            .as_deref()
            .and_then(|text| labeled_money(text, label))
            .map(Value::from)
            .unwrap_or(Value::Null),
    }
}

fn parse_selector(raw: &str) -> Option<Selector> {
    match Selector::parse(raw) {
        Ok(sel) => Some(sel),
        Err(_) => {
            tracing::debug!(selector = %raw, "Skipping unparseable selector");
            None
        }
    }
}

/// Set-dedupe a list (trimmed, empties dropped upstream). Keyed by JSON
/// representation; output sorted by key — deduplication deliberately does
/// not preserve source order.
fn dedupe_list(items: Vec<Value>) -> Value {
    let mut seen = HashSet::new();
    let mut keyed: Vec<(String, Value)> = Vec::new();
    for item in items {
        let key = item.to_string();
        if seen.insert(key.clone()) {
            keyed.push((key, item));
        }
    }
    if keyed.is_empty() {
        return Value::Null;
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Value::Array(keyed.into_iter().map(|(_, v)| v).collect())
}

fn apply_transform(raw: &str, transform: Transform) -> Value {
    match transform {
        Transform::Text => {
            let text = collapse_ws(raw);
            if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            }
        }
        Transform::Money => money_to_int(raw).map(Value::from).unwrap_or(Value::Null),
        Transform::RuntimeMinutes => runtime_minutes(raw).map(Value::from).unwrap_or(Value::Null),
        Transform::StripByPrefix => {
            let text = collapse_ws(raw);
            let stripped = match text.get(..3) {
                Some(prefix) if prefix.eq_ignore_ascii_case("by ") => text[3..].trim().to_string(),
                _ => text,
            };
            if stripped.is_empty() {
                Value::Null
            } else {
                Value::String(stripped)
            }
        }
    }
}

/// Apply a transform to a value pulled out of JSON-LD. Strings go through
/// the usual normalization; arrays normalize element-wise; numbers pass
/// through untouched.
fn transform_json(value: Value, transform: Transform) -> Value {
    match value {
        Value::String(s) => apply_transform(&s, transform),
        Value::Array(items) => {
            let cleaned: Vec<Value> = items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => apply_transform(&s, transform),
                    other => other,
                })
                .filter(|v| !v.is_null())
                .collect();
            if cleaned.is_empty() {
                Value::Null
            } else {
                Value::Array(cleaned)
            }
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Document-level helpers
// ---------------------------------------------------------------------------

/// Joined, whitespace-collapsed text of an element's descendants.
fn element_text(el: ElementRef<'_>) -> String {
    collapse_ws(&el.text().collect::<Vec<_>>().join(" "))
}

pub fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// All parsed `application/ld+json` blocks in a document.
fn json_ld_blocks(doc: &Html) -> Vec<Value> {
    let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    doc.select(&sel)
        .filter_map(|el| {
            let raw: String = el.text().collect();
            serde_json::from_str(&raw).ok()
        })
        .collect()
}

/// First block where the whole path resolves to a non-null value.
fn json_ld_value(blocks: &[Value], path: &[String]) -> Value {
    for block in blocks {
        let mut cursor = block;
        let mut resolved = true;
        for key in path {
            match cursor.get(key) {
                Some(next) => cursor = next,
                None => {
                    resolved = false;
                    break;
                }
            }
        }
        if resolved && !cursor.is_null() {
            return cursor.clone();
        }
    }
    Value::Null
}

/// Build the label→value map: table rows first (first cell label, second
/// cell joined text), falling back to two-span flex rows when the document
/// has no usable table.
fn label_map(doc: &Html, spec: &LabelRowsSpec) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();

    if let Some(rows) = parse_selector(&spec.row_selector) {
        for row in doc.select(&rows) {
            let cells: Vec<ElementRef<'_>> = row
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|el| matches!(el.value().name(), "th" | "td"))
                .collect();
            if cells.len() >= 2 {
                let label = clean_label(&element_text(cells[0]));
                let value = element_text(cells[1]);
                if !label.is_empty() && !value.is_empty() {
                    map.entry(label).or_insert(value);
                }
            }
        }
    }

    if map.is_empty() {
        if let Some(fallback) = &spec.fallback_row_selector {
            if let (Some(rows), Some(span)) = (parse_selector(fallback), parse_selector("span")) {
                for row in doc.select(&rows) {
                    let spans: Vec<String> = row
                        .select(&span)
                        .map(element_text)
                        .filter(|s| !s.is_empty())
                        .collect();
                    if spans.len() >= 2 {
                        let label = clean_label(&spans[0]);
                        if !label.is_empty() {
                            map.entry(label).or_insert_with(|| spans[1].clone());
                        }
                    }
                }
            }
        }
    }

    map
}

fn clean_label(raw: &str) -> String {
    raw.trim().trim_end_matches(':').trim().to_string()
}

/// Whole-document text with script/style subtrees skipped.
fn visible_text(doc: &Html) -> String {
    fn walk(el: ElementRef<'_>, out: &mut Vec<String>) {
        for child in el.children() {
            if let Some(text) = child.value().as_text() {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    out.push(collapse_ws(trimmed));
                }
            } else if let Some(child_el) = ElementRef::wrap(child) {
                if !matches!(child_el.value().name(), "script" | "style") {
                    walk(child_el, out);
                }
            }
        }
    }
    let mut parts = Vec::new();
    walk(doc.root_element(), &mut parts);
    parts.join(" ")
}

// ---------------------------------------------------------------------------
// Numeric normalization
// ---------------------------------------------------------------------------

/// `"$1,706,542,207"` → `1706542207`. Anything without a `$`-prefixed
/// grouped-digit amount ("N/A", "-", empty) is None.
pub fn money_to_int(text: &str) -> Option<i64> {
    let dollar = text.find('$')?;
    let digits: String = text[dollar + 1..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(char::is_ascii_digit)
        .collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Money amount following `label` in free-flowing page text, tolerating an
/// interleaved share like `(66.7%)` and arbitrary whitespace/line breaks:
/// `WORLDWIDE $1,706,542,207` or `DOMESTIC (33.3%) $393,242,207`.
pub fn labeled_money(text: &str, label: &str) -> Option<i64> {
    let mut from = 0;
    while let Some(pos) = find_ascii_ci(text, label, from) {
        let after = pos + label.len();
        let mut rest = text[after..].trim_start();
        if let Some(inner) = rest.strip_prefix('(') {
            if let Some(close) = inner.find(')') {
                let share = inner[..close].trim();
                let body = share.trim_end_matches('%').trim();
                let numeric = !body.is_empty()
                    && body.chars().all(|c| c.is_ascii_digit() || c == '.');
                if share.ends_with('%') && numeric {
                    rest = inner[close + 1..].trim_start();
                }
            }
        }
        if rest.starts_with('$') {
            if let Some(amount) = money_to_int(rest) {
                return Some(amount);
            }
        }
        from = after;
    }
    None
}

/// Case-insensitive substring search for an ASCII needle. Byte offsets are
/// valid char boundaries because the needle is ASCII.
fn find_ascii_ci(hay: &str, needle: &str, from: usize) -> Option<usize> {
    let hay_bytes = hay.as_bytes();
    let needle_bytes = needle.as_bytes();
    if needle_bytes.is_empty() || from + needle_bytes.len() > hay_bytes.len() {
        return None;
    }
    (from..=hay_bytes.len() - needle_bytes.len())
        .find(|&i| hay_bytes[i..i + needle_bytes.len()].eq_ignore_ascii_case(needle_bytes))
}

/// `"1 hr 48 min"` → 108, `"45 min"` → 45, `"2 hr"` → 120. A missing hour
/// or minute component counts as zero; no component at all (or a zero
/// total) is None.
pub fn runtime_minutes(text: &str) -> Option<u32> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut hours: Option<u32> = None;
    let mut minutes: Option<u32> = None;
    for pair in tokens.windows(2) {
        if let Ok(n) = pair[0].parse::<u32>() {
            let unit = pair[1].to_ascii_lowercase();
            if unit.starts_with("hr") || unit.starts_with("hour") {
                hours.get_or_insert(n);
            } else if unit.starts_with("min") {
                minutes.get_or_insert(n);
            }
        }
    }
    if hours.is_none() && minutes.is_none() {
        return None;
    }
    let total = hours.unwrap_or(0) * 60 + minutes.unwrap_or(0);
    if total > 0 { Some(total) } else { None }
}

/// Pull an entity identity out of a URL.
pub fn identity_from_url(url: &str, rule: &IdentityRule) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    match rule {
        IdentityRule::PathToken { prefix } => segments.iter().find_map(|seg| {
            let rest = seg.strip_prefix(prefix.as_str())?;
            if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                Some((*seg).to_string())
            } else {
                None
            }
        }),
        IdentityRule::LastSegment => segments.last().map(|s| (*s).to_string()),
    }
}

// ---------------------------------------------------------------------------
// Listing / search parsing
// ---------------------------------------------------------------------------

/// Hrefs of listing links passing the profile's substring filters, in
/// document order, exact duplicates removed.
pub fn listing_links(html: &str, listing: &ListingSpec) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Some(sel) = parse_selector(&listing.link_selector) else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for el in doc.select(&sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let keep = listing.link_contains.iter().all(|s| href.contains(s.as_str()))
            && !listing.link_excludes.iter().any(|s| href.contains(s.as_str()));
        if keep && seen.insert(href.to_string()) {
            out.push(href.to_string());
        }
    }
    out
}

/// Hrefs discovered by a sub-resource link rule, capped.
pub fn rule_links(html: &str, rule: &LinkRule) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Some(sel) = parse_selector(&rule.selector) else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for el in doc.select(&sel) {
        if let Some(href) = el.value().attr(&rule.attr) {
            if seen.insert(href.to_string()) {
                out.push(href.to_string());
            }
        }
    }
    let cap = rule.max.unwrap_or(usize::MAX);
    out.truncate(cap);
    out
}

/// One search-result candidate: its link and the text of the nearest block
/// around it (where the release year usually appears).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub href: String,
    pub block_text: String,
}

pub fn search_candidates(html: &str, selector: &str) -> Vec<Candidate> {
    let doc = Html::parse_document(html);
    let Some(sel) = parse_selector(selector) else {
        return Vec::new();
    };
    doc.select(&sel)
        .filter_map(|el| {
            let href = el.value().attr("href")?;
            Some(Candidate {
                href: href.to_string(),
                block_text: nearest_block_text(el),
            })
        })
        .collect()
}

/// Text of the closest `div` ancestor — the result row the anchor sits in.
fn nearest_block_text(el: ElementRef<'_>) -> String {
    let mut node = el.parent();
    while let Some(n) = node {
        if let Some(ancestor) = ElementRef::wrap(n) {
            if ancestor.value().name() == "div" {
                return element_text(ancestor);
            }
        }
        node = n.parent();
    }
    element_text(el)
}

/// Choose among search candidates. Year-first looks for `(year)` in the
/// candidate's block text; first-listed (and the fallback when no year
/// matches) takes document order. Best effort by design.
pub fn pick_candidate<'a>(
    candidates: &'a [Candidate],
    year: Option<&str>,
    policy: MatchPolicy,
) -> Option<&'a Candidate> {
    if candidates.is_empty() {
        return None;
    }
    if policy == MatchPolicy::YearThenFirst {
        if let Some(year) = year {
            let marker = format!("({year})");
            if let Some(found) = candidates.iter().find(|c| c.block_text.contains(&marker)) {
                return Some(found);
            }
        }
    }
    candidates.first()
}
