use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Phase of the multi-step crawl a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Paginated listing or search-results page; discovers detail links.
    Listing,
    /// Entity detail page; produces the parent record.
    Detail,
    /// Dependent page keyed by the parent identity (reviews, credits, bios).
    SubResource,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Listing => "listing",
            Stage::Detail => "detail",
            Stage::SubResource => "sub_resource",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "listing" => Ok(Stage::Listing),
            "detail" => Ok(Stage::Detail),
            "sub_resource" | "subresource" => Ok(Stage::SubResource),
            _ => Err(format!("Unknown stage: {s}")),
        }
    }
}

/// Correlation context carried from a task to the tasks it spawns
/// (e.g. `movie_id`, `input_title`, `input_year`).
pub type TaskContext = BTreeMap<String, String>;

/// One unit of crawl work: fetch a URL at a given stage, extract, and
/// possibly spawn child tasks. Consumed exactly once; retries re-queue a
/// copy with the attempt count bumped.
#[derive(Debug, Clone)]
pub struct CrawlTask {
    pub id: Uuid,
    pub stage: Stage,
    pub url: String,
    pub ctx: TaskContext,
    pub attempt: u32,
}

impl CrawlTask {
    pub fn new(stage: Stage, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage,
            url: url.into(),
            ctx: TaskContext::new(),
            attempt: 0,
        }
    }

    /// Add one correlation key.
    pub fn with_ctx(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.insert(key.into(), value.into());
        self
    }

    /// Replace the whole context (used when a child inherits its parent's).
    pub fn with_context(mut self, ctx: TaskContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn can_retry(&self, cap: u32) -> bool {
        self.attempt + 1 < cap
    }

    /// Copy of this task for the next attempt. Keeps the id so log lines
    /// across attempts correlate.
    pub fn retry(&self) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next
    }
}

/// Run-level knobs for the crawl engine.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Stop admitting Listing/Detail work after this many parent records.
    /// `None` crawls until the queue drains.
    pub max_items: Option<u64>,
    /// Total attempts (first try included) before a transient failure
    /// abandons the task.
    pub retry_cap: u32,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_items: None,
            retry_cap: 3,
        }
    }
}

impl CrawlConfig {
    pub fn with_max_items(mut self, max: u64) -> Self {
        self.max_items = Some(max);
        self
    }

    pub fn with_retry_cap(mut self, cap: u32) -> Self {
        self.retry_cap = cap;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip() {
        for stage in [Stage::Listing, Stage::Detail, Stage::SubResource] {
            let parsed: Stage = stage.as_str().parse().unwrap();
            assert_eq!(parsed, stage);
        }
    }

    #[test]
    fn test_retry_keeps_id_and_context() {
        let task = CrawlTask::new(Stage::Detail, "https://example.com/movie/tt0001/")
            .with_ctx("input_title", "Example");
        let retried = task.retry();

        assert_eq!(retried.id, task.id);
        assert_eq!(retried.attempt, 1);
        assert_eq!(retried.ctx.get("input_title").unwrap(), "Example");
    }

    #[test]
    fn test_retry_cap_counts_total_attempts() {
        let task = CrawlTask::new(Stage::Listing, "https://example.com/");
        assert!(task.can_retry(3));

        let third = task.retry().retry();
        assert_eq!(third.attempt, 2);
        assert!(!third.can_retry(3));
    }

    #[test]
    fn test_config_builders() {
        let config = CrawlConfig::default().with_max_items(5).with_retry_cap(2);
        assert_eq!(config.max_items, Some(5));
        assert_eq!(config.retry_cap, 2);
    }
}
