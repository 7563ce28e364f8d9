//! Core crawl pipeline for Marquee: task/stage model, session dedup ledger,
//! the multi-stage crawl engine, field extraction, per-site profiles, and
//! per-host throttling. Concrete fetchers live in `marquee-client`; sinks
//! and wiring live in `marquee-cli`.

pub mod engine;
pub mod error;
pub mod extract;
pub mod profile;
pub mod record;
pub mod session;
pub mod task;
pub mod testutil;
pub mod throttle;
pub mod traits;

pub use engine::{CrawlEngine, CrawlEvent, CrawlReporter, TracingReporter};
pub use error::CrawlError;
pub use profile::SiteProfile;
pub use record::{EntityKind, EntityRecord};
pub use session::{CrawlSession, CrawlStats};
pub use task::{CrawlConfig, CrawlTask, Stage};
pub use throttle::{ThrottleConfig, ThrottledFetcher};
pub use traits::{FetchMode, FetchedDoc, Fetcher, NoPage, NullSink, PageInteractor, RecordSink};
