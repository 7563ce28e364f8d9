//! Concrete fetchers for Marquee: plain HTTP via reqwest and
//! browser-rendered via chromiumoxide, plus the mode-dispatching
//! [`SiteFetcher`] the CLI wires into the crawl engine.

pub mod browser;
pub mod fetcher;

pub use browser::{BrowserFetcher, BrowserOptions, BrowserPage};
pub use fetcher::{HttpConfig, HttpFetcher, SiteFetcher};
