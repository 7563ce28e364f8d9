/// Smoke-test for `BrowserFetcher`.
///
/// Launches a headless Chromium, fetches <https://example.com>, and verifies
/// the rendered HTML contains the expected `<h1>`.
///
/// Run with:
///   cargo run --example browser_smoke
use std::time::Duration;

use marquee_client::{BrowserFetcher, BrowserOptions};
use marquee_core::traits::{FetchMode, Fetcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Launching headless browser…");
    let opts = BrowserOptions::default().with_settle(Duration::from_secs(1));
    let fetcher = BrowserFetcher::launch_with(opts).await?;

    let url = "https://example.com";
    println!("Fetching {url} …");
    let doc = fetcher.fetch(url, FetchMode::Rendered).await?;

    // Basic sanity checks
    assert!(
        doc.html.contains("<h1>Example Domain</h1>"),
        "Expected <h1> not found in rendered HTML"
    );
    assert!(
        doc.page.is_some(),
        "Rendered fetch should expose the live page handle"
    );

    println!("OK — got {} bytes of rendered HTML", doc.html.len());
    println!("First 300 chars:\n{}", &doc.html[..doc.html.len().min(300)]);
    Ok(())
}
