//! End-to-end pipeline scenarios against mock fetchers and sinks:
//! listing → detail → sub-resource chaining, dedup, quota drain, retry and
//! degradation behaviour, and the lookup (search) flow.

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use marquee_core::record::EntityKind;
use marquee_core::task::{CrawlConfig, CrawlTask, Stage};
use marquee_core::testutil::{MockFetcher, MockPage, MockReporter, MockSink, lookup_profile, movie_profile};
use marquee_core::CrawlEngine;

const LISTING_URL: &str = "https://example.com/browse/?min=2023&max=2025&page=1";

const DETAIL_TT0001: &str = r#"
    <html><head>
    <script type="application/ld+json">
        {"@type":"Movie","genre":["Action","Drama"],"aggregateRating":{"ratingValue":8.1}}
    </script>
    </head><body>
        <h1>First Movie</h1>
        <div class="runtime">1 hr 48 min</div>
    </body></html>
"#;

const DETAIL_TT0002: &str = r#"
    <html><body>
        <h1>Second Movie</h1>
        <span class="genre">Comedy</span>
        <div class="runtime">45 min</div>
    </body></html>
"#;

const REVIEWS_HTML: &str = r#"
    <div class="review">
        <a class="user">alice</a><span class="score">8</span>
        <div class="quote">Loved it.</div>
    </div>
    <div class="review">
        <a class="user">bob</a><span class="score">3</span>
        <div class="quote">Too long.</div>
    </div>
"#;

#[tokio::test]
async fn listing_dedups_across_links_and_chains_subresources() {
    // Three detail links, two of which resolve to the same identity.
    let listing = r#"
        <a href="/title/tt0001/">First</a>
        <a href="/title/tt0001/?ref=promo">First again</a>
        <a href="/title/tt0002/">Second</a>
        <a href="/browse/next/">pagination noise</a>
    "#;
    let fetcher = MockFetcher::new()
        .route(LISTING_URL, listing)
        .route("https://example.com/title/tt0001/", DETAIL_TT0001)
        .route("https://example.com/title/tt0001/?ref=promo", DETAIL_TT0001)
        .route("https://example.com/title/tt0002/", DETAIL_TT0002)
        .route("https://example.com/title/tt0001/reviews/", REVIEWS_HTML)
        .route("https://example.com/title/tt0002/reviews/", REVIEWS_HTML);
    let sink = MockSink::new();
    let reporter = MockReporter::new();

    let mut engine = CrawlEngine::new(
        fetcher.clone(),
        sink.clone(),
        movie_profile(),
        CrawlConfig::default(),
    );
    engine.seed_listing(2023, 2025, 1).unwrap();
    let stats = engine.run(CancellationToken::new(), &reporter).await.unwrap();

    assert_eq!(stats.parents_emitted, 2);
    assert_eq!(stats.duplicates_dropped, 1);
    assert_eq!(stats.records_emitted, 6, "2 movies + 2×2 reviews");

    let records = sink.emitted();
    // Parent records are emitted before any of their dependents.
    assert_eq!(records[0].entity, EntityKind::Movie);
    assert_eq!(records[0].get("movie_id"), Some(&json!("tt0001")));
    assert_eq!(records[0].get("title"), Some(&json!("First Movie")));
    assert_eq!(records[0].get("genres"), Some(&json!(["Action", "Drama"])));
    assert_eq!(records[0].get("rating"), Some(&json!(8.1)));
    assert_eq!(records[0].get("duration"), Some(&json!(108)));
    assert_eq!(
        records[0].get("source_url"),
        Some(&json!("https://example.com/title/tt0001/"))
    );

    assert_eq!(records[1].entity, EntityKind::Movie);
    assert_eq!(records[1].get("movie_id"), Some(&json!("tt0002")));
    assert_eq!(records[1].get("genres"), Some(&json!(["Comedy"])));
    // Declared but absent on the page: explicit null, key present.
    assert_eq!(records[1].get("rating"), Some(&Value::Null));

    let reviews: Vec<_> = records
        .iter()
        .filter(|r| r.entity == EntityKind::Review)
        .collect();
    assert_eq!(reviews.len(), 4);
    for review in &reviews {
        let id = review.get("movie_id").and_then(Value::as_str).unwrap();
        assert!(id == "tt0001" || id == "tt0002");
        assert!(review.get("user_name").unwrap().is_string());
    }

    // The duplicate link was fetched once, then dropped at the ledger.
    assert_eq!(fetcher.fetch_count("?ref=promo"), 1);
    assert!(reporter.labels().iter().any(|l| l == "DuplicateDropped"));
}

#[tokio::test]
async fn quota_stops_new_parents_but_drains_dependents() {
    let listing = r#"
        <a href="/title/tt0001/">one</a>
        <a href="/title/tt0002/">two</a>
        <a href="/title/tt0003/">three</a>
    "#;
    let fetcher = MockFetcher::new()
        .route(LISTING_URL, listing)
        .route("https://example.com/title/tt0001/", DETAIL_TT0001)
        .route("https://example.com/title/tt0002/", DETAIL_TT0002)
        .route("https://example.com/title/tt0003/", DETAIL_TT0002)
        .route("https://example.com/title/tt0001/reviews/", REVIEWS_HTML)
        .route("https://example.com/title/tt0002/reviews/", REVIEWS_HTML);
    let sink = MockSink::new();
    let reporter = MockReporter::new();

    let mut engine = CrawlEngine::new(
        fetcher.clone(),
        sink.clone(),
        movie_profile(),
        CrawlConfig::default().with_max_items(2),
    );
    engine.seed_listing(2023, 2025, 1).unwrap();
    let stats = engine.run(CancellationToken::new(), &reporter).await.unwrap();

    assert_eq!(stats.parents_emitted, 2);
    assert_eq!(stats.quota_skipped, 1, "third detail task never admitted");
    // The quota does not cancel dependents of already-emitted parents.
    assert_eq!(
        sink.emitted()
            .iter()
            .filter(|r| r.entity == EntityKind::Review)
            .count(),
        4
    );
    assert_eq!(fetcher.fetch_count("/title/tt0003/"), 0);
    assert!(reporter.labels().iter().any(|l| l == "QuotaReached"));
}

#[tokio::test]
async fn transient_failure_retries_then_succeeds() {
    let fetcher = MockFetcher::new()
        .route(LISTING_URL, r#"<a href="/title/tt0001/">one</a>"#)
        .route_error(
            "https://example.com/title/tt0001/",
            marquee_core::CrawlError::transient("connection reset"),
        )
        .route("https://example.com/title/tt0001/", DETAIL_TT0001)
        .route("https://example.com/title/tt0001/reviews/", REVIEWS_HTML);
    let sink = MockSink::new();
    let reporter = MockReporter::new();

    let mut engine = CrawlEngine::new(
        fetcher.clone(),
        sink.clone(),
        movie_profile(),
        CrawlConfig::default(),
    );
    engine.seed_listing(2023, 2025, 1).unwrap();
    let stats = engine.run(CancellationToken::new(), &reporter).await.unwrap();

    assert_eq!(stats.parents_emitted, 1);
    assert_eq!(stats.tasks_abandoned, 0);
    assert_eq!(fetcher.fetch_count("/title/tt0001/"), 3, "detail twice + reviews once");
    assert!(reporter.labels().iter().any(|l| l == "TaskRetried"));
}

#[tokio::test]
async fn subresource_failure_degrades_but_parent_survives() {
    let reviews_url = "https://example.com/title/tt0001/reviews/";
    let fetcher = MockFetcher::new()
        .route(LISTING_URL, r#"<a href="/title/tt0001/">one</a>"#)
        .route("https://example.com/title/tt0001/", DETAIL_TT0001)
        .route_error(reviews_url, marquee_core::CrawlError::Timeout(15))
        .route_error(reviews_url, marquee_core::CrawlError::Timeout(15))
        .route_error(reviews_url, marquee_core::CrawlError::Timeout(15));
    let sink = MockSink::new();
    let reporter = MockReporter::new();

    let mut engine = CrawlEngine::new(
        fetcher.clone(),
        sink.clone(),
        movie_profile(),
        CrawlConfig::default(),
    );
    engine.seed_listing(2023, 2025, 1).unwrap();
    let stats = engine.run(CancellationToken::new(), &reporter).await.unwrap();

    // Parent record was emitted before its dependent was ever scheduled.
    assert_eq!(stats.parents_emitted, 1);
    assert_eq!(stats.tasks_abandoned, 1);
    assert_eq!(sink.emitted().len(), 1);
    assert_eq!(fetcher.fetch_count("/reviews/"), 3, "initial try + 2 retries");
    assert!(reporter.labels().iter().any(|l| l == "TaskAbandoned"));
}

#[tokio::test]
async fn detail_without_identity_is_dropped_entirely() {
    let fetcher = MockFetcher::new()
        .route(LISTING_URL, r#"<a href="/title/coming-soon/">teaser</a>"#)
        .route("https://example.com/title/coming-soon/", DETAIL_TT0001);
    let sink = MockSink::new();
    let reporter = MockReporter::new();

    let mut engine = CrawlEngine::new(
        fetcher.clone(),
        sink.clone(),
        movie_profile(),
        CrawlConfig::default(),
    );
    engine.seed_listing(2023, 2025, 1).unwrap();
    let stats = engine.run(CancellationToken::new(), &reporter).await.unwrap();

    assert_eq!(stats.identity_missing, 1);
    assert_eq!(stats.records_emitted, 0, "no record, no expansion");
    assert_eq!(fetcher.fetch_count("/reviews/"), 0);
    assert!(reporter.labels().iter().any(|l| l == "IdentityMissing"));
}

#[tokio::test]
async fn spoiler_text_is_revealed_through_the_live_page() {
    let reviews = r#"
        <div class="review">
            <a class="user">alice</a>
            <div class="quote">Plain review.</div>
        </div>
        <div class="review">
            <a class="user">bob</a>
            <div class="quote">[SPOILER ALERT: This review contains spoilers.] Read More</div>
        </div>
    "#;
    let page = MockPage::new().with_modal_text("  The  butler\n did it. ");
    let fetcher = MockFetcher::new()
        .route("https://example.com/title/tt0001/reviews/", reviews)
        .with_page(page.clone());
    let sink = MockSink::new();

    let mut engine = CrawlEngine::new(
        fetcher,
        sink.clone(),
        movie_profile(),
        CrawlConfig::default(),
    );
    engine.enqueue(
        CrawlTask::new(Stage::SubResource, "https://example.com/title/tt0001/reviews/")
            .with_ctx("movie_id", "tt0001")
            .with_ctx("subresource", "user_reviews"),
    );
    let stats = engine
        .run(CancellationToken::new(), &MockReporter::new())
        .await
        .unwrap();

    assert_eq!(stats.records_emitted, 2);
    let records = sink.emitted();
    assert_eq!(records[0].get("review_text"), Some(&json!("Plain review.")));
    assert_eq!(records[1].get("review_text"), Some(&json!("The butler did it.")));

    assert_eq!(
        page.clicks.lock().unwrap().as_slice(),
        &[("button.read-more".to_string(), 0)]
    );
    assert_eq!(*page.escapes.lock().unwrap(), 1);
}

#[tokio::test]
async fn spoiler_without_live_page_stays_null() {
    let reviews = r#"
        <div class="review">
            <a class="user">bob</a>
            <div class="quote">[SPOILER ALERT: This review contains spoilers.] Read More</div>
        </div>
    "#;
    // No page handle attached: static document, no interaction capability.
    let fetcher =
        MockFetcher::new().route("https://example.com/title/tt0001/reviews/", reviews);
    let sink = MockSink::new();

    let mut engine = CrawlEngine::new(
        fetcher,
        sink.clone(),
        movie_profile(),
        CrawlConfig::default(),
    );
    engine.enqueue(
        CrawlTask::new(Stage::SubResource, "https://example.com/title/tt0001/reviews/")
            .with_ctx("movie_id", "tt0001")
            .with_ctx("subresource", "user_reviews"),
    );
    engine
        .run(CancellationToken::new(), &MockReporter::new())
        .await
        .unwrap();

    let records = sink.emitted();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("review_text"), Some(&Value::Null));
    assert_eq!(records[0].get("user_name"), Some(&json!("bob")));
}

const SEARCH_HTML: &str = r#"
    <div class="result"><a href="/title/tt0811/">Example</a> (2012) re-release</div>
    <div class="result"><a href="/title/tt0812/">Example</a> (2016)</div>
"#;

const SALES_HTML: &str = r#"
    <html><body>
        <h1>Example (2016)</h1>
        <div>DOMESTIC (33.3%) $393,242,207</div>
        <div>INTERNATIONAL (66.7%) $1,313,300,000</div>
        <div>WORLDWIDE $1,706,542,207</div>
        <table>
            <tr><td>Domestic Opening</td><td>$10,500,000</td></tr>
            <tr><td>Release Date</td><td>Jul 19, 2016</td></tr>
            <tr><td>Running Time</td><td>1 hr 45 min</td></tr>
        </table>
    </body></html>
"#;

const CREDITS_HTML: &str = r#"
    <table class="credits">
        <tr><th>Name</th><th>Role</th></tr>
        <tr><td>Jane Doe</td><td>Director</td></tr>
        <tr><td>John Roe</td><td>Producer</td></tr>
        <tr><td>Jane Doe</td><td>Director</td></tr>
    </table>
"#;

#[tokio::test]
async fn lookup_matches_year_then_extracts_sales_and_credits() {
    let fetcher = MockFetcher::new()
        .route("https://example.com/search/?q=Example", SEARCH_HTML)
        .route("https://example.com/title/tt0812/", SALES_HTML)
        .route("https://example.com/title/tt0812/credits/", CREDITS_HTML);
    let sink = MockSink::new();

    let mut engine = CrawlEngine::new(
        fetcher.clone(),
        sink.clone(),
        lookup_profile(),
        CrawlConfig::default(),
    );
    engine.seed_lookup("Example", Some(2016)).unwrap();
    let stats = engine
        .run(CancellationToken::new(), &MockReporter::new())
        .await
        .unwrap();

    assert_eq!(stats.parents_emitted, 1);
    // The 2012 candidate was never fetched: exact year match won.
    assert_eq!(fetcher.fetch_count("/title/tt0811/"), 0);

    let records = sink.emitted();
    let sales = &records[0];
    assert_eq!(sales.entity, EntityKind::Sales);
    assert_eq!(sales.get("movie_id"), Some(&json!("tt0812")));
    assert_eq!(sales.get("input_title"), Some(&json!("Example")));
    assert_eq!(sales.get("input_year"), Some(&json!("2016")));
    assert_eq!(sales.get("bom_title"), Some(&json!("Example (2016)")));
    assert_eq!(sales.get("gross_domestic"), Some(&json!(393_242_207)));
    assert_eq!(sales.get("gross_international"), Some(&json!(1_313_300_000)));
    assert_eq!(sales.get("gross_worldwide"), Some(&json!(1_706_542_207)));
    assert_eq!(sales.get("opening_weekend"), Some(&json!(10_500_000)));
    assert_eq!(sales.get("release_date"), Some(&json!("Jul 19, 2016")));
    assert_eq!(sales.get("runtime_minutes"), Some(&json!(105)));

    // Credits: header row discarded, duplicate row collapsed by require+dedup
    // semantics at the row level is NOT applied — rows are independent items,
    // so the repeated credit appears twice here.
    let credits: Vec<_> = records
        .iter()
        .filter(|r| r.entity == EntityKind::Credit)
        .collect();
    assert_eq!(credits.len(), 3);
    assert_eq!(credits[0].get("name"), Some(&json!("Jane Doe")));
    assert_eq!(credits[0].get("role"), Some(&json!("Director")));
    assert_eq!(credits[0].get("movie_id"), Some(&json!("tt0812")));
}

#[tokio::test]
async fn lookup_without_candidates_emits_nothing() {
    let fetcher = MockFetcher::new().route(
        "https://example.com/search/?q=Obscure",
        "<div>No results found</div>",
    );
    let sink = MockSink::new();
    let reporter = MockReporter::new();

    let mut engine = CrawlEngine::new(
        fetcher,
        sink.clone(),
        lookup_profile(),
        CrawlConfig::default(),
    );
    engine.seed_lookup("Obscure", Some(1999)).unwrap();
    let stats = engine.run(CancellationToken::new(), &reporter).await.unwrap();

    assert_eq!(stats.lookup_unmatched, 1);
    assert_eq!(stats.records_emitted, 0);
    assert!(reporter.labels().iter().any(|l| l == "LookupUnmatched"));
}

#[tokio::test]
async fn cancellation_stops_between_tasks() {
    let fetcher = MockFetcher::new().route(LISTING_URL, r#"<a href="/title/tt0001/">x</a>"#);
    let sink = MockSink::new();

    let mut engine = CrawlEngine::new(
        fetcher.clone(),
        sink.clone(),
        movie_profile(),
        CrawlConfig::default(),
    );
    engine.seed_listing(2023, 2025, 1).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let stats = engine.run(cancel, &MockReporter::new()).await.unwrap();

    assert_eq!(stats.records_emitted, 0);
    assert_eq!(fetcher.fetched.lock().unwrap().len(), 0);
}
