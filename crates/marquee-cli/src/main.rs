mod sink;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use marquee_client::{BrowserFetcher, BrowserOptions, HttpConfig, HttpFetcher, SiteFetcher};
use marquee_core::engine::TracingReporter;
use marquee_core::throttle::{ThrottleConfig, ThrottledFetcher};
use marquee_core::traits::{Fetcher, RecordSink};
use marquee_core::{CrawlConfig, CrawlEngine, SiteProfile};

use crate::sink::{AnySink, CsvSink, JsonlSink};

#[derive(Parser)]
#[command(name = "marquee", version, about = "Movie metadata, review, and box-office crawler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a site's paginated listings into movie/review records
    Crawl {
        /// Site profile (JSON) with selectors and URL templates
        #[arg(short, long)]
        profile: PathBuf,

        /// Lower bound of the release-year window
        #[arg(long, default_value_t = 2023)]
        year_min: i32,

        /// Upper bound of the release-year window
        #[arg(long, default_value_t = 2025)]
        year_max: i32,

        /// Number of listing pages to seed
        #[arg(long, default_value_t = 59)]
        pages: u32,

        #[command(flatten)]
        output: OutputOpts,

        #[command(flatten)]
        net: NetOpts,
    },

    /// Look up `{title, year}` targets from a JSONL file (sales workflow)
    Lookup {
        /// Site profile (JSON) with a search flow
        #[arg(short, long)]
        profile: PathBuf,

        /// Line-delimited JSON file of lookup targets
        #[arg(short, long)]
        targets: PathBuf,

        #[command(flatten)]
        output: OutputOpts,

        #[command(flatten)]
        net: NetOpts,
    },
}

#[derive(Args)]
struct OutputOpts {
    /// Directory for the per-entity output files
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,

    #[arg(long, value_enum, default_value = "csv")]
    format: Format,

    /// Stop admitting new entities after this many records
    #[arg(long)]
    max_items: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Csv,
    Jsonl,
}

#[derive(Args)]
struct NetOpts {
    /// Minimum delay between requests to the same host (ms)
    #[arg(long, default_value_t = 2000)]
    delay_ms: u64,

    /// Random jitter on top of the delay (ms)
    #[arg(long, default_value_t = 500)]
    jitter_ms: u64,

    /// Total attempts per task before a transient failure abandons it
    #[arg(long, default_value_t = 3)]
    retry_cap: u32,

    /// Proxy URL with embedded credentials (passed through opaquely)
    #[arg(long, env = "MARQUEE_PROXY")]
    proxy: Option<String>,

    /// Settle sleep after each rendered navigation (s)
    #[arg(long, default_value_t = 5)]
    settle_secs: u64,

    /// Element that must be present before a rendered page counts as loaded
    #[arg(long)]
    wait_selector: Option<String>,

    /// Never launch a browser, even if the profile asks for rendered fetches
    #[arg(long, default_value_t = false)]
    no_browser: bool,
}

#[derive(Debug, serde::Deserialize)]
struct LookupTarget {
    title: String,
    year: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (proxy credentials usually live there)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("marquee_core=info".parse()?)
                .add_directive("marquee_client=info".parse()?),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Crawl {
            profile,
            year_min,
            year_max,
            pages,
            output,
            net,
        } => {
            let profile = SiteProfile::from_file(&profile)?;
            let sink = build_sink(&output, &profile)?;
            let fetcher = build_fetcher(&profile, &net).await?;
            let mut engine = CrawlEngine::new(fetcher, sink, profile, crawl_config(&output, &net));
            engine.seed_listing(year_min, year_max, pages)?;
            run_engine(engine).await
        }
        Commands::Lookup {
            profile,
            targets,
            output,
            net,
        } => {
            let profile = SiteProfile::from_file(&profile)?;
            let sink = build_sink(&output, &profile)?;
            let fetcher = build_fetcher(&profile, &net).await?;
            let mut engine = CrawlEngine::new(fetcher, sink, profile, crawl_config(&output, &net));
            for target in read_targets(&targets)? {
                engine.seed_lookup(&target.title, target.year)?;
            }
            run_engine(engine).await
        }
    }
}

fn crawl_config(output: &OutputOpts, net: &NetOpts) -> CrawlConfig {
    let mut config = CrawlConfig::default().with_retry_cap(net.retry_cap);
    if let Some(max) = output.max_items {
        config = config.with_max_items(max);
    }
    config
}

fn build_sink(output: &OutputOpts, profile: &SiteProfile) -> Result<AnySink> {
    let sink = match output.format {
        Format::Csv => AnySink::Csv(CsvSink::create(&output.out_dir, profile)?),
        Format::Jsonl => AnySink::Jsonl(JsonlSink::create(&output.out_dir, profile)?),
    };
    Ok(sink)
}

async fn build_fetcher(
    profile: &SiteProfile,
    net: &NetOpts,
) -> Result<ThrottledFetcher<SiteFetcher>> {
    let mut http_config = HttpConfig::default();
    if let Some(ua) = &profile.user_agent {
        http_config = http_config.with_user_agent(ua);
    }
    for (name, value) in &profile.headers {
        http_config = http_config.with_header(name, value);
    }
    if let Some(proxy) = &net.proxy {
        http_config = http_config.with_proxy(proxy);
    }

    let mut fetcher = SiteFetcher::new(HttpFetcher::new(http_config)?);

    if profile.uses_rendered() && !net.no_browser {
        let mut opts =
            BrowserOptions::default().with_settle(Duration::from_secs(net.settle_secs));
        if let Some(selector) = &net.wait_selector {
            opts = opts.with_wait_selector(selector);
        }
        if let Some(ua) = &profile.user_agent {
            opts = opts.with_user_agent(ua);
        }
        let browser = BrowserFetcher::launch_with(opts)
            .await
            .context("failed to launch the headless browser")?;
        fetcher = fetcher.with_browser(browser);
    } else if profile.uses_rendered() {
        tracing::warn!(
            "Profile asks for rendered fetches but --no-browser is set; those tasks will fail"
        );
    }

    let throttle = ThrottleConfig::new(Duration::from_millis(net.delay_ms))
        .with_jitter(Duration::from_millis(net.jitter_ms))
        .with_latency_factor(1.5);
    Ok(ThrottledFetcher::new(fetcher, throttle))
}

fn read_targets(path: &Path) -> Result<Vec<LookupTarget>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read targets file {}", path.display()))?;

    let mut targets = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LookupTarget>(line) {
            Ok(target) if !target.title.is_empty() => targets.push(target),
            Ok(_) => tracing::warn!(line = lineno + 1, "Skipping target without a title"),
            Err(e) => tracing::warn!(line = lineno + 1, error = %e, "Skipping malformed target"),
        }
    }
    Ok(targets)
}

async fn run_engine<F, S>(mut engine: CrawlEngine<F, S>) -> Result<()>
where
    F: Fetcher,
    S: RecordSink,
{
    let cancel = CancellationToken::new();
    let cancel_on_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, stopping after the current task");
            cancel_on_ctrlc.cancel();
        }
    });

    let stats = engine.run(cancel, &TracingReporter).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
