use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use memefeed::config::Config;
use memefeed::feed::{FeedSession, FeedStateStore, HttpPageSource, SessionOptions};
use memefeed::model::{FilterSet, SortMode, TimePeriod};
use memefeed::prefetch::{HttpImageLoader, ImagePrefetchScheduler, PrefetchOptions};
use memefeed::storage::FileStorage;
use memefeed::viewport::SimulatedViewport;

/// Height of the simulated browser window (px).
const WINDOW_HEIGHT: f64 = 900.0;
/// Rendered height of one feed card (px).
const ITEM_HEIGHT: f64 = 420.0;

/// Get the config directory path (~/.config/memefeed/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("memefeed"))
}

#[derive(Parser, Debug)]
#[command(
    name = "memefeed",
    about = "Walk a meme feed headlessly, scrolling to the end of each page"
)]
struct Args {
    /// Sort order: newest, hottest or trending
    #[arg(long, default_value = "newest")]
    sort: SortMode,

    /// Time window: all, today, week or month
    #[arg(long, default_value = "all")]
    period: TimePeriod,

    /// Restrict the feed to one category
    #[arg(long)]
    category: Option<String>,

    /// Number of additional pages to scroll through
    #[arg(long, default_value_t = 3)]
    pages: u32,

    /// Session file holding the feed cache and scroll positions
    #[arg(long, value_name = "FILE")]
    session: Option<PathBuf>,

    /// Delete the session file before starting
    #[arg(long)]
    reset_session: bool,

    /// Config file (default ~/.config/memefeed/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let session_path = match &args.session {
        Some(path) => path.clone(),
        None => {
            std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
            config_dir.join("session.json")
        }
    };
    if args.reset_session && session_path.exists() {
        std::fs::remove_file(&session_path).context("Failed to delete session file")?;
        println!("Session reset.");
    }

    let storage = Arc::new(
        FileStorage::open(&session_path)
            .with_context(|| format!("Failed to open session file {}", session_path.display()))?,
    );
    let store = FeedStateStore::new(storage.clone(), config.cache.persist_debounce());

    let client = reqwest::Client::builder()
        .user_agent(concat!("memefeed/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;
    let mut source = HttpPageSource::new(client.clone(), config.api_base_url.clone());
    if let Some(key) = config.resolved_api_key() {
        source = source.with_api_key(key);
    }
    let prefetcher = ImagePrefetchScheduler::new(
        Arc::new(HttpImageLoader::new(client)),
        PrefetchOptions::from(&config.prefetch),
    );

    let mut filters = FilterSet::new(args.sort).with_period(args.period);
    if let Some(category) = &args.category {
        filters = filters.with_category(category.clone());
    }

    let mut session = FeedSession::new(
        store,
        Arc::new(source),
        storage,
        SessionOptions::from(&config),
        filters,
    )
    .with_prefetcher(prefetcher.clone());

    session
        .ensure_loaded()
        .await
        .context("Failed to load the first page")?;

    let viewport = Arc::new(SimulatedViewport::new(WINDOW_HEIGHT, 0.0));
    viewport.set_document_height(document_height(session.state().items.len()));
    session.mount(viewport.clone()).await;

    let start_page = session.state().current_page;
    // Long enough for one rate-limit window plus the post-render settle delay
    let event_wait =
        config.viewport.rate_limit() + config.viewport.settle_delay() + Duration::from_secs(1);

    while session.state().current_page < start_page + args.pages && session.state().has_more {
        viewport.user_scroll_to_bottom();
        session.on_scroll();

        let event = match tokio::time::timeout(event_wait, session.next_event()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => {
                tracing::debug!("No load-more request arrived, stopping walk");
                break;
            }
        };
        session
            .handle_event(event)
            .await
            .context("Failed to load the next page")?;
        viewport.set_document_height(document_height(session.state().items.len()));
        // Saves the triggering scroll once its quiet period has passed
        session.tick();
    }

    // Give queued image loads a chance to finish before reporting
    let drain_deadline = tokio::time::Instant::now() + config.prefetch.timeout();
    while prefetcher.is_draining() && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    session.unmount();

    let state = session.state();
    let stats = prefetcher.cache_stats();
    println!("Feed:       {}", session.feed_key());
    println!("Items:      {}", state.items.len());
    println!("Pages:      {}", state.current_page);
    println!("More:       {}", if state.has_more { "yes" } else { "no" });
    println!("Prefetched: {} images ({} still queued)", stats.cached, stats.queued);
    for item in state.items.iter().rev().take(5).rev() {
        println!("  {}  {}", item.id, item.title);
    }

    Ok(())
}

fn document_height(items: usize) -> f64 {
    items as f64 * ITEM_HEIGHT
}
