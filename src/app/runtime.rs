use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::crawl::Crawler;
use super::data_io::FileStore;
use super::error::Result;
use super::fetch::HttpFetcher;
use super::store::{MemoryStore, Persistence};
use super::types::{Cli, CrawlEvent, CrawlPhase, CrawlSummary};

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,aquascore_crawler=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

fn handle_crawl_event(event: CrawlEvent) {
    match event {
        CrawlEvent::Phase(CrawlPhase::PerCompetition { index, total }) => {
            info!("competition {}/{}", index + 1, total);
        }
        CrawlEvent::Phase(CrawlPhase::Draining) => warn!("draining in-flight races"),
        CrawlEvent::Phase(_) => {}
        CrawlEvent::Competition { name, races } => info!(competition = %name, races, "crawling"),
        CrawlEvent::Skipped { .. } => {}
        CrawlEvent::Persisted {
            race_id,
            title,
            results,
        } => info!(race_id = %race_id, results, "{title}"),
        CrawlEvent::Failed(err) => error!("{err}"),
    }
}

async fn run_headless(mut rx: UnboundedReceiver<CrawlEvent>) {
    while let Some(event) = rx.recv().await {
        handle_crawl_event(event);
    }
}

pub async fn run() -> Result<CrawlSummary> {
    let cli = Cli::parse();
    init_tracing();

    let config = cli.crawler_config()?;
    info!(portal = %config.base_url, concurrency = config.concurrency, "starting crawl");

    let fetcher = Arc::new(HttpFetcher::new(&config)?);
    let file_store = if cli.dry_run {
        None
    } else {
        Some(Arc::new(FileStore::open(&cli.output_dir, cli.format.into())?))
    };
    let store: Arc<dyn Persistence> = match &file_store {
        Some(store) => store.clone() as Arc<dyn Persistence>,
        None => Arc::new(MemoryStore::new()),
    };

    let (tx, rx) = mpsc::unbounded_channel::<CrawlEvent>();
    let reporter = tokio::spawn(run_headless(rx));

    let crawler = Crawler::new(fetcher, store, config).with_events(tx);
    let cancel = crawler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping crawl");
            cancel.cancel();
        }
    });

    let result = crawler.run().await;
    drop(crawler);
    let _ = reporter.await;

    if let Some(store) = &file_store {
        store.finish()?;
    }

    let summary = result?;
    info!(
        competitions = summary.competitions,
        entries = summary.entries,
        persisted = summary.persisted,
        skipped = summary.skipped,
        results = summary.results,
        output = %file_store
            .as_ref()
            .map(|s| s.dir().display().to_string())
            .unwrap_or_else(|| "(dry run)".to_string()),
        "finished crawl"
    );
    Ok(summary)
}
