use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{CrawlError, FetchError, Result, StoreError};
use super::fetch::{PageFetcher, PageRequest};
use super::html::parse_document;
use super::portal::{LandingPage, parse_landing_page, parse_race_list};
use super::race::build_race;
use super::store::Persistence;
use super::types::{
    ActiveCompetition, CrawlEvent, CrawlPhase, CrawlSummary, CrawlerConfig, RaceId, RaceListEntry,
};

#[derive(Debug, Default)]
struct FirstError {
    tripped: AtomicBool,
    slot: Mutex<Option<CrawlError>>,
}

impl FirstError {
    fn record(&self, err: CrawlError) {
        if self.tripped.swap(true, Ordering::AcqRel) {
            debug!(error = %err, "dropping error after first failure");
            return;
        }
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(err);
        }
    }

    fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<CrawlError> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}

enum UnitOutcome {
    Skipped { url: String },
    Persisted { race_id: RaceId, title: String, results: usize },
    Cancelled,
    Failed,
}

#[derive(Clone)]
struct Worker {
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn Persistence>,
    cancel: CancellationToken,
    first_error: Arc<FirstError>,
}

impl Worker {
    async fn process(self, entry: RaceListEntry) -> UnitOutcome {
        match self.crawl_race(&entry).await {
            Ok(outcome) => outcome,
            Err(CrawlError::Cancelled) => UnitOutcome::Cancelled,
            Err(err) => {
                self.first_error.record(err.in_race(&entry));
                UnitOutcome::Failed
            }
        }
    }

    async fn crawl_race(&self, entry: &RaceListEntry) -> Result<UnitOutcome> {
        let url = entry.results_url.as_str();
        if self.store.is_crawled(url).await? {
            return Ok(UnitOutcome::Skipped {
                url: url.to_string(),
            });
        }

        let body = self
            .fetcher
            .fetch(PageRequest::Get(entry.results_url.clone()), &self.cancel)
            .await
            .map_err(fetch_error)?;
        let race = {
            let doc = parse_document(&body)?;
            build_race(&doc, entry)?
        };

        let race_id = self.store.persist_race(&race).await?;
        match self.store.record_crawl_log(url).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => debug!(url, "crawl log already had entry"),
            Err(err) => return Err(err.into()),
        }

        Ok(UnitOutcome::Persisted {
            race_id,
            title: entry.race_title.clone(),
            results: race.results.len(),
        })
    }
}

fn fetch_error(err: FetchError) -> CrawlError {
    match err {
        FetchError::Cancelled => CrawlError::Cancelled,
        other => CrawlError::Fetch(other),
    }
}

pub struct Crawler {
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn Persistence>,
    config: CrawlerConfig,
    cancel: CancellationToken,
    events: Option<UnboundedSender<CrawlEvent>>,
}

impl Crawler {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn Persistence>,
        config: CrawlerConfig,
    ) -> Self {
        Self {
            fetcher,
            store,
            config,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, tx: UnboundedSender<CrawlEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn emit(&self, event: CrawlEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn abort(&self, err: CrawlError) -> CrawlError {
        warn!(error = %err, "crawl aborted");
        self.emit(CrawlEvent::Failed(err.to_string()));
        self.emit(CrawlEvent::Phase(CrawlPhase::Aborted));
        err
    }

    pub async fn run(&self) -> Result<CrawlSummary> {
        self.emit(CrawlEvent::Phase(CrawlPhase::Discovering));
        let landing = match self.load_landing().await {
            Ok(landing) => landing,
            Err(err) => return Err(self.abort(err)),
        };
        if landing.competitions.is_empty() {
            return Err(self.abort(CrawlError::NoCompetitions {
                url: self.config.base_url.to_string(),
            }));
        }
        info!(competitions = landing.competitions.len(), "discovered competitions");

        let total = landing.competitions.len();
        let mut summary = CrawlSummary::default();
        let mut seen = HashSet::new();
        for (index, competition) in landing.competitions.iter().enumerate() {
            if index > 0 && !self.config.competition_delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.competition_delay) => {}
                }
            }
            if self.cancel.is_cancelled() {
                return Err(self.abort(CrawlError::Cancelled));
            }

            self.emit(CrawlEvent::Phase(CrawlPhase::PerCompetition { index, total }));
            if let Err(err) = self.crawl_competition(competition, &mut seen, &mut summary).await {
                let err = match err {
                    err @ (CrawlError::Race { .. } | CrawlError::Cancelled) => err,
                    other => other.in_competition(&competition.display_name),
                };
                return Err(self.abort(err));
            }
        }

        self.emit(CrawlEvent::Phase(CrawlPhase::Done));
        info!(
            competitions = summary.competitions,
            persisted = summary.persisted,
            skipped = summary.skipped,
            "crawl finished"
        );
        Ok(summary)
    }

    async fn load_landing(&self) -> Result<LandingPage> {
        let body = self
            .fetcher
            .fetch(PageRequest::Get(self.config.base_url.clone()), &self.cancel)
            .await
            .map_err(fetch_error)?;
        let doc = parse_document(&body)?;
        parse_landing_page(&doc)
    }

    async fn race_list(&self, competition: &ActiveCompetition) -> Result<Vec<RaceListEntry>> {
        // The postback is only accepted with hidden state from a fresh landing page.
        let landing = self.load_landing().await?;
        let request = PageRequest::PostForm {
            url: self.config.base_url.clone(),
            form: landing.hidden_fields.postback_for(competition),
        };
        let body = self
            .fetcher
            .fetch(request, &self.cancel)
            .await
            .map_err(fetch_error)?;
        let doc = parse_document(&body)?;
        parse_race_list(&doc, &self.config.base_url, &competition.display_name)
    }

    async fn crawl_competition(
        &self,
        competition: &ActiveCompetition,
        seen: &mut HashSet<String>,
        summary: &mut CrawlSummary,
    ) -> Result<()> {
        let entries = self.race_list(competition).await?;
        info!(
            competition = %competition.display_name,
            races = entries.len(),
            "race list loaded"
        );
        self.emit(CrawlEvent::Competition {
            name: competition.display_name.clone(),
            races: entries.len(),
        });
        summary.competitions += 1;
        summary.entries += entries.len();

        let worker = Worker {
            fetcher: Arc::clone(&self.fetcher),
            store: Arc::clone(&self.store),
            cancel: self.cancel.clone(),
            first_error: Arc::new(FirstError::default()),
        };
        let concurrency = self.config.concurrency.max(1);
        let mut pending = entries.into_iter();
        let mut set: JoinSet<UnitOutcome> = JoinSet::new();
        let mut admitting = true;

        loop {
            while admitting && set.len() < concurrency {
                if worker.first_error.is_tripped() || self.cancel.is_cancelled() {
                    admitting = false;
                    self.emit(CrawlEvent::Phase(CrawlPhase::Draining));
                    break;
                }
                let Some(entry) = pending.next() else {
                    admitting = false;
                    break;
                };
                if !seen.insert(entry.results_url.to_string()) {
                    debug!(url = %entry.results_url, "duplicate entry in this run");
                    continue;
                }
                set.spawn(worker.clone().process(entry));
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            match joined {
                Ok(outcome) => self.record_outcome(outcome, summary),
                Err(err) => worker.first_error.record(CrawlError::Worker(err)),
            }
        }

        if let Some(err) = worker.first_error.take() {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }
        Ok(())
    }

    fn record_outcome(&self, outcome: UnitOutcome, summary: &mut CrawlSummary) {
        match outcome {
            UnitOutcome::Skipped { url } => {
                summary.skipped += 1;
                debug!(url = %url, "already crawled");
                self.emit(CrawlEvent::Skipped { url });
            }
            UnitOutcome::Persisted {
                race_id,
                title,
                results,
            } => {
                summary.persisted += 1;
                summary.results += results;
                debug!(race_id = %race_id, title = %title, results, "race stored");
                self.emit(CrawlEvent::Persisted {
                    race_id,
                    title,
                    results,
                });
            }
            UnitOutcome::Cancelled | UnitOutcome::Failed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::portal::ACTIVITY_FIELD;
    use crate::app::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use url::Url;

    const LANDING: &str = include_str!("../../tests/fixtures/landing.html");
    const REPORT: &str = include_str!("../../tests/fixtures/report_primary.html");
    const BASE: &str = "https://ctsa.test/CTSA/public/race/game_data.aspx";

    fn race_grid(ids: &[u32]) -> String {
        let rows = ids
            .iter()
            .map(|id| {
                format!(
                    "<tr><td>{id}</td><td>決賽</td><td>11 & 12歲級女子組游泳 200公尺自由式 計時決賽</td>\
                     <td><a href=\"race_report.aspx?id={id}\">成績報告</a></td></tr>"
                )
            })
            .collect::<String>();
        format!(
            "<html><body><form><table id=\"ctl00_ContentPlaceHolder1_GridView1\">\
             <tr><th>場次</th><th>組別</th><th>項目</th><th>成績</th></tr>{rows}</table></form></body></html>"
        )
    }

    fn report_url(id: u32) -> String {
        format!("https://ctsa.test/CTSA/public/race/race_report.aspx?id={id}")
    }

    #[derive(Default)]
    struct ScriptedFetcher {
        landing: String,
        grids: HashMap<String, String>,
        failing: HashSet<String>,
        delays: HashMap<String, Duration>,
        default_delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        log: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn new(grids: &[(&str, &[u32])]) -> Self {
            Self {
                landing: LANDING.to_string(),
                grids: grids
                    .iter()
                    .map(|(id, races)| (id.to_string(), race_grid(races)))
                    .collect(),
                default_delay: Duration::from_millis(10),
                ..Self::default()
            }
        }

        fn requests(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn report_fetches(&self) -> Vec<String> {
            self.requests()
                .into_iter()
                .filter(|r| r.contains("race_report"))
                .collect()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            request: PageRequest,
            cancel: &CancellationToken,
        ) -> std::result::Result<Vec<u8>, FetchError> {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            match request {
                PageRequest::PostForm { form, .. } => {
                    let id = form
                        .iter()
                        .find(|(name, _)| name == ACTIVITY_FIELD)
                        .map(|(_, value)| value.clone())
                        .unwrap_or_default();
                    self.log.lock().unwrap().push(format!("POST {id}"));
                    Ok(self.grids.get(&id).cloned().unwrap_or_else(|| race_grid(&[])).into_bytes())
                }
                PageRequest::Get(url) if url.as_str() == BASE => {
                    self.log.lock().unwrap().push("GET landing".to_string());
                    Ok(self.landing.clone().into_bytes())
                }
                PageRequest::Get(url) => {
                    let url = url.to_string();
                    self.log.lock().unwrap().push(url.clone());
                    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                    let delay = self.delays.get(&url).copied().unwrap_or(self.default_delay);
                    let cancelled = tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    if cancelled {
                        return Err(FetchError::Cancelled);
                    }
                    if self.failing.contains(&url) {
                        return Err(FetchError::Status {
                            status: 500,
                            message: "Internal Server Error".to_string(),
                        });
                    }
                    Ok(REPORT.as_bytes().to_vec())
                }
            }
        }
    }

    fn crawler(fetcher: &Arc<ScriptedFetcher>, store: &Arc<MemoryStore>, concurrency: usize) -> Crawler {
        let mut config = CrawlerConfig::new(Url::parse(BASE).unwrap());
        config.concurrency = concurrency;
        config.competition_delay = Duration::ZERO;
        Crawler::new(fetcher.clone(), store.clone(), config)
    }

    #[tokio::test]
    async fn in_flight_races_never_exceed_concurrency() {
        let fetcher = Arc::new(ScriptedFetcher::new(&[("151", &[1, 2, 3, 4, 5, 6, 7, 8]), ("150", &[9, 10, 11])]));
        let store = Arc::new(MemoryStore::new());

        let summary = crawler(&fetcher, &store, 3).run().await.unwrap();

        assert_eq!(summary.competitions, 2);
        assert_eq!(summary.entries, 11);
        assert_eq!(summary.persisted, 11);
        assert_eq!(summary.results, 11 * 4);
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(store.races().len(), 11);
        assert_eq!(store.crawl_log().len(), 11);
    }

    #[tokio::test]
    async fn competitions_are_handshaken_in_order() {
        let fetcher = Arc::new(ScriptedFetcher::new(&[("151", &[1]), ("150", &[2])]));
        let store = Arc::new(MemoryStore::new());

        crawler(&fetcher, &store, 5).run().await.unwrap();

        let handshakes = fetcher
            .requests()
            .into_iter()
            .filter(|r| !r.contains("race_report"))
            .collect::<Vec<_>>();
        assert_eq!(
            handshakes,
            vec!["GET landing", "GET landing", "POST 151", "GET landing", "POST 150"]
        );
    }

    #[tokio::test]
    async fn first_failure_stops_admission_and_drains() {
        let mut fetcher = ScriptedFetcher::new(&[("151", &[1, 2, 3, 4, 5]), ("150", &[6])]);
        fetcher.failing.insert(report_url(1));
        fetcher.delays.insert(report_url(1), Duration::from_millis(5));
        fetcher.delays.insert(report_url(2), Duration::from_millis(60));
        let fetcher = Arc::new(fetcher);
        let store = Arc::new(MemoryStore::new());

        let err = crawler(&fetcher, &store, 2).run().await.unwrap_err();

        match &err {
            CrawlError::Race { url, competition, .. } => {
                assert_eq!(url, &report_url(1));
                assert_eq!(competition, "114年全國中區(1)游泳錦標賽");
            }
            other => panic!("expected race error, got {other:?}"),
        }
        assert!(matches!(err.root(), CrawlError::Fetch(FetchError::Status { status: 500, .. })));

        // Race 2 was already admitted and completes; nothing after the failure starts.
        let mut fetched = fetcher.report_fetches();
        fetched.sort();
        assert_eq!(fetched, vec![report_url(1), report_url(2)]);
        assert_eq!(store.races().len(), 1);
        assert!(!store.crawl_log().iter().any(|log| log.url == report_url(1)));
        assert!(!fetcher.requests().contains(&"POST 150".to_string()));
    }

    #[tokio::test]
    async fn second_run_skips_everything_already_logged() {
        let fetcher = Arc::new(ScriptedFetcher::new(&[("151", &[1, 2, 3]), ("150", &[4])]));
        let store = Arc::new(MemoryStore::new());

        let first = crawler(&fetcher, &store, 2).run().await.unwrap();
        assert_eq!(first.persisted, 4);
        let fetched_after_first = fetcher.report_fetches().len();

        let second = crawler(&fetcher, &store, 2).run().await.unwrap();
        assert_eq!(second.persisted, 0);
        assert_eq!(second.skipped, 4);
        assert_eq!(fetcher.report_fetches().len(), fetched_after_first);
        assert_eq!(store.races().len(), 4);
    }

    #[tokio::test]
    async fn duplicate_urls_are_admitted_once_per_run() {
        let fetcher = Arc::new(ScriptedFetcher::new(&[("151", &[1, 1, 2]), ("150", &[2, 3])]));
        let store = Arc::new(MemoryStore::new());

        let summary = crawler(&fetcher, &store, 5).run().await.unwrap();

        assert_eq!(summary.entries, 5);
        assert_eq!(summary.persisted, 3);
        assert_eq!(fetcher.report_fetches().len(), 3);
    }

    #[tokio::test]
    async fn empty_landing_page_aborts() {
        let mut fetcher = ScriptedFetcher::new(&[]);
        fetcher.landing = "<html><body><form></form></body></html>".to_string();
        let fetcher = Arc::new(fetcher);
        let store = Arc::new(MemoryStore::new());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let err = crawler(&fetcher, &store, 5).with_events(tx).run().await.unwrap_err();
        assert!(matches!(err, CrawlError::NoCompetitions { url } if url == BASE));

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CrawlEvent::Phase(phase) = event {
                phases.push(phase);
            }
        }
        assert_eq!(phases, vec![CrawlPhase::Discovering, CrawlPhase::Aborted]);
    }

    #[tokio::test]
    async fn cancelled_crawl_admits_nothing() {
        let fetcher = Arc::new(ScriptedFetcher::new(&[("151", &[1, 2])]));
        let store = Arc::new(MemoryStore::new());
        let crawler = crawler(&fetcher, &store, 5);
        crawler.cancellation_token().cancel();

        let err = crawler.run().await.unwrap_err();
        assert!(matches!(err, CrawlError::Cancelled));
        assert!(fetcher.report_fetches().is_empty());
        assert!(store.races().is_empty());
    }

    #[tokio::test]
    async fn cancel_mid_flight_drains_and_admits_nothing_more() {
        let mut scripted = ScriptedFetcher::new(&[("151", &[1, 2, 3, 4, 5, 6]), ("150", &[7])]);
        scripted.default_delay = Duration::from_secs(10);
        let fetcher = Arc::new(scripted);
        let store = Arc::new(MemoryStore::new());
        let crawler = crawler(&fetcher, &store, 2);
        let cancel = crawler.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let err = crawler.run().await.unwrap_err();

        assert!(matches!(err, CrawlError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(fetcher.report_fetches(), vec![report_url(1), report_url(2)]);
        assert_eq!(fetcher.in_flight.load(Ordering::SeqCst), 0);
        assert!(!fetcher.requests().contains(&"POST 150".to_string()));
        assert!(store.races().is_empty());
        assert!(store.crawl_log().is_empty());
    }
}
