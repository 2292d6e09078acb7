use std::fs;
use std::sync::Arc;

use aquascore_crawler::app::data_io::{FileStore, RACES_FILE};
use aquascore_crawler::app::portal::ACTIVITY_FIELD;
use aquascore_crawler::app::types::DataFormat;
use aquascore_crawler::app::{CrawlError, Crawler, CrawlerConfig, HttpFetcher, Persistence};
use mockito::{Matcher, Mock, ServerGuard};
use url::Url;

const LANDING: &str = include_str!("fixtures/landing.html");
const RACE_LIST: &str = include_str!("fixtures/race_list.html");
const REPORT_PRIMARY: &str = include_str!("fixtures/report_primary.html");
const REPORT_LEGACY: &str = include_str!("fixtures/report_legacy.html");

const PORTAL_PATH: &str = "/CTSA/public/race/game_data.aspx";
const REPORT_PATH: &str = "/CTSA/public/race/race_report.aspx";

const EMPTY_GRID: &str = "<html><body><form><table id=\"ctl00_ContentPlaceHolder1_GridView1\">\
    <tr><th>日期</th><th>場次</th><th>項目</th><th>成績</th></tr></table></form></body></html>";

struct Portal {
    server: ServerGuard,
    reports: Vec<Mock>,
    _mocks: Vec<Mock>,
}

impl Portal {
    async fn start() -> Self {
        let mut server = mockito::Server::new_async().await;
        let mut mocks = Vec::new();

        mocks.push(
            server
                .mock("GET", PORTAL_PATH)
                .with_status(200)
                .with_header("content-type", "text/html; charset=utf-8")
                .with_header("set-cookie", "ASP.NET_SessionId=s3ss10n; path=/; HttpOnly")
                .with_body(LANDING)
                .create_async()
                .await,
        );
        for (activity, grid) in [("151", RACE_LIST), ("150", EMPTY_GRID)] {
            mocks.push(
                server
                    .mock("POST", PORTAL_PATH)
                    .match_header("cookie", Matcher::Regex("ASP.NET_SessionId=s3ss10n".to_string()))
                    .match_body(Matcher::AllOf(vec![
                        Matcher::UrlEncoded(ACTIVITY_FIELD.to_string(), activity.to_string()),
                        Matcher::UrlEncoded(
                            "__VIEWSTATE".to_string(),
                            "dDwtMTA4NzM0NjQ4Mzs7Pg==".to_string(),
                        ),
                    ]))
                    .with_status(200)
                    .with_body(grid)
                    .create_async()
                    .await,
            );
        }

        let mut reports = Vec::new();
        for (id, body) in [
            ("1001", REPORT_PRIMARY),
            ("1002", REPORT_PRIMARY),
            ("1003", REPORT_LEGACY),
        ] {
            reports.push(
                server
                    .mock("GET", REPORT_PATH)
                    .match_query(Matcher::UrlEncoded("id".to_string(), id.to_string()))
                    .with_status(200)
                    .with_body(body)
                    .expect(1)
                    .create_async()
                    .await,
            );
        }

        Self {
            server,
            reports,
            _mocks: mocks,
        }
    }

    fn config(&self) -> CrawlerConfig {
        let base = Url::parse(&format!("{}{PORTAL_PATH}", self.server.url())).unwrap();
        let mut config = CrawlerConfig::new(base);
        config.competition_delay = std::time::Duration::ZERO;
        config
    }
}

async fn crawl(portal: &Portal, store: Arc<dyn Persistence>) -> aquascore_crawler::app::error::Result<aquascore_crawler::app::CrawlSummary> {
    let config = portal.config();
    let fetcher = Arc::new(HttpFetcher::new(&config).unwrap());
    Crawler::new(fetcher, store, config).run().await
}

#[tokio::test]
async fn crawls_portal_into_file_store_once() {
    let portal = Portal::start().await;
    let dir = tempfile::tempdir().unwrap();

    let store = Arc::new(FileStore::open(dir.path(), DataFormat::Csv).unwrap());
    let first = crawl(&portal, store.clone()).await.unwrap();
    store.finish().unwrap();

    assert_eq!(first.competitions, 2);
    assert_eq!(first.entries, 3);
    assert_eq!(first.persisted, 3);
    assert_eq!(first.results, 4 + 4 + 2);

    let journal = fs::read_to_string(dir.path().join(RACES_FILE)).unwrap();
    let races = journal
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(races.len(), 3);
    for race in &races {
        assert_eq!(race["year"], "114");
        assert_eq!(race["competition_name"], "全國中區(1)游泳錦標賽");
    }
    let heat = races
        .iter()
        .find(|race| race["event_name"].as_str().unwrap().contains("預賽"))
        .unwrap();
    assert!(
        heat["results"]
            .as_array()
            .unwrap()
            .iter()
            .all(|result| result["rank"] == 0 && result["score"] == 0)
    );

    // A fresh store over the same directory sees every report as crawled.
    let reopened = Arc::new(FileStore::open(dir.path(), DataFormat::Csv).unwrap());
    let second = crawl(&portal, reopened.clone()).await.unwrap();
    reopened.finish().unwrap();

    assert_eq!(second.persisted, 0);
    assert_eq!(second.skipped, 3);
    for report in &portal.reports {
        report.assert_async().await;
    }
    let journal = fs::read_to_string(dir.path().join(RACES_FILE)).unwrap();
    assert_eq!(journal.lines().count(), 3);
}

#[tokio::test]
async fn failing_report_aborts_with_context() {
    let mut server = mockito::Server::new_async().await;
    let _landing = server
        .mock("GET", PORTAL_PATH)
        .with_status(200)
        .with_body(LANDING)
        .create_async()
        .await;
    let _grid = server
        .mock("POST", PORTAL_PATH)
        .with_status(200)
        .with_body(RACE_LIST)
        .create_async()
        .await;
    let _reports = server
        .mock("GET", REPORT_PATH)
        .match_query(Matcher::Any)
        .with_status(503)
        .create_async()
        .await;

    let base = Url::parse(&format!("{}{PORTAL_PATH}", server.url())).unwrap();
    let mut config = CrawlerConfig::new(base);
    config.concurrency = 1;
    let fetcher = Arc::new(HttpFetcher::new(&config).unwrap());
    let store = Arc::new(aquascore_crawler::app::MemoryStore::new());

    let err = Crawler::new(fetcher, store.clone(), config)
        .run()
        .await
        .unwrap_err();

    match &err {
        CrawlError::Race { url, title, .. } => {
            assert!(url.ends_with("race_report.aspx?id=1001"));
            assert_eq!(title, "11 & 12歲級女子組游泳 400公尺混合式 計時決賽");
        }
        other => panic!("expected race error, got {other:?}"),
    }
    assert!(store.races().is_empty());
    assert!(store.crawl_log().is_empty());
}
