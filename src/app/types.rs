use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use url::Url;

use super::normalize::duration_millis;

pub const CURRENT_SEASON_URL: &str = "https://ctsa.utk.com.tw/CTSA/public/race/game_data.aspx";

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const MAX_CONCURRENCY: usize = 64;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_COMPETITION_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Parser, Clone)]
#[command(
    name = "aquascore-crawler",
    version,
    about = "Crawl swimming competition results into a local race store"
)]
pub struct Cli {
    /// ROC season year of the portal to crawl (e.g. 113). Defaults to the current season.
    #[arg(long, value_name = "YEAR", conflicts_with = "base_url")]
    pub year: Option<String>,

    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    #[arg(short, long, value_name = "DIR", default_value = "aquascore-data")]
    pub output_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = FileFormatArg::Csv)]
    pub format: FileFormatArg,

    #[arg(long, value_name = "N", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    #[arg(long, value_name = "MS", default_value_t = 5000)]
    pub timeout_ms: u64,

    #[arg(long, value_name = "MS", default_value_t = 100)]
    pub delay_ms: u64,

    #[arg(long, value_name = "UA")]
    pub user_agent: Option<String>,

    /// Crawl into memory only; nothing is written and nothing counts as crawled.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

impl Cli {
    pub fn portal_url(&self) -> String {
        if let Some(url) = &self.base_url {
            return url.clone();
        }
        match self.year.as_deref().map(str::trim) {
            Some(year) if !year.is_empty() => {
                format!("https://ctsa.utk.com.tw/CTSA_{year}/public/race/game_data.aspx")
            }
            _ => CURRENT_SEASON_URL.to_string(),
        }
    }

    pub fn crawler_config(&self) -> Result<CrawlerConfig, url::ParseError> {
        Ok(CrawlerConfig {
            base_url: Url::parse(&self.portal_url())?,
            concurrency: sanitize_concurrency(self.concurrency),
            fetch_timeout: Duration::from_millis(self.timeout_ms.max(1)),
            competition_delay: Duration::from_millis(self.delay_ms),
            user_agent: self.user_agent.clone(),
        })
    }
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum FileFormatArg {
    Csv,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Json,
}

impl From<FileFormatArg> for DataFormat {
    fn from(value: FileFormatArg) -> Self {
        match value {
            FileFormatArg::Csv => DataFormat::Csv,
            FileFormatArg::Json => DataFormat::Json,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub base_url: Url,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub competition_delay: Duration,
    pub user_agent: Option<String>,
}

impl CrawlerConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            concurrency: DEFAULT_CONCURRENCY,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            competition_delay: DEFAULT_COMPETITION_DELAY,
            user_agent: None,
        }
    }
}

pub fn sanitize_concurrency(value: usize) -> usize {
    value.clamp(1, MAX_CONCURRENCY)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCompetition {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceListEntry {
    pub competition_name: String,
    pub race_title: String,
    pub results_url: Url,
}

impl RaceListEntry {
    pub fn is_qualifier(&self) -> bool {
        self.race_title.contains("預賽") || self.race_title.contains("快組計時決賽")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Race {
    pub organizer: String,
    pub year: String,
    pub competition_type: String,
    pub competition_name: String,
    pub gender: String,
    pub age_group: String,
    pub event_type: String,
    pub event_name: String,
    #[serde(with = "duration_millis")]
    pub official_record: Duration,
    #[serde(with = "duration_millis")]
    pub national_record: Duration,
    pub event_date: NaiveDate,
    pub results: Vec<RaceResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceResult {
    pub unit: String,
    pub athlete_names: Vec<String>,
    #[serde(with = "duration_millis")]
    pub record: Duration,
    pub rank: i32,
    pub score: i32,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaceId(pub u64);

impl std::fmt::Display for RaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlLog {
    pub url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlPhase {
    Discovering,
    PerCompetition { index: usize, total: usize },
    Draining,
    Done,
    Aborted,
}

#[derive(Debug)]
pub enum CrawlEvent {
    Phase(CrawlPhase),
    Competition {
        name: String,
        races: usize,
    },
    Skipped {
        url: String,
    },
    Persisted {
        race_id: RaceId,
        title: String,
        results: usize,
    },
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub competitions: usize,
    pub entries: usize,
    pub persisted: usize,
    pub skipped: usize,
    pub results: usize,
}
