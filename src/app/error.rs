use std::time::Duration;

use thiserror::Error;

use super::types::RaceListEntry;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("fetch cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// The crawl log already holds this URL. Callers treat it as recorded.
    #[error("crawl log already contains {url}")]
    Conflict { url: String },

    #[error("store state poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("html parse error: {0}")]
    Parse(String),

    #[error("extraction error: {0}")]
    Extraction(String),

    #[error("persistence error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid portal url: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),

    #[error("no competitions found at {url}")]
    NoCompetitions { url: String },

    #[error("crawl cancelled")]
    Cancelled,

    #[error("race worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("competition {competition}: {source}")]
    Competition {
        competition: String,
        #[source]
        source: Box<CrawlError>,
    },

    #[error("race {competition} [{title}] ({url}): {source}")]
    Race {
        competition: String,
        title: String,
        url: String,
        #[source]
        source: Box<CrawlError>,
    },
}

impl CrawlError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction(msg.into())
    }

    pub fn in_competition(self, competition: &str) -> Self {
        Self::Competition {
            competition: competition.to_string(),
            source: Box::new(self),
        }
    }

    pub fn in_race(self, entry: &RaceListEntry) -> Self {
        Self::Race {
            competition: entry.competition_name.clone(),
            title: entry.race_title.clone(),
            url: entry.results_url.to_string(),
            source: Box::new(self),
        }
    }

    pub fn root(&self) -> &CrawlError {
        match self {
            Self::Competition { source, .. } | Self::Race { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T, E = CrawlError> = std::result::Result<T, E>;
