use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::error::StoreError;
use super::types::{CrawlLog, Race, RaceId};

/// `persist_race` must make a race visible together with all of its results.
/// `record_crawl_log` may return [`StoreError::Conflict`] for a URL that is
/// already logged; callers treat that as success.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn persist_race(&self, race: &Race) -> Result<RaceId, StoreError>;

    async fn is_crawled(&self, url: &str) -> Result<bool, StoreError>;

    async fn record_crawl_log(&self, url: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    races: Vec<(RaceId, Race)>,
    crawl_log: HashMap<String, CrawlLog>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn races(&self) -> Vec<(RaceId, Race)> {
        self.state
            .lock()
            .map(|state| state.races.clone())
            .unwrap_or_default()
    }

    pub fn crawl_log(&self) -> Vec<CrawlLog> {
        let mut entries = self
            .state
            .lock()
            .map(|state| state.crawl_log.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.url.cmp(&b.url));
        entries
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn persist_race(&self, race: &Race) -> Result<RaceId, StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        let id = RaceId(state.races.len() as u64 + 1);
        state.races.push((id, race.clone()));
        Ok(id)
    }

    async fn is_crawled(&self, url: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(state.crawl_log.contains_key(url))
    }

    async fn record_crawl_log(&self, url: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        if state.crawl_log.contains_key(url) {
            return Err(StoreError::Conflict {
                url: url.to_string(),
            });
        }
        state.crawl_log.insert(
            url.to_string(),
            CrawlLog {
                url: url.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }
}
