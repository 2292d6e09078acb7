pub mod crawl;
pub mod data_io;
pub mod error;
pub mod fetch;
pub mod html;
pub mod normalize;
pub mod portal;
pub mod race;
pub mod runtime;
pub mod store;
pub mod types;

pub use crawl::Crawler;
pub use error::{CrawlError, FetchError, StoreError};
pub use fetch::{HttpFetcher, PageFetcher, PageRequest};
pub use runtime::run;
pub use store::{MemoryStore, Persistence};
pub use types::{CrawlSummary, CrawlerConfig, Race, RaceResult};
