//! Crawler for the CTSA swimming results portal.

pub mod app;
