//! Service layer for the ingestion pipeline.
//!
//! This module contains the feed fetching logic (`FeedFetcher`,
//! `HttpFeedFetcher`) used by the producer.

mod feeds;

pub use feeds::{FeedFetcher, FetchOutcome, HttpFeedFetcher, fetch_all, parse_feed};
