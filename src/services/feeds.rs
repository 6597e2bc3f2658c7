// src/services/feeds.rs

//! Feed fetching service.
//!
//! Pulls every configured RSS/Atom source once per cycle. Sources are
//! isolated: one unreachable feed is logged and skipped without touching
//! the entries collected from the others.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{FeedItem, FeedSource, ProducerConfig};
use crate::utils::{get_domain, http, resolve_url};

const UNKNOWN_SOURCE: &str = "Unknown";

/// Fetches the current entries of a single feed.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, source: &FeedSource) -> Result<Vec<FeedItem>>;
}

/// Entries gathered from all sources in one cycle.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Entries in source order, then feed order
    pub items: Vec<FeedItem>,
    pub source_failures: usize,
}

/// Fetch all sources with bounded concurrency.
///
/// Results are reassembled in configuration order so the publish order is
/// stable from cycle to cycle.
pub async fn fetch_all(
    fetcher: &dyn FeedFetcher,
    sources: &[FeedSource],
    max_concurrent: usize,
) -> FetchOutcome {
    let mut outcome = FetchOutcome::default();

    let mut results: Vec<(usize, Result<Vec<FeedItem>>)> = stream::iter(sources.iter().enumerate())
        .map(|(index, source)| async move { (index, fetcher.fetch(source).await) })
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;
    results.sort_by_key(|(index, _)| *index);

    for (index, result) in results {
        let source = &sources[index];
        match result {
            Ok(items) => {
                log::debug!("Fetched {} entries from {}", items.len(), source.url);
                outcome.items.extend(items);
            }
            Err(error) => {
                outcome.source_failures += 1;
                log::warn!(
                    "Skipping feed {} ({}): {}",
                    source.url,
                    get_domain(&source.url).unwrap_or_default(),
                    error
                );
            }
        }
    }

    outcome
}

/// HTTP feed fetcher handling RSS 2.0 and Atom documents.
pub struct HttpFeedFetcher {
    client: Client,
}

impl HttpFeedFetcher {
    pub fn new(config: &ProducerConfig) -> Result<Self> {
        Ok(Self {
            client: http::create_async_client(config)?,
        })
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, source: &FeedSource) -> Result<Vec<FeedItem>> {
        let response = self.client.get(&source.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::feed(
                &source.url,
                format!("HTTP {}", status.as_u16()),
            ));
        }

        let body = response.bytes().await?;
        parse_feed(source, &body)
    }
}

/// Parse a feed document, trying RSS first and then Atom.
pub fn parse_feed(source: &FeedSource, body: &[u8]) -> Result<Vec<FeedItem>> {
    match rss::Channel::read_from(body) {
        Ok(channel) => Ok(items_from_rss(source, &channel)),
        Err(rss_err) => match atom_syndication::Feed::read_from(body) {
            Ok(feed) => Ok(items_from_atom(source, &feed)),
            Err(atom_err) => Err(AppError::feed(
                &source.url,
                format!(
                    "not an RSS or Atom document (rss: {}; atom: {})",
                    rss_err, atom_err
                ),
            )),
        },
    }
}

fn source_name(source: &FeedSource, feed_title: &str) -> String {
    source
        .name
        .clone()
        .or_else(|| Some(feed_title.trim().to_string()).filter(|t| !t.is_empty()))
        .unwrap_or_else(|| UNKNOWN_SOURCE.to_string())
}

fn items_from_rss(source: &FeedSource, channel: &rss::Channel) -> Vec<FeedItem> {
    let name = source_name(source, channel.title());

    channel
        .items()
        .iter()
        .filter_map(|item| {
            let link = item.link().map(str::trim).filter(|l| !l.is_empty())?;
            Some(FeedItem {
                title: item.title().map(str::to_string),
                summary: item.description().map(str::to_string),
                link: link.to_string(),
                published: item.pub_date().map(str::to_string),
                source: name.clone(),
            })
        })
        .collect()
}

fn items_from_atom(source: &FeedSource, feed: &atom_syndication::Feed) -> Vec<FeedItem> {
    let name = source_name(source, feed.title().as_str());
    let base = Url::parse(&source.url).ok();

    feed.entries()
        .iter()
        .filter_map(|entry| {
            // Prefer the alternate link, as feed readers do
            let href = entry
                .links()
                .iter()
                .find(|link| link.rel() == "alternate")
                .or_else(|| entry.links().first())
                .map(|link| link.href().trim())
                .filter(|href| !href.is_empty())?;
            let link = match &base {
                Some(base) => resolve_url(base, href),
                None => href.to_string(),
            };

            let summary = entry
                .summary()
                .map(|s| s.as_str().to_string())
                .or_else(|| entry.content().and_then(|c| c.value().map(str::to_string)));
            let published = entry
                .published()
                .copied()
                .unwrap_or_else(|| *entry.updated());

            Some(FeedItem {
                title: Some(entry.title().as_str().to_string()),
                summary,
                link,
                published: Some(published.to_rfc3339()),
                source: name.clone(),
            })
        })
        .collect()
}
