// src/pipeline/produce.rs

//! Producer: fetch, filter, publish, persist, sleep.
//!
//! Each cycle pulls every configured feed, drops entries whose link was
//! already published, publishes the rest in order and then writes the
//! processed-link set. A publish that fails on the transport reconnects
//! and retries the same message once; if that fails too, the item and
//! everything after it wait for the next cycle.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::{ConnectionManager, Connector, QueueSession};
use crate::error::{AppError, Result};
use crate::models::{FeedSource, ProducerConfig, QueueMessage};
use crate::services::{FeedFetcher, fetch_all};
use crate::storage::{DedupStore, ProcessedLinks};

/// Where the producer is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Fetching,
    Filtering,
    Publishing,
    Persisting,
    Sleeping,
    Stopped,
}

impl fmt::Display for ProducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProducerState::Fetching => "fetching",
            ProducerState::Filtering => "filtering",
            ProducerState::Publishing => "publishing",
            ProducerState::Persisting => "persisting",
            ProducerState::Sleeping => "sleeping",
            ProducerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Counters for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Entries collected from all reachable feeds
    pub fetched: usize,
    /// Entries with an unseen link
    pub new: usize,
    pub published: usize,
    /// Unseen entries left for the next cycle
    pub deferred: usize,
    pub source_failures: usize,
    /// Whether the processed-link set is on disk after this cycle
    pub persisted: bool,
}

pub struct Producer<C: Connector> {
    manager: ConnectionManager<C>,
    fetcher: Box<dyn FeedFetcher>,
    sources: Vec<FeedSource>,
    max_concurrent: usize,
    poll_interval: Duration,
    store: DedupStore,
    processed: ProcessedLinks,
    next_msg_id: u64,
    state: ProducerState,
    session: Option<C::Session>,
    unsaved: bool,
}

impl<C: Connector> Producer<C> {
    pub fn new(
        manager: ConnectionManager<C>,
        fetcher: Box<dyn FeedFetcher>,
        config: &ProducerConfig,
    ) -> Self {
        Self {
            manager,
            fetcher,
            sources: config.feeds.clone(),
            max_concurrent: config.max_concurrent,
            poll_interval: config.poll_interval(),
            store: DedupStore::new(&config.dedup_file),
            processed: ProcessedLinks::new(),
            next_msg_id: 1,
            state: ProducerState::Stopped,
            session: None,
            unsaved: false,
        }
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    pub fn processed(&self) -> &ProcessedLinks {
        &self.processed
    }

    pub fn manager(&self) -> &ConnectionManager<C> {
        &self.manager
    }

    fn set_state(&mut self, state: ProducerState) {
        if self.state != state {
            log::debug!("Producer state: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Read the processed-link set from disk.
    pub async fn load_state(&mut self) -> Result<()> {
        self.processed = self.store.load().await?;
        log::info!(
            "Loaded {} processed links from {}",
            self.processed.len(),
            self.store.path().display()
        );
        Ok(())
    }

    /// Run cycles until `cancel` fires, then persist and disconnect.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.load_state().await?;
        log::info!(
            "Producer running: {} feeds every {:?}",
            self.sources.len(),
            self.poll_interval
        );

        if self.session.is_none() {
            self.session = self.manager.connect(cancel).await;
        }

        while !cancel.is_cancelled() {
            self.run_cycle(cancel).await;

            self.set_state(ProducerState::Sleeping);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One fetch/filter/publish/persist pass.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();

        self.set_state(ProducerState::Fetching);
        log::info!("Fetching {} feeds...", self.sources.len());
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return outcome,
            fetched = fetch_all(self.fetcher.as_ref(), &self.sources, self.max_concurrent) => fetched,
        };
        outcome.fetched = fetched.items.len();
        outcome.source_failures = fetched.source_failures;

        self.set_state(ProducerState::Filtering);
        let fresh = self.processed.filter_new(fetched.items);
        outcome.new = fresh.len();

        if fresh.is_empty() {
            log::info!("No new RSS entries found. Waiting for next interval...");
        } else {
            self.set_state(ProducerState::Publishing);
            let total = fresh.len();
            for (index, item) in fresh.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    outcome.deferred = total - index;
                    break;
                }

                let link = item.link.clone();
                let message = QueueMessage::new(self.next_msg_id, item);
                let result = match message.to_bytes() {
                    Ok(payload) => self.publish_with_retry(&payload, cancel).await,
                    Err(error) => Err(error),
                };

                match result {
                    Ok(()) => {
                        log::debug!(
                            "Sent #{}: {}",
                            message.msg_id,
                            message.rss_entry.title.as_deref().unwrap_or(&link)
                        );
                        self.processed.insert(link);
                        self.next_msg_id += 1;
                        self.unsaved = true;
                        outcome.published += 1;
                    }
                    Err(error) => {
                        outcome.deferred = total - index;
                        log::warn!(
                            "Could not publish {}: {}. Deferring {} entries to the next cycle",
                            link,
                            error,
                            outcome.deferred
                        );
                        break;
                    }
                }
            }
        }

        self.set_state(ProducerState::Persisting);
        outcome.persisted = if self.unsaved { self.save().await } else { true };

        log::info!(
            "Cycle done: {} fetched, {} new, {} published, {} deferred, {}/{} feeds failed",
            outcome.fetched,
            outcome.new,
            outcome.published,
            outcome.deferred,
            outcome.source_failures,
            self.sources.len()
        );
        outcome
    }

    async fn publish_with_retry(&mut self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        if self.session.is_none() {
            self.reconnect(cancel).await?;
        }

        match self.try_publish(payload).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_transient() => {
                log::warn!("Broker connection lost during publish ({}). Reconnecting...", error);
                self.reconnect(cancel).await?;
                self.try_publish(payload).await?;
                log::info!("Reconnected and sent message");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn try_publish(&mut self, payload: &[u8]) -> Result<()> {
        match self.session.as_mut() {
            Some(session) => session.publish(payload).await,
            None => Err(AppError::ConnectionLost("no broker session".to_string())),
        }
    }

    async fn reconnect(&mut self, cancel: &CancellationToken) -> Result<()> {
        if let Some(mut stale) = self.session.take() {
            if let Err(error) = stale.close().await {
                log::debug!("Closing stale session failed: {}", error);
            }
        }
        self.manager.mark_disconnected();

        self.session = self.manager.connect(cancel).await;
        if self.session.is_some() {
            Ok(())
        } else {
            Err(AppError::ConnectionLost(
                "shutdown requested while reconnecting".to_string(),
            ))
        }
    }

    async fn save(&mut self) -> bool {
        match self.store.save(&self.processed).await {
            Ok(()) => {
                self.unsaved = false;
                log::info!(
                    "Saved {} processed links to {}",
                    self.processed.len(),
                    self.store.path().display()
                );
                true
            }
            Err(error) => {
                log::error!(
                    "Failed to save processed links to {}: {}. Keeping them in memory",
                    self.store.path().display(),
                    error
                );
                false
            }
        }
    }

    async fn shutdown(&mut self) {
        self.set_state(ProducerState::Stopped);
        self.save().await;

        if let Some(mut session) = self.session.take() {
            match session.close().await {
                Ok(()) => log::info!("Broker connection closed"),
                Err(error) => log::warn!("Closing broker connection failed: {}", error),
            }
        }
        self.manager.mark_disconnected();
        log::info!("Producer stopped");
    }
}
