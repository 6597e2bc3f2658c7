// src/pipeline/consume.rs

//! Consumer: subscribe, append, flush, upload.
//!
//! Deliveries and the flush-interval timer are driven from one `select!`
//! loop, so the accumulator only ever has one mutator. Batches that fail to
//! upload are kept in order and retried ahead of newer ones; whatever still
//! fails at shutdown is written to the local spill directory.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broker::{ConnectionManager, Connector, Delivery, QueueSession};
use crate::error::Result;
use crate::models::{AckMode, ConsumerConfig, QueueMessage};
use crate::pipeline::batch::{Batch, BatchAccumulator};
use crate::storage::{LocalObjectWriter, ObjectWriter};

/// Failed batches kept in memory before the oldest is spilled to disk.
const MAX_PENDING_BATCHES: usize = 16;

/// Running totals since start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: usize,
    pub rejected: usize,
    pub batches_uploaded: usize,
    pub records_uploaded: usize,
    pub upload_failures: usize,
    pub batches_spilled: usize,
    pub resubscribes: usize,
}

pub struct Consumer<C: Connector> {
    manager: ConnectionManager<C>,
    writer: Box<dyn ObjectWriter>,
    spill: LocalObjectWriter,
    accumulator: BatchAccumulator,
    pending: VecDeque<Batch>,
    ack_mode: AckMode,
    consumer_tag: String,
    flush_check: Duration,
    /// Incremented per subscription; delivery tags are only valid within one
    epoch: u64,
    /// Stream offset of the last delivery seen, where resubscribing resumes
    last_offset: Option<u64>,
    session: Option<C::Session>,
    stats: ConsumerStats,
}

impl<C: Connector> Consumer<C> {
    pub fn new(
        manager: ConnectionManager<C>,
        writer: Box<dyn ObjectWriter>,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            manager,
            writer,
            spill: LocalObjectWriter::new(&config.spill_dir, ""),
            accumulator: BatchAccumulator::new(
                &config.object_prefix,
                config.batch_size,
                config.flush_interval(),
                Utc::now(),
            ),
            pending: VecDeque::new(),
            ack_mode: config.ack_mode,
            consumer_tag: config.consumer_tag.clone(),
            flush_check: config.flush_check(),
            epoch: 0,
            last_offset: None,
            session: None,
            stats: ConsumerStats::default(),
        }
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn buffered(&self) -> usize {
        self.accumulator.len()
    }

    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    pub fn manager(&self) -> &ConnectionManager<C> {
        &self.manager
    }

    /// Consume until `cancel` fires, then flush and disconnect.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        log::info!(
            "RSS consumer running ({:?} ack mode). Press CTRL+C to stop.",
            self.ack_mode
        );

        if self.resubscribe(cancel).await {
            let mut ticker = tokio::time::interval(self.flush_check);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.on_tick().await,
                    delivery = next_delivery(&mut self.session) => {
                        let lost = match delivery {
                            Some(Ok(delivery)) => {
                                self.on_delivery(delivery).await;
                                continue;
                            }
                            Some(Err(error)) => error.to_string(),
                            None => "subscription ended".to_string(),
                        };
                        log::warn!("Lost broker subscription ({}). Reconnecting...", lost);
                        if !self.resubscribe(cancel).await {
                            break;
                        }
                        self.stats.resubscribes += 1;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Replace the session with a fresh, subscribed one.
    ///
    /// Returns `false` only when shutdown is requested first.
    async fn resubscribe(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            if let Some(mut stale) = self.session.take() {
                if let Err(error) = stale.close().await {
                    log::debug!("Closing stale session failed: {}", error);
                }
                self.manager.mark_disconnected();
            }

            let Some(mut session) = self.manager.connect(cancel).await else {
                return false;
            };
            self.epoch += 1;

            let resume_from = self.last_offset.map(|offset| offset + 1);
            match session.subscribe(&self.consumer_tag, resume_from).await {
                Ok(()) => {
                    self.session = Some(session);
                    return true;
                }
                Err(error) => {
                    let delay = self.manager.policy().interval;
                    log::warn!("Subscribe failed: {}. Retrying in {:?}...", error, delay);
                    self.session = Some(session);
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Interval check. A due interval also retries batches still waiting,
    /// so they do not depend on new traffic.
    async fn on_tick(&mut self) {
        let due = self.accumulator.interval_elapsed();
        if let Some(batch) = self.accumulator.poll_interval(Utc::now()) {
            self.flush(batch).await;
        } else if due && !self.pending.is_empty() {
            self.retry_pending().await;
        }
    }

    async fn on_delivery(&mut self, delivery: Delivery) {
        self.stats.received += 1;
        if delivery.offset.is_some() {
            self.last_offset = delivery.offset;
        }

        let record = match QueueMessage::validate_payload(&delivery.data) {
            Ok(record) => record,
            Err(error) => {
                self.stats.rejected += 1;
                log::warn!("Rejecting delivery {}: {}", delivery.tag, error);
                if let Some(session) = self.session.as_mut() {
                    if let Err(error) = session.reject(delivery.tag).await {
                        log::warn!("Reject of delivery {} failed: {}", delivery.tag, error);
                    }
                }
                return;
            }
        };

        let tag = match self.ack_mode {
            AckMode::OnReceipt => {
                self.ack(delivery.tag).await;
                None
            }
            AckMode::AfterUpload => Some((self.epoch, delivery.tag)),
        };

        if let Some(batch) = self.accumulator.append(record, tag, Utc::now()) {
            self.flush(batch).await;
        }
    }

    async fn ack(&mut self, tag: u64) {
        if let Some(session) = self.session.as_mut() {
            if let Err(error) = session.ack(tag).await {
                log::warn!("Ack of delivery {} failed: {}", tag, error);
            }
        }
    }

    /// Ack the deliveries of a stored batch that the current channel still owns.
    async fn ack_batch(&mut self, batch: &Batch) {
        let mut stale = 0;
        for &(epoch, tag) in &batch.delivery_tags {
            if epoch == self.epoch {
                self.ack(tag).await;
            } else {
                stale += 1;
            }
        }
        if stale > 0 {
            log::debug!(
                "Skipped {} acks from an earlier subscription for {}",
                stale,
                batch.key.name
            );
        }
    }

    /// Upload `batch`, behind any earlier batches still waiting.
    async fn flush(&mut self, batch: Batch) {
        self.retry_pending().await;

        if self.pending.is_empty() {
            if let Err(batch) = self.upload(batch).await {
                self.pending.push_back(batch);
            }
        } else {
            self.pending.push_back(batch);
        }

        while self.pending.len() > MAX_PENDING_BATCHES {
            if let Some(oldest) = self.pending.pop_front() {
                self.spill(oldest).await;
            }
        }
    }

    async fn retry_pending(&mut self) {
        while let Some(batch) = self.pending.pop_front() {
            log::info!("Retrying upload of {}", batch.key.name);
            if let Err(batch) = self.upload(batch).await {
                self.pending.push_front(batch);
                break;
            }
        }
    }

    /// One upload attempt. Hands the batch back on failure.
    async fn upload(&mut self, batch: Batch) -> std::result::Result<(), Batch> {
        let result = match batch.to_payload() {
            Ok(payload) => self.writer.upload(&batch.key, payload).await,
            Err(error) => Err(error),
        };

        match result {
            Ok(location) => {
                log::info!(
                    "Uploaded {} (records: {}, part {}, {} flush)",
                    location,
                    batch.len(),
                    batch.part,
                    batch.trigger
                );
                self.stats.batches_uploaded += 1;
                self.stats.records_uploaded += batch.len();
                self.ack_batch(&batch).await;
                Ok(())
            }
            Err(error) => {
                self.stats.upload_failures += 1;
                log::error!(
                    "Upload of {} failed: {}. Keeping {} records for retry",
                    batch.key.name,
                    error,
                    batch.len()
                );
                Err(batch)
            }
        }
    }

    async fn spill(&mut self, batch: Batch) {
        let result = match batch.to_payload() {
            Ok(payload) => self.spill.upload(&batch.key, payload).await,
            Err(error) => Err(error),
        };

        match result {
            Ok(location) => {
                self.stats.batches_spilled += 1;
                log::warn!(
                    "Spilled {} records to {} for manual upload",
                    batch.len(),
                    location
                );
                self.ack_batch(&batch).await;
            }
            Err(error) => log::error!(
                "Could not spill {} under {}: {}. {} records lost",
                batch.key.name,
                self.spill.base_dir().display(),
                error,
                batch.len()
            ),
        }
    }

    async fn shutdown(&mut self) {
        log::info!("Consumer stopping...");
        if let Some(batch) = self.accumulator.drain(Utc::now()) {
            self.pending.push_back(batch);
        }
        self.retry_pending().await;
        while let Some(batch) = self.pending.pop_front() {
            self.spill(batch).await;
        }

        if let Some(mut session) = self.session.take() {
            match session.close().await {
                Ok(()) => log::info!("Broker connection closed safely"),
                Err(error) => log::warn!("Closing broker connection failed: {}", error),
            }
        }
        self.manager.mark_disconnected();

        log::info!(
            "Consumer stopped: {} received, {} rejected, {} batches ({} records) uploaded, {} spilled",
            self.stats.received,
            self.stats.rejected,
            self.stats.batches_uploaded,
            self.stats.records_uploaded,
            self.stats.batches_spilled
        );
    }
}

async fn next_delivery<S: QueueSession>(session: &mut Option<S>) -> Option<Result<Delivery>> {
    match session {
        Some(session) => session.next_delivery().await,
        None => std::future::pending().await,
    }
}
