// src/pipeline/batch.rs

//! Batch accumulator with size and interval flush policy.
//!
//! The accumulator owns the buffer and the partition counter. A flush
//! swaps the buffer out in one step and hands the caller a finished
//! [`Batch`], so the size trigger and the interval trigger can never see
//! a half-cleared buffer.

use std::fmt;
use std::mem;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::Result;
use crate::storage::ObjectKey;

/// Delivery tag qualified by the subscription it came from.
pub type TagRef = (u64, u64);

/// UTC date and part counter for object names.
///
/// Process-local: a restart begins again at part 1. Names also carry a
/// timestamp, so they stay unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionState {
    current_date: NaiveDate,
    next_part: u32,
}

impl PartitionState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            current_date: today,
            next_part: 1,
        }
    }

    pub fn current_date(&self) -> NaiveDate {
        self.current_date
    }

    pub fn next_part(&self) -> u32 {
        self.next_part
    }

    /// Move to `date`, resetting the part counter when the day changed.
    /// Returns `true` on rollover.
    pub fn observe(&mut self, date: NaiveDate) -> bool {
        if date == self.current_date {
            return false;
        }
        self.current_date = date;
        self.next_part = 1;
        true
    }

    fn take_part(&mut self) -> u32 {
        let part = self.next_part;
        self.next_part += 1;
        part
    }
}

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Interval,
    Shutdown,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushTrigger::Size => write!(f, "size"),
            FlushTrigger::Interval => write!(f, "interval"),
            FlushTrigger::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A finished, never empty, batch ready for upload.
#[derive(Debug, Clone)]
pub struct Batch {
    pub key: ObjectKey,
    pub part: u32,
    /// Message payloads in append order
    pub records: Vec<Value>,
    /// Unacknowledged deliveries, only populated in after-upload ack mode
    pub delivery_tags: Vec<TagRef>,
    pub trigger: FlushTrigger,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Pretty-printed JSON array of the records.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.records)?)
    }
}

/// In-memory buffer plus flush policy.
#[derive(Debug)]
pub struct BatchAccumulator {
    prefix: String,
    batch_size: usize,
    flush_interval: Duration,
    records: Vec<Value>,
    tags: Vec<TagRef>,
    partition: PartitionState,
    last_flush: Instant,
}

impl BatchAccumulator {
    pub fn new(
        prefix: impl Into<String>,
        batch_size: usize,
        flush_interval: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            batch_size: batch_size.max(1),
            flush_interval,
            records: Vec::with_capacity(batch_size),
            tags: Vec::new(),
            partition: PartitionState::new(now.date_naive()),
            last_flush: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn partition(&self) -> &PartitionState {
        &self.partition
    }

    /// Append one record; returns the batch if this append filled it.
    pub fn append(&mut self, record: Value, tag: Option<TagRef>, now: DateTime<Utc>) -> Option<Batch> {
        self.observe(now);
        self.records.push(record);
        if let Some(tag) = tag {
            self.tags.push(tag);
        }

        if self.records.len() >= self.batch_size {
            Some(self.take(FlushTrigger::Size, now))
        } else {
            None
        }
    }

    /// Whether the flush interval has passed since the last flush.
    pub fn interval_elapsed(&self) -> bool {
        self.last_flush.elapsed() >= self.flush_interval
    }

    /// Interval check, run on a timer independent of deliveries.
    ///
    /// An elapsed interval with an empty buffer restarts the interval
    /// without producing a batch.
    pub fn poll_interval(&mut self, now: DateTime<Utc>) -> Option<Batch> {
        if !self.interval_elapsed() {
            return None;
        }
        if self.records.is_empty() {
            self.last_flush = Instant::now();
            return None;
        }
        log::info!("Flush interval reached with {} buffered records", self.records.len());
        Some(self.take(FlushTrigger::Interval, now))
    }

    /// Final flush on shutdown.
    pub fn drain(&mut self, now: DateTime<Utc>) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        Some(self.take(FlushTrigger::Shutdown, now))
    }

    fn observe(&mut self, now: DateTime<Utc>) {
        if self.partition.observe(now.date_naive()) {
            log::info!(
                "New UTC day {}, part number reset to 1",
                self.partition.current_date()
            );
        }
    }

    fn take(&mut self, trigger: FlushTrigger, now: DateTime<Utc>) -> Batch {
        self.observe(now);
        let part = self.partition.take_part();
        let name = format!(
            "{}_{}_part{}.json",
            self.prefix,
            now.format("%Y%m%dT%H%M%S"),
            part
        );

        let records = mem::replace(&mut self.records, Vec::with_capacity(self.batch_size));
        let delivery_tags = mem::take(&mut self.tags);
        self.last_flush = Instant::now();

        Batch {
            key: ObjectKey::new(self.partition.current_date(), name),
            part,
            records,
            delivery_tags,
            trigger,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    const INTERVAL: Duration = Duration::from_secs(15 * 60);

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, hour, minute, 0).unwrap()
    }

    fn record(id: usize) -> Value {
        json!({ "msg_id": id.to_string(), "rss_entry": { "link": format!("https://x/{id}") } })
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_flushes_in_append_order() {
        let mut acc = BatchAccumulator::new("rss_batch", 100, INTERVAL, at(6, 10, 0));

        let batches: Vec<Batch> = (1..=250)
            .filter_map(|i| acc.append(record(i), None, at(6, 10, 0)))
            .collect();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[1].len(), 100);
        assert_eq!(batches[0].records[0]["msg_id"], "1");
        assert_eq!(batches[1].records[0]["msg_id"], "101");
        assert!(batches.iter().all(|b| b.trigger == FlushTrigger::Size));
        assert_eq!(acc.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_object_names_and_part_numbers() {
        let mut acc = BatchAccumulator::new("rss_batch", 2, INTERVAL, at(6, 10, 0));

        acc.append(record(1), None, at(6, 10, 15));
        let first = acc.append(record(2), None, at(6, 10, 15)).unwrap();
        acc.append(record(3), None, at(6, 10, 30));
        let second = acc.append(record(4), None, at(6, 10, 30)).unwrap();

        assert_eq!(first.part, 1);
        assert_eq!(first.key.name, "rss_batch_20250106T101500_part1.json");
        assert_eq!(
            first.key.path("raw_rss_feed"),
            "raw_rss_feed/2025-01-06/rss_batch_20250106T101500_part1.json"
        );
        assert_eq!(second.key.name, "rss_batch_20250106T103000_part2.json");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_never_flushes() {
        let mut acc = BatchAccumulator::new("rss_batch", 100, INTERVAL, at(6, 10, 0));

        tokio::time::advance(INTERVAL * 3).await;
        assert!(acc.interval_elapsed());
        assert!(acc.poll_interval(at(6, 10, 45)).is_none());
        assert!(!acc.interval_elapsed());
        assert!(acc.drain(at(6, 10, 45)).is_none());
        assert_eq!(acc.partition().next_part(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_partial_batch() {
        let mut acc = BatchAccumulator::new("rss_batch", 100, INTERVAL, at(6, 10, 0));
        acc.append(record(1), None, at(6, 10, 1));

        tokio::time::advance(INTERVAL - Duration::from_secs(1)).await;
        assert!(acc.poll_interval(at(6, 10, 14)).is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let batch = acc.poll_interval(at(6, 10, 15)).unwrap();
        assert_eq!(batch.trigger, FlushTrigger::Interval);
        assert_eq!(batch.len(), 1);
        assert!(acc.is_empty());

        // The interval restarts after a flush
        acc.append(record(2), None, at(6, 10, 16));
        assert!(acc.poll_interval(at(6, 10, 16)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_day_rollover_resets_part_number() {
        let mut acc = BatchAccumulator::new("rss_batch", 1, INTERVAL, at(6, 23, 0));

        let before = acc.append(record(1), None, at(6, 23, 59)).unwrap();
        let _ = acc.append(record(2), None, at(6, 23, 59)).unwrap();
        let after = acc.append(record(3), None, at(7, 0, 1)).unwrap();

        assert_eq!(before.part, 1);
        assert_eq!(after.part, 1);
        assert_eq!(before.key.date.to_string(), "2025-01-06");
        assert_eq!(after.key.date.to_string(), "2025-01-07");
        assert_eq!(acc.partition().next_part(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover_is_seen_before_flush() {
        let mut acc = BatchAccumulator::new("rss_batch", 100, INTERVAL, at(6, 23, 0));
        acc.append(record(1), None, at(6, 23, 59));
        acc.append(record(2), None, at(7, 0, 0));

        assert_eq!(acc.partition().current_date().to_string(), "2025-01-07");
        let batch = acc.drain(at(7, 0, 0)).unwrap();
        assert_eq!(batch.trigger, FlushTrigger::Shutdown);
        assert_eq!(batch.key.name, "rss_batch_20250107T000000_part1.json");
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_round_trip_preserves_order() {
        let mut acc = BatchAccumulator::new("rss_batch", 3, INTERVAL, at(6, 10, 0));
        let inputs = vec![json!({"a": 1}), json!(["x", null]), json!("plain")];

        let mut flushed = None;
        for value in inputs.clone() {
            flushed = acc.append(value, Some((1, 9)), at(6, 10, 0));
        }
        let batch = flushed.unwrap();

        let parsed: Vec<Value> = serde_json::from_slice(&batch.to_payload().unwrap()).unwrap();
        assert_eq!(parsed, inputs);
        assert_eq!(batch.delivery_tags, vec![(1, 9); 3]);
    }
}
