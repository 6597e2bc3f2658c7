//! In-process broker for tests.
//!
//! Connect and publish failures can be scripted. Deliveries are pushed from
//! the test body onto an append-only log, and each subscription reads that
//! log from an offset the way a stream queue does. `drop_connection` ends
//! the current subscription the way a broker restart would.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::broker::{Connector, Delivery, QueueSession};
use crate::error::{AppError, Result};

#[derive(Default)]
struct Inner {
    fail_connects: usize,
    connect_attempts: usize,
    fail_publishes: usize,
    fail_subscribes: usize,
    published: Vec<Vec<u8>>,
    acked: Vec<(usize, u64)>,
    rejected: Vec<(usize, u64)>,
    subscriptions: Vec<Option<u64>>,
    closed: usize,
    sessions: usize,
    log: Vec<Vec<u8>>,
    /// Log lengths at which the active subscription ends
    drops: VecDeque<usize>,
    /// Subscriptions without an offset start at the end of the log
    start_at_end: bool,
}

/// Shared handle; clones observe the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
}

impl MemoryBroker {
    /// Subscriptions without an offset read from the start of the log.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            appended: Arc::new(Notify::new()),
        }
    }

    /// Subscriptions without an offset only see later deliveries.
    pub fn tail_only() -> Self {
        let broker = Self::new();
        broker.lock().start_at_end = true;
        broker
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.lock().fail_connects = count;
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().fail_publishes = count;
    }

    pub fn fail_next_subscribes(&self, count: usize) {
        self.lock().fail_subscribes = count;
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Payloads the broker has confirmed, in publish order.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.lock().published.clone()
    }

    /// `(session, tag)` pairs, sessions numbered from 1.
    pub fn acked(&self) -> Vec<(usize, u64)> {
        self.lock().acked.clone()
    }

    pub fn rejected(&self) -> Vec<(usize, u64)> {
        self.lock().rejected.clone()
    }

    pub fn subscriptions(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Offset requested by each successful subscription.
    pub fn subscribe_offsets(&self) -> Vec<Option<u64>> {
        self.lock().subscriptions.clone()
    }

    pub fn closed(&self) -> usize {
        self.lock().closed
    }

    pub fn push_delivery(&self, data: impl Into<Vec<u8>>) {
        self.lock().log.push(data.into());
        self.appended.notify_waiters();
    }

    /// End the active subscription once all earlier deliveries are read.
    pub fn drop_connection(&self) {
        let mut inner = self.lock();
        let at = inner.log.len();
        inner.drops.push_back(at);
        drop(inner);
        self.appended.notify_waiters();
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession> {
        let mut inner = self.lock();
        inner.connect_attempts += 1;
        if inner.fail_connects > 0 {
            inner.fail_connects -= 1;
            return Err(AppError::ConnectionLost("connection refused".to_string()));
        }
        inner.sessions += 1;
        Ok(MemorySession {
            broker: self.clone(),
            id: inner.sessions,
            cursor: None,
            next_tag: 1,
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

pub struct MemorySession {
    broker: MemoryBroker,
    id: usize,
    /// Next log offset to deliver; `None` until subscribed
    cursor: Option<usize>,
    next_tag: u64,
}

impl MemorySession {
    /// Next delivery already in the log, or `Some(None)` if the
    /// subscription ended. `None` means wait for more.
    fn poll_log(&mut self) -> Option<Option<Delivery>> {
        let cursor = self.cursor?;
        let mut inner = self.broker.lock();

        if inner.drops.front().is_some_and(|&at| cursor >= at) {
            inner.drops.pop_front();
            drop(inner);
            self.cursor = None;
            return Some(None);
        }

        let data = inner.log.get(cursor)?.clone();
        drop(inner);
        self.cursor = Some(cursor + 1);
        let tag = self.next_tag;
        self.next_tag += 1;
        Some(Some(Delivery {
            tag,
            offset: Some(cursor as u64),
            data,
        }))
    }
}

#[async_trait]
impl QueueSession for MemorySession {
    async fn publish(&mut self, payload: &[u8]) -> Result<()> {
        let mut inner = self.broker.lock();
        if inner.fail_publishes > 0 {
            inner.fail_publishes -= 1;
            return Err(AppError::ConnectionLost("channel closed".to_string()));
        }
        inner.published.push(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&mut self, _consumer_tag: &str, resume_from: Option<u64>) -> Result<()> {
        let mut inner = self.broker.lock();
        if inner.fail_subscribes > 0 {
            inner.fail_subscribes -= 1;
            return Err(AppError::ConnectionLost("channel closed".to_string()));
        }
        inner.subscriptions.push(resume_from);
        let start = match resume_from {
            Some(offset) => offset as usize,
            None if inner.start_at_end => inner.log.len(),
            None => 0,
        };
        self.cursor = Some(start);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        loop {
            self.cursor?;
            let appended = self.broker.appended.clone();
            let notified = appended.notified();
            match self.poll_log() {
                Some(Some(delivery)) => return Some(Ok(delivery)),
                Some(None) => return None,
                None => notified.await,
            }
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        self.broker.lock().acked.push((self.id, tag));
        Ok(())
    }

    async fn reject(&mut self, tag: u64) -> Result<()> {
        self.broker.lock().rejected.push((self.id, tag));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.cursor = None;
        self.broker.lock().closed += 1;
        Ok(())
    }
}
