//! Connection manager with unconditional reconnect.
//!
//! Transport failures are never fatal: [`ConnectionManager::connect`] keeps
//! retrying with a configurable backoff until a session is established. The
//! only way out without a session is a shutdown request.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::broker::Connector;
use crate::models::BrokerConfig;

/// Backoff between connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub interval: Duration,
    /// Upper bound for the delay
    pub max_interval: Duration,
    /// Growth factor per failed attempt (1.0 keeps the delay fixed)
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(5),
            multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.retry_interval_secs),
            max_interval: Duration::from_secs(config.max_retry_interval_secs),
            multiplier: config.retry_multiplier,
        }
    }

    /// Delay to use after `current` has elapsed without success.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let cap = self.max_interval.max(self.interval);
        let grown = current.mul_f64(self.multiplier.max(1.0));
        grown.min(cap)
    }
}

/// Observable connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    /// Last attempt failed; the next one starts after `delay`
    Retrying { attempt: u32, delay: Duration },
    Connected,
}

impl ConnectionState {
    pub fn is_retrying(&self) -> bool {
        matches!(self, ConnectionState::Retrying { .. })
    }
}

/// Establishes and re-establishes broker sessions.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    policy: RetryPolicy,
    state: watch::Sender<ConnectionState>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            policy,
            state,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Watch connection state changes, e.g. to alert on long retry streaks.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn mark_disconnected(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Connect, retrying forever.
    ///
    /// Returns `None` only when `cancel` fires before a session is up.
    pub async fn connect(&self, cancel: &CancellationToken) -> Option<C::Session> {
        let target = self.connector.describe();
        let mut attempt: u32 = 0;
        let mut delay = self.policy.interval;

        loop {
            attempt = attempt.saturating_add(1);
            self.state
                .send_replace(ConnectionState::Connecting { attempt });

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.mark_disconnected();
                    return None;
                }
                result = self.connector.connect() => result,
            };

            match result {
                Ok(session) => {
                    self.state.send_replace(ConnectionState::Connected);
                    if attempt > 1 {
                        log::info!("Connected to broker {} after {} attempts", target, attempt);
                    } else {
                        log::info!("Connected to broker {}", target);
                    }
                    return Some(session);
                }
                Err(error) => {
                    log::warn!(
                        "Connection to broker {} failed (attempt {}): {}. Retrying in {:?}...",
                        target,
                        attempt,
                        error,
                        delay
                    );
                    self.state
                        .send_replace(ConnectionState::Retrying { attempt, delay });
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.mark_disconnected();
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.policy.next_delay(delay);
        }
    }
}
