// src/models/mod.rs

//! Domain models for the ingestion pipeline.
//!
//! This module contains the data structures shared by the producer and the
//! consumer, organized by their primary purpose.

mod config;
mod feed;

// Re-export all public types
pub use config::{
    AckMode, BrokerConfig, Config, ConsumerConfig, LoggingConfig, ProducerConfig, StorageBackend,
    StorageConfig,
};
pub use feed::{FeedItem, FeedSource, QueueMessage};
