// src/lib.rs

//! Feed ingestion library: RSS/Atom producer, stream queue transport and
//! a batching consumer writing date-partitioned objects.

pub mod broker;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
