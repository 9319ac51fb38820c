#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! mailstream: at-least-once IMAP ingestion pipeline
//!
//! Two cooperating roles over a shared append-only log. The producer
//! polls an IMAP mailbox incrementally (UID/UIDVALIDITY cursor) and
//! appends normalized records; the worker consumes them through a
//! consumer group with idempotent processing, exponential-backoff
//! retry, dead-letter routing, and orphan reclaim. Both roles carry
//! the same supervision plane: circuit breakers, correlation IDs,
//! graceful shutdown, health endpoints, and Prometheus metrics.

pub mod auth;
pub mod backoff;
pub mod breaker;
pub mod config;
pub mod correlation;
pub mod dlq;
mod error;
pub mod health;
pub mod idempotency;
pub mod imap;
pub mod metrics;
pub mod processor;
pub mod producer;
pub mod record;
pub mod recovery;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use config::{ProducerConfig, Provider, WorkerConfig};
pub use error::{Error, Result};
pub use processor::{ClassifyingHandler, Processor, RecordHandler};
pub use producer::Producer;
pub use record::{DlqEnvelope, MailRecord};
pub use shutdown::{Lifecycle, ShutdownCoordinator};
pub use worker::Worker;
