//! Scheduled publication monitor.
//!
//! Polls feeds that are expected to publish within a daily window, decides
//! whether each publication is on time, late, missing or stale, and raises
//! tiered alerts through the [`notify`] crate.
//!
//! # Architecture
//!
//! - [`poller`] fetches payloads behind the [`poller::FeedSource`] trait
//! - [`classifier`] turns a snapshot plus history into a [`Classification`]
//! - [`dedup`] hashes the semantic content of a payload
//! - [`escalation`] maps classifications to alert tiers with cooldown and quiet hours
//! - [`store`] persists state atomically as JSON
//! - [`pipeline`] schedules it all and hands alerts to the dispatcher
//!
//! The `pubwatch-supervisor` binary in the `supervisor` crate runs the
//! pipeline as a child process and keeps it alive.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod calendar;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod error;
pub mod escalation;
pub mod feed;
pub mod heartbeat;
pub mod logging;
pub mod pipeline;
pub mod poller;
pub mod shutdown;
pub mod snapshot;
pub mod store;

pub use calendar::Calendar;
pub use classifier::{BusinessDayDelta, Classification, Classifier, PublicationState};
pub use config::Config;
pub use error::{ClassificationInputError, ConfigError, Error, PersistenceError, Result, TransportError};
pub use escalation::{Escalator, QuietHours};
pub use feed::FeedDefinition;
pub use heartbeat::Heartbeat;
pub use pipeline::{Monitor, Pipeline};
pub use poller::{FeedSource, HttpFeedSource, Poller};
pub use snapshot::{FeedSnapshot, FetchStatus, Publication};
pub use store::{MonitorState, StateStore};
