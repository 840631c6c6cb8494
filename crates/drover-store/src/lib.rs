//! Persistence layer for the Drover control plane.
//!
//! The store is the single writer-of-record: every component treats it as
//! the source of truth and never caches authoritative state longer than one
//! request. The store also owns the change-notification fan-out — after each
//! committed mutation it publishes a [`ChangeEvent`] on the affected topic.
//!
//! # Main types
//!
//! - [`RegistryStore`] / [`QueueStore`] / [`CommandStore`] — Traits behind
//!   which the relational store sits.
//! - [`SqliteStore`] — Production implementation backed by SQLite, with the
//!   atomic claim executed as a single conditional `UPDATE … RETURNING`.
//! - [`ChangeFeed`] — Topic-keyed publish/subscribe hub, decoupled from the
//!   store technology.

/// Topic-keyed change-notification fan-out.
pub mod feed;
/// SQLite schema bootstrap.
pub mod schema;
/// SQLite-backed store implementation.
pub mod sqlite;
/// Store traits: the seam between components and the persistence layer.
pub mod traits;

pub use feed::{ChangeEvent, ChangeFeed, Topic, DEFAULT_FEED_CAPACITY};
pub use sqlite::SqliteStore;
pub use traits::{CommandStore, QueueStore, RegistryStore};
