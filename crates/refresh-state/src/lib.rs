//! refresh-state: embedded state store for the rollout orchestrator.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for application records, unit states, upgrade sessions, and the
//! audit trail.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{app}:{ordinal}`, `{app}:{seq}`) are zero-padded so a
//! range scan over one application returns its records in order.
//!
//! Sessions are committed with compare-and-set on their `generation`, so a
//! writer that derived its decision from stale state is told to retry
//! instead of overwriting a newer decision.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{SessionCommit, StateStore};
pub use types::*;
