//! # mailwave-store
//!
//! Persistent storage for the send pipeline, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every domain model.
//! Counters and the credit ledger are only ever changed through single
//! conditional `UPDATE` statements so that concurrent writers never lose an
//! update.

pub mod campaigns;
pub mod contacts;
pub mod credits;
pub mod database;
pub mod email_sends;
pub mod migrations;
pub mod models;
pub mod send_queues;
pub mod unsubscribes;
pub mod users;

mod error;
mod rows;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
