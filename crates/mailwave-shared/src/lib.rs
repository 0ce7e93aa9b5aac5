//! # mailwave-shared
//!
//! Domain vocabulary shared by the store and the server: typed identifiers,
//! lifecycle enums, plan tiers, personalization and unsubscribe filtering.
//! Nothing in this crate performs I/O.

pub mod constants;
pub mod error;
pub mod personalize;
pub mod plan;
pub mod types;
pub mod unsubscribe;

pub use error::StatusParseError;
pub use plan::PlanTier;
pub use types::*;
