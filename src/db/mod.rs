//! Durable report storage.
//!
//! SQLite keeps per-day failure report collections and daily aggregate
//! snapshots.

mod aggregate;
mod models;
mod store;

pub use models::*;
pub use store::*;
