//! SQLite persistence for the invoice sync pipeline.
//!
//! One [`SqliteStore`] implements every repository trait of the core crate
//! over a single connection.

mod audit;
mod invoices;
mod packages;
mod requests;
mod schema;
mod store;
mod watermarks;

pub use store::{SqliteStore, StoreError};
