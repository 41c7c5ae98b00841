//! Core types and traits for the snip URL shortener.
//!
//! This crate holds the record model and the storage contract shared by
//! the storage engines and the shortener service.

pub mod error;
pub mod record;
pub mod storage;

pub use error::{Result, StorageError};
pub use record::{short_url, DeleteRequest, UrlRecord};
pub use storage::{BatchOutcome, Storage, StoreOutcome};
