#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Shared data access layer for Waffle: migrations, stored procedures, and change notifications.

pub mod config;
pub mod error;

pub use config::{ConfigEntryRow, DEFAULT_CHANNEL};
pub use error::{DataError, Result as DataResult};
