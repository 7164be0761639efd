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

//! Runtime configuration overlay: schema-declared variables persisted in a
//! [`ConfigStore`], decoded into a process-local [`LiveConfig`], and kept in step
//! across sibling processes through a pluggable [`Notifier`]/[`Watcher`] pair.
//!
//! Layout: `codec.rs` (storage encoding), `kind.rs` (typed conversions),
//! `schema.rs` (registry + key filter), `stamp.rs` (change timestamps),
//! `store/` (store contract and backends), `sync/` (watch strategies),
//! `settings.rs` (toggles), `state.rs` (`WaffleState`), `form.rs` (editing surface).

pub mod codec;
pub mod error;
pub mod form;
pub mod kind;
pub mod schema;
pub mod settings;
pub mod stamp;
pub mod state;
pub mod store;
pub mod sync;

pub use error::{CodecError, ConfigError, ConfigResult, StoreError, SyncError};
pub use form::RenderedEntry;
pub use kind::ConfigType;
pub use schema::{DEFAULT_RESERVED_PREFIX, KeyFilter, SchemaEntry, SchemaRegistry};
pub use settings::{WaffleSettings, WatchStrategy};
pub use stamp::Timestamp;
pub use state::{LiveConfig, StateObserver, WaffleState, WaffleStateBuilder};
pub use store::{ConfigRecord, ConfigStore, FileStore, MemoryStore, PgStore};
pub use sync::{LocalBus, Notifier, SyncBackend, SyncPair, Watcher};
