//! Shared building blocks for Marquee: identity and role types, collection
//! records, store errors, configuration and telemetry.

pub mod collection;
pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use collection::{
    CollectionEntry, CollectionKind, ConvergedState, EntryKey, HistoryEntry, WatchlistEntry,
};
pub use config::{Config, ConfigError};
pub use error::{StoreError, StoreResult};
pub use types::{Identity, ItemId, ProfileId, Role};
