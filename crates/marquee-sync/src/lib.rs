//! Offline-first collection sync for Marquee.
//!
//! [`LocalMirror`] is the device-side cache, [`CollectionStore`] the
//! authoritative side, and [`Synchronizer`] reconciles them using the rules
//! in [`merge`].

pub mod collections;
pub mod error;
pub mod merge;
pub mod mirror;
pub mod retry;
pub mod store;
pub mod synchronizer;

pub use collections::{Collections, WriteOutcome};
pub use error::{Result, SyncError};
pub use mirror::{EntryState, LocalMirror, MirrorSnapshot, Origin, Tracked};
pub use retry::{spawn_periodic_retry, RetryHandle};
pub use store::{CollectionStore, InMemoryCollectionStore, StoreStats};
pub use synchronizer::{PartialSyncFailure, SyncConflict, SyncOp, SyncReport, Synchronizer};
