//! Data model, persistence and wire protocol of the file integrity monitor.

pub mod config;
pub mod entry;
pub mod error;
pub mod event;
pub mod paths;
pub mod sink;
pub mod store;
pub mod sync;

pub use config::{FimConfig, ModeFlags, WatchPolicy, WatchedPath};
pub use entry::{Checks, DetectionMode, FileAttributes, FileEntry, HashAlgorithm};
pub use error::{FimError, Result};
pub use event::{Actor, ChangeEvent, ChangeKind, EventRecord};
pub use sink::EventSink;
pub use store::{EntryStore, StoreOutcome};
