//! File integrity monitoring agent.
//!
//! Three collectors (scheduled scan, real-time notifications, audit-based
//! whodata) feed one evaluator that keeps the entry store current and emits
//! change events. The synchronizer keeps a remote manager's copy of the
//! store consistent.

pub mod engine;
pub mod integrity;
pub mod registry;

pub use engine::{Components, EngineOptions, FimEngine};
