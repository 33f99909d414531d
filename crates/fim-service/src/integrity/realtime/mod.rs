//! Real-time change collector.
//!
//! A dedicated OS thread blocks on the platform [`ChangeSource`]. Each raw
//! batch is reduced to an ordered set of unique paths, held for `rt_delay`
//! so that bursts of writes settle, and then every path is evaluated exactly
//! once. The set lives for one batch only.
//!
//! Queue overflow is reported to the sink as an alert. The changes lost in
//! the overflow are picked up by the next scheduled scan.

pub mod notify_backend;

use crate::integrity::evaluator::Evaluator;
use crate::registry::WatchRegistry;
use fim_core::entry::DetectionMode;
use fim_core::error::{FimError, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// How long one `read_batch` call may block before the shutdown flag is
/// looked at again.
pub const READ_TIMEOUT: Duration = Duration::from_millis(250);

const OVERFLOW_ALERT: &str =
    "real-time event queue overflow; missed changes will be reported by the next scheduled scan";

/// Opaque handle for one installed OS watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchDescriptor(pub u64);

/// One raw notification from the platform mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawNotice {
    /// Something happened to this path (created, written, renamed, removed).
    Changed(PathBuf),
    /// The watched root itself went away; its descriptor is void.
    RootRemoved(WatchDescriptor),
    /// The kernel dropped notifications.
    Overflow,
}

/// Platform change-notification capability.
///
/// Implementations are internally synchronized: `read_batch` blocks on one
/// thread while the registry adds and removes watches from others.
pub trait ChangeSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn start(&self) -> Result<()>;

    fn add_watch(&self, path: &Path, recursive: bool) -> Result<WatchDescriptor>;

    fn remove_watch(&self, descriptor: WatchDescriptor) -> Result<()>;

    /// Wait up to `timeout` for notices. An empty batch means the timeout
    /// elapsed; [`FimError::BackendClosed`] means the source was stopped.
    fn read_batch(&self, timeout: Duration) -> Result<Vec<RawNotice>>;

    fn stop(&self);
}

/// Used where no notification mechanism exists. Paths configured for
/// real-time stay covered by the scheduled scan only.
pub struct UnsupportedBackend;

impl ChangeSource for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn start(&self) -> Result<()> {
        Err(FimError::Unsupported("real-time file notifications".into()))
    }

    fn add_watch(&self, _path: &Path, _recursive: bool) -> Result<WatchDescriptor> {
        Err(FimError::Unsupported("real-time file notifications".into()))
    }

    fn remove_watch(&self, _descriptor: WatchDescriptor) -> Result<()> {
        Ok(())
    }

    fn read_batch(&self, _timeout: Duration) -> Result<Vec<RawNotice>> {
        Err(FimError::BackendClosed)
    }

    fn stop(&self) {}
}

/// The best change source for the current platform.
pub fn platform_backend() -> Arc<dyn ChangeSource> {
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "windows",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    {
        Arc::new(notify_backend::NotifyBackend::new())
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "windows",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    )))]
    {
        Arc::new(UnsupportedBackend)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    Watching,
    Draining,
}

/// What one drained batch amounted to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub notices: usize,
    pub evaluated: usize,
    pub events: usize,
    pub overflowed: bool,
    pub roots_removed: usize,
}

pub struct RealtimeCollector {
    source: Arc<dyn ChangeSource>,
    registry: Arc<WatchRegistry>,
    evaluator: Arc<Evaluator>,
    rt_delay: Duration,
    state: Mutex<CollectorState>,
}

impl RealtimeCollector {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        registry: Arc<WatchRegistry>,
        evaluator: Arc<Evaluator>,
        rt_delay: Duration,
    ) -> Self {
        Self {
            source,
            registry,
            evaluator,
            rt_delay,
            state: Mutex::new(CollectorState::Idle),
        }
    }

    pub fn state(&self) -> CollectorState {
        *self.state.lock()
    }

    fn set_state(&self, state: CollectorState) {
        *self.state.lock() = state;
    }

    /// Deduplicate, delay and evaluate one raw batch.
    ///
    /// A removed root stays registered until the batch has been evaluated,
    /// so its stored entries are still covered and come out as deletions.
    pub fn process_batch(&self, batch: Vec<RawNotice>) -> BatchReport {
        let mut report = BatchReport {
            notices: batch.len(),
            ..Default::default()
        };
        let mut unique = BTreeSet::new();
        let mut vanished = Vec::new();
        for notice in batch {
            match notice {
                RawNotice::Changed(path) => {
                    unique.insert(path);
                }
                RawNotice::RootRemoved(descriptor) => {
                    if let Some(root) = self.registry.descriptor_root(descriptor) {
                        unique.insert(root);
                    }
                    vanished.push(descriptor);
                }
                RawNotice::Overflow => report.overflowed = true,
            }
        }

        if report.overflowed {
            warn!(backend = self.source.name(), "real-time queue overflow");
            self.evaluator.sink().alert(OVERFLOW_ALERT);
        }

        if !unique.is_empty() {
            if !self.rt_delay.is_zero() {
                thread::sleep(self.rt_delay);
            }
            for path in &unique {
                trace!(path = %path.display(), "real-time evaluation");
                let events = self
                    .evaluator
                    .evaluate_path(path, DetectionMode::Realtime, None);
                report.events += events.len();
            }
            report.evaluated = unique.len();
        }

        for descriptor in vanished {
            if let Some(root) = self.registry.remove_descriptor(descriptor) {
                debug!(path = %root.display(), "watched root removed");
                report.roots_removed += 1;
            }
        }
        report
    }

    /// Start the reader thread. It runs until the shutdown flag flips or
    /// the source is stopped.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<thread::JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("fim-realtime".into())
            .spawn(move || self.run(shutdown))?;
        Ok(handle)
    }

    fn run(&self, shutdown: watch::Receiver<bool>) {
        self.set_state(CollectorState::Watching);
        info!(backend = self.source.name(), "real-time collector started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.source.read_batch(READ_TIMEOUT) {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => {
                    self.set_state(CollectorState::Draining);
                    let report = self.process_batch(batch);
                    debug!(
                        notices = report.notices,
                        evaluated = report.evaluated,
                        events = report.events,
                        "real-time batch drained"
                    );
                    self.set_state(CollectorState::Watching);
                }
                Err(FimError::BackendClosed) => {
                    debug!("real-time backend closed");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "real-time read failed");
                    thread::sleep(READ_TIMEOUT);
                }
            }
        }
        self.set_state(CollectorState::Idle);
        info!("real-time collector stopped");
    }
}
