//! Change source on top of the `notify` crate (inotify, ReadDirectoryChangesW,
//! FSEvents or kqueue depending on the platform).
//!
//! The notify callback runs on notify's own thread; it only forwards into a
//! std channel which `read_batch` drains.

use super::{ChangeSource, RawNotice, WatchDescriptor};
use fim_core::error::{FimError, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, info, warn};

type NotifyResult = std::result::Result<Event, notify::Error>;

pub struct NotifyBackend {
    watcher: Mutex<Option<RecommendedWatcher>>,
    events: Mutex<Option<mpsc::Receiver<NotifyResult>>>,
    roots: Mutex<HashMap<WatchDescriptor, PathBuf>>,
    next_descriptor: AtomicU64,
}

impl NotifyBackend {
    pub fn new() -> Self {
        Self {
            watcher: Mutex::new(None),
            events: Mutex::new(None),
            roots: Mutex::new(HashMap::new()),
            next_descriptor: AtomicU64::new(1),
        }
    }

    fn classify(&self, result: NotifyResult, out: &mut Vec<RawNotice>) {
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "file watcher error");
                return;
            }
        };
        if event.need_rescan() {
            out.push(RawNotice::Overflow);
            return;
        }
        match &event.kind {
            EventKind::Access(_) => {}
            EventKind::Remove(_) => {
                let roots = self.roots.lock();
                for path in &event.paths {
                    if let Some((descriptor, _)) = roots.iter().find(|(_, root)| *root == path) {
                        out.push(RawNotice::RootRemoved(*descriptor));
                    }
                    out.push(RawNotice::Changed(path.clone()));
                }
            }
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
                out.extend(event.paths.iter().cloned().map(RawNotice::Changed));
            }
        }
    }
}

impl Default for NotifyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSource for NotifyBackend {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn start(&self) -> Result<()> {
        let mut watcher_slot = self.watcher.lock();
        if watcher_slot.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel::<NotifyResult>();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(map_notify_error)?;
        *watcher_slot = Some(watcher);
        drop(watcher_slot);
        *self.events.lock() = Some(rx);
        info!("notify backend started");
        Ok(())
    }

    fn add_watch(&self, path: &Path, recursive: bool) -> Result<WatchDescriptor> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        {
            let mut watcher = self.watcher.lock();
            let watcher = watcher.as_mut().ok_or(FimError::BackendClosed)?;
            watcher.watch(path, mode).map_err(map_notify_error)?;
        }
        let descriptor = WatchDescriptor(self.next_descriptor.fetch_add(1, Ordering::Relaxed));
        self.roots.lock().insert(descriptor, path.to_path_buf());
        debug!(path = %path.display(), recursive, "watch added");
        Ok(descriptor)
    }

    fn remove_watch(&self, descriptor: WatchDescriptor) -> Result<()> {
        let Some(path) = self.roots.lock().remove(&descriptor) else {
            return Ok(());
        };
        let mut watcher = self.watcher.lock();
        if let Some(watcher) = watcher.as_mut() {
            // The OS may already have dropped the watch with the directory.
            if let Err(err) = watcher.unwatch(&path) {
                debug!(path = %path.display(), error = %err, "unwatch failed");
            }
        }
        Ok(())
    }

    fn read_batch(&self, timeout: Duration) -> Result<Vec<RawNotice>> {
        let raw = {
            let events = self.events.lock();
            let rx = events.as_ref().ok_or(FimError::BackendClosed)?;
            let first = match rx.recv_timeout(timeout) {
                Ok(event) => event,
                Err(mpsc::RecvTimeoutError::Timeout) => return Ok(Vec::new()),
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(FimError::BackendClosed),
            };
            let mut raw = vec![first];
            raw.extend(rx.try_iter());
            raw
        };
        let mut notices = Vec::with_capacity(raw.len());
        for result in raw {
            self.classify(result, &mut notices);
        }
        Ok(notices)
    }

    fn stop(&self) {
        // Dropping the watcher drops the channel sender, which wakes a
        // blocked reader with `Disconnected`.
        let stopped = self.watcher.lock().take().is_some();
        self.roots.lock().clear();
        *self.events.lock() = None;
        if stopped {
            info!("notify backend stopped");
        }
    }
}

fn map_notify_error(err: notify::Error) -> FimError {
    let path = err.paths.first().cloned().unwrap_or_default();
    match err.kind {
        notify::ErrorKind::MaxFilesWatch => {
            FimError::ResourceExhaustion("kernel watch table is full".into())
        }
        notify::ErrorKind::PathNotFound | notify::ErrorKind::WatchNotFound => {
            FimError::access(path, io::Error::from(io::ErrorKind::NotFound))
        }
        notify::ErrorKind::Io(io_err) if is_no_space(&io_err) => {
            FimError::ResourceExhaustion(format!("cannot add watch: {io_err}"))
        }
        notify::ErrorKind::Io(io_err) => FimError::access(path, io_err),
        notify::ErrorKind::Generic(message) => FimError::Io(io::Error::new(io::ErrorKind::Other, message)),
        notify::ErrorKind::InvalidConfig(config) => {
            FimError::Io(io::Error::new(io::ErrorKind::InvalidInput, format!("{config:?}")))
        }
    }
}

#[cfg(unix)]
fn is_no_space(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOSPC)
}

#[cfg(not(unix))]
fn is_no_space(_err: &io::Error) -> bool {
    false
}
