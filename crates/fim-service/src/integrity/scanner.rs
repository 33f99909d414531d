//! Scheduled scanner: the ground-truth pass.
//!
//! Walks every registered path depth-first, feeds each file through the
//! evaluator, then sweeps every stored entry that was not seen during the
//! pass. Real-time and whodata evaluations that land during a pass also mark
//! their entries, so they survive the sweep.
//!
//! Symlinks are followed only where the watched path asks for it, at most
//! once per target, and their targets are recorded under canonical paths.

use crate::integrity::evaluator::Evaluator;
use crate::registry::{Registration, WatchRegistry};
use fim_core::entry::DetectionMode;
use fim_core::event::{ChangeEvent, ChangeKind};
use fim_core::store::EntryStore;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub roots: usize,
    pub files: usize,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub errors: usize,
    pub elapsed: Duration,
}

impl ScanSummary {
    fn count(&mut self, events: &[ChangeEvent]) {
        for event in events {
            match event.kind() {
                ChangeKind::Added => self.added += 1,
                ChangeKind::Modified => self.modified += 1,
                ChangeKind::Deleted => self.deleted += 1,
            }
        }
    }

    pub fn changes(&self) -> usize {
        self.added + self.modified + self.deleted
    }
}

pub struct Scanner {
    registry: Arc<WatchRegistry>,
    evaluator: Arc<Evaluator>,
    store: Arc<EntryStore>,
    pass: Mutex<()>,
}

impl Scanner {
    pub fn new(registry: Arc<WatchRegistry>, evaluator: Arc<Evaluator>) -> Self {
        let store = evaluator.store().clone();
        Self {
            registry,
            evaluator,
            store,
            pass: Mutex::new(()),
        }
    }

    /// Run one full pass. Returns `None` when another pass is already running.
    pub fn scan(&self) -> Option<ScanSummary> {
        let Some(_pass) = self.pass.try_lock() else {
            debug!("scan already running, skipping");
            return None;
        };
        let started = Instant::now();
        let mut summary = ScanSummary::default();

        let recovered = self.registry.retry_pending();
        if recovered > 0 {
            info!(paths = recovered, "pending paths registered");
        }

        if let Err(err) = self.store.set_all_unscanned() {
            warn!(error = %err, "cannot start scan pass");
            summary.errors += 1;
            return Some(summary);
        }

        let mut visited = HashSet::new();
        for registration in self.registry.registrations() {
            summary.roots += 1;
            self.walk(&registration, registration.root(), registration.root(), &mut visited, &mut summary);
        }

        match self.store.sweep_not_scanned() {
            Ok(swept) => {
                for previous in swept {
                    let event = ChangeEvent::Deleted {
                        previous,
                        mode: DetectionMode::Scheduled,
                        actor: None,
                    };
                    debug!(path = event.path(), "file deleted");
                    self.evaluator.sink().emit(&event);
                    summary.deleted += 1;
                }
            }
            Err(err) => {
                warn!(error = %err, "sweep failed");
                summary.errors += 1;
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            roots = summary.roots,
            files = summary.files,
            added = summary.added,
            modified = summary.modified,
            deleted = summary.deleted,
            errors = summary.errors,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "scan pass finished"
        );
        Some(summary)
    }

    /// Walk `physical`, which appears under the watched tree as `logical`.
    fn walk(
        &self,
        registration: &Registration,
        logical: &Path,
        physical: &Path,
        visited: &mut HashSet<(u64, u64)>,
        summary: &mut ScanSummary,
    ) {
        if let Some(id) = file_id(physical) {
            visited.insert(id);
        }
        let policy = &registration.policy;
        let walker = WalkDir::new(physical)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                if !entry.file_type().is_dir() {
                    return true;
                }
                let logical_path = relocate(logical, physical, entry.path());
                policy.may_descend(&logical_path) && !policy.is_ignored(&logical_path)
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let vanished = err
                        .io_error()
                        .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound);
                    if !vanished {
                        warn!(path = %physical.display(), error = %err, "walk error");
                        summary.errors += 1;
                    }
                    continue;
                }
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            let logical_path = relocate(logical, physical, entry.path());

            if file_type.is_symlink() {
                if registration.config.follow_symlinks {
                    self.follow_link(registration, &logical_path, entry.path(), visited, summary);
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            if logical == physical {
                self.evaluate(entry.path(), summary);
            } else if policy.check(&logical_path).is_ok() {
                self.observe(registration, entry.path(), summary);
            }
        }
    }

    fn follow_link(
        &self,
        registration: &Registration,
        logical: &Path,
        link: &Path,
        visited: &mut HashSet<(u64, u64)>,
        summary: &mut ScanSummary,
    ) {
        let target = match fs::canonicalize(link) {
            Ok(target) => target,
            Err(err) => {
                debug!(link = %link.display(), error = %err, "dangling symlink");
                return;
            }
        };
        let Ok(metadata) = fs::metadata(&target) else {
            return;
        };
        if let Some(id) = file_id(&target) {
            if !visited.insert(id) {
                debug!(link = %link.display(), target = %target.display(), "link target already visited");
                return;
            }
        }
        if metadata.is_dir() {
            if registration.policy.may_descend(logical) && !registration.policy.is_ignored(logical) {
                self.walk(registration, logical, &target, visited, summary);
            }
        } else if metadata.is_file() && registration.policy.check(logical).is_ok() {
            self.observe(registration, &target, summary);
        }
    }

    fn evaluate(&self, path: &Path, summary: &mut ScanSummary) {
        match self.evaluator.evaluate(path, DetectionMode::Scheduled, None) {
            Ok(events) => {
                summary.files += 1;
                summary.count(&events);
            }
            Err(err) if err.is_policy() => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "scan evaluation failed");
                summary.errors += 1;
            }
        }
    }

    fn observe(&self, registration: &Registration, path: &Path, summary: &mut ScanSummary) {
        match self
            .evaluator
            .observe(path, registration, DetectionMode::Scheduled, None)
        {
            Ok(events) => {
                summary.files += 1;
                summary.count(&events);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "scan evaluation failed");
                summary.errors += 1;
            }
        }
    }
}

/// Map a path found under `physical` to where it appears under `logical`.
fn relocate(logical: &Path, physical: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(physical) {
        Ok(relative) if relative.as_os_str().is_empty() => logical.to_path_buf(),
        Ok(relative) => logical.join(relative),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(unix)]
fn file_id(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).ok().map(|m| (m.dev(), m.ino()))
}

#[cfg(not(unix))]
fn file_id(_path: &Path) -> Option<(u64, u64)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use fim_core::config::{ModeFlags, WatchedPath};
    use fim_core::sink::MemorySink;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn scanner_for(watched: WatchedPath) -> (Scanner, Arc<MemorySink>, Arc<EntryStore>) {
        let registry = Arc::new(WatchRegistry::new());
        registry.register(watched).unwrap();
        let store = Arc::new(EntryStore::open_in_memory().unwrap());
        let sink = Arc::new(MemorySink::new());
        let evaluator = Arc::new(Evaluator::new(store.clone(), registry.clone(), sink.clone()));
        (Scanner::new(registry, evaluator), sink, store)
    }

    #[test]
    fn first_pass_adds_then_quiet() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("a.txt")).unwrap().write_all(b"aaa").unwrap();
        File::create(dir.path().join("b.txt")).unwrap().write_all(b"bbb").unwrap();
        let (scanner, sink, store) = scanner_for(WatchedPath::new(dir.path(), ModeFlags::SCHEDULED));

        let summary = scanner.scan().unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.added, 2);
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(sink.take().len(), 2);

        let summary = scanner.scan().unwrap();
        assert_eq!(summary.changes(), 0);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn deleted_file_is_swept_once() {
        let dir = tempdir().unwrap();
        let victim = dir.path().join("victim");
        std::fs::write(&victim, b"x").unwrap();
        let (scanner, sink, store) = scanner_for(WatchedPath::new(dir.path(), ModeFlags::SCHEDULED));
        scanner.scan().unwrap();
        sink.take();

        std::fs::remove_file(&victim).unwrap();
        let summary = scanner.scan().unwrap();
        assert_eq!(summary.deleted, 1);
        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), ChangeKind::Deleted);
        assert_eq!(store.count().unwrap(), 0);

        assert_eq!(scanner.scan().unwrap().deleted, 0);
    }

    #[test]
    fn depth_and_ignore_limit_the_walk() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("l1/l2")).unwrap();
        std::fs::create_dir_all(dir.path().join("cache")).unwrap();
        std::fs::write(dir.path().join("top"), b"0").unwrap();
        std::fs::write(dir.path().join("l1/one"), b"1").unwrap();
        std::fs::write(dir.path().join("l1/l2/two"), b"2").unwrap();
        std::fs::write(dir.path().join("cache/blob"), b"c").unwrap();
        let watched = WatchedPath::new(dir.path(), ModeFlags::SCHEDULED)
            .with_depth(1)
            .with_ignore(dir.path().join("cache").to_string_lossy().into_owned());
        let (scanner, _, store) = scanner_for(watched);

        let summary = scanner.scan().unwrap();
        assert_eq!(summary.files, 2);
        assert!(store.get(&dir.path().join("l1/one").to_string_lossy()).unwrap().is_some());
        assert!(store.get(&dir.path().join("l1/l2/two").to_string_lossy()).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_followed_once_to_canonical_targets() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("real.conf"), b"cfg").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link-a")).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link-b")).unwrap();
        // A loop back to the root must not recurse.
        std::os::unix::fs::symlink(&root, root.join("loop")).unwrap();

        let (scanner, _, store) =
            scanner_for(WatchedPath::new(&root, ModeFlags::SCHEDULED).following_symlinks());
        let summary = scanner.scan().unwrap();
        assert_eq!(summary.files, 1);
        let canonical = outside.canonicalize().unwrap().join("real.conf");
        assert!(store.get(&canonical.to_string_lossy()).unwrap().is_some());

        // Still present on the next pass: the mark covers canonical paths.
        assert_eq!(scanner.scan().unwrap().deleted, 0);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_ignored_without_follow() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"t").unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink(&target, root.join("link")).unwrap();
        let (scanner, _, store) = scanner_for(WatchedPath::new(&root, ModeFlags::SCHEDULED));
        assert_eq!(scanner.scan().unwrap().files, 0);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn pending_root_is_picked_up_by_next_scan() {
        let dir = tempdir().unwrap();
        let late = dir.path().join("late");
        let registry = Arc::new(WatchRegistry::new());
        assert!(registry
            .register(WatchedPath::new(&late, ModeFlags::SCHEDULED))
            .is_err());
        let store = Arc::new(EntryStore::open_in_memory().unwrap());
        let sink = Arc::new(MemorySink::new());
        let evaluator = Arc::new(Evaluator::new(store, registry.clone(), sink));
        let scanner = Scanner::new(registry, evaluator);
        assert_eq!(scanner.scan().unwrap().files, 0);

        std::fs::create_dir(&late).unwrap();
        std::fs::write(late.join("f"), b"f").unwrap();
        assert_eq!(scanner.scan().unwrap().added, 1);
    }
}
