//! Entry evaluator: turns "something happened at this path" into a store
//! update and, when the state really changed, a [`ChangeEvent`].
//!
//! All three sources (scheduled scan, real-time, whodata) end up here. The
//! lookup-and-write per path is one store transaction, so concurrent
//! evaluations of the same path never interleave; the last one wins.

use crate::registry::{Registration, WatchRegistry};
use blake3::Hasher;
use fim_core::entry::{Checks, DetectionMode, FileAttributes, FileEntry, HashAlgorithm};
use fim_core::error::{FimError, Result};
use fim_core::event::{Actor, ChangeEvent};
use fim_core::sink::EventSink;
use fim_core::store::EntryStore;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

pub struct Evaluator {
    store: Arc<EntryStore>,
    registry: Arc<WatchRegistry>,
    sink: Arc<dyn EventSink>,
}

impl Evaluator {
    pub fn new(
        store: Arc<EntryStore>,
        registry: Arc<WatchRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            registry,
            sink,
        }
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Evaluate one file path against its covering watched path.
    pub fn evaluate(
        &self,
        path: &Path,
        mode: DetectionMode,
        actor: Option<Actor>,
    ) -> Result<Vec<ChangeEvent>> {
        let registration = self
            .registry
            .watched_for(path)
            .ok_or_else(|| FimError::policy(path, "not covered by any watched path"))?;
        registration.policy.check(path)?;
        self.observe(path, &registration, mode, actor)
    }

    /// Record the live state of `path` without applying policy. The scanner
    /// uses this for link targets it already vetted under their link path.
    pub fn observe(
        &self,
        path: &Path,
        registration: &Registration,
        mode: DetectionMode,
        actor: Option<Actor>,
    ) -> Result<Vec<ChangeEvent>> {
        let key = path.to_string_lossy();
        let current = collect_entry(path, registration, mode)?;
        let outcome = self.store.apply(&key, current)?;
        let Some(event) = ChangeEvent::from_outcome(outcome, mode, actor.clone()) else {
            return Ok(Vec::new());
        };
        debug!(path = %key, kind = %event.kind(), mode = %mode, "file change");
        let follow_up = match &event {
            ChangeEvent::Added { current, .. } => Some((current.attributes.device, current.attributes.inode)),
            _ => None,
        };
        self.sink.emit(&event);
        let mut events = vec![event];
        if let Some((device, inode)) = follow_up {
            events.extend(self.follow_rename(&key, device, inode, mode, actor));
        }
        Ok(events)
    }

    /// A new path may be the destination of a move whose source was never
    /// reported. Stored paths on the same inode that vanished are deleted.
    fn follow_rename(
        &self,
        added: &str,
        device: u64,
        inode: u64,
        mode: DetectionMode,
        actor: Option<Actor>,
    ) -> Vec<ChangeEvent> {
        if inode == 0 {
            return Vec::new();
        }
        let siblings = match self.store.paths_from_inode(device, inode) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(error = %err, "inode lookup failed");
                return Vec::new();
            }
        };
        let mut events = Vec::new();
        for sibling in siblings.into_iter().filter(|p| p != added) {
            if fs::symlink_metadata(&sibling).is_ok() {
                continue;
            }
            match self.store.apply(&sibling, None) {
                Ok(outcome) => {
                    if let Some(event) = ChangeEvent::from_outcome(outcome, mode, actor.clone()) {
                        debug!(from = %sibling, to = added, "rename source removed");
                        self.sink.emit(&event);
                        events.push(event);
                    }
                }
                Err(err) => warn!(path = %sibling, error = %err, "cannot remove rename source"),
            }
        }
        events
    }

    /// Entry point of the real-time and whodata collectors: evaluates files
    /// and whole subtrees, logs errors instead of returning them.
    pub fn evaluate_path(
        &self,
        path: &Path,
        mode: DetectionMode,
        actor: Option<Actor>,
    ) -> Vec<ChangeEvent> {
        match fs::symlink_metadata(path) {
            Ok(metadata) if metadata.is_dir() => self.evaluate_tree(path, mode, actor),
            Ok(_) => self.evaluate_logged(path, mode, actor),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let mut events = self.evaluate_logged(path, mode, actor.clone());
                events.extend(self.evaluate_stored_below(path, mode, actor));
                events
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot stat path");
                Vec::new()
            }
        }
    }

    /// Evaluate every file below an existing directory, and every stored
    /// entry below it that has disappeared.
    pub fn evaluate_tree(
        &self,
        dir: &Path,
        mode: DetectionMode,
        actor: Option<Actor>,
    ) -> Vec<ChangeEvent> {
        let Some(registration) = self.registry.watched_for(dir) else {
            trace!(path = %dir.display(), "directory not covered");
            return Vec::new();
        };
        let mut events = Vec::new();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !e.file_type().is_dir() || registration.policy.may_descend(e.path()));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(path = %dir.display(), error = %err, "walk error");
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            events.extend(self.evaluate_logged(entry.path(), mode, actor.clone()));
        }
        events.extend(self.evaluate_stored_below(dir, mode, actor));
        events
    }

    fn evaluate_stored_below(
        &self,
        dir: &Path,
        mode: DetectionMode,
        actor: Option<Actor>,
    ) -> Vec<ChangeEvent> {
        let stored = match self.store.paths_under(&dir.to_string_lossy()) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "cannot list stored entries");
                return Vec::new();
            }
        };
        stored
            .into_iter()
            .filter(|p| fs::symlink_metadata(p).is_err())
            .flat_map(|p| self.evaluate_logged(Path::new(&p), mode, actor.clone()))
            .collect()
    }

    fn evaluate_logged(
        &self,
        path: &Path,
        mode: DetectionMode,
        actor: Option<Actor>,
    ) -> Vec<ChangeEvent> {
        match self.evaluate(path, mode, actor) {
            Ok(events) => events,
            Err(err) if err.is_policy() => {
                trace!(path = %path.display(), error = %err, "filtered");
                Vec::new()
            }
            Err(err) => {
                warn!(path = %path.display(), mode = %mode, error = %err, "evaluation failed");
                Vec::new()
            }
        }
    }
}

/// Live state of `path`, or `None` when it is gone or no longer a regular
/// file.
pub fn collect_entry(
    path: &Path,
    registration: &Registration,
    mode: DetectionMode,
) -> Result<Option<FileEntry>> {
    let metadata = if registration.config.follow_symlinks {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    };
    let metadata = match metadata {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(FimError::access(path, err)),
    };
    if !metadata.is_file() {
        trace!(path = %path.display(), "not a regular file");
        return Ok(None);
    }
    let checks = registration.config.checks;
    let mut attributes = file_attributes(&metadata, checks);
    match hash_file(path, &checks.hash_algorithms()) {
        Ok(hashes) => attributes.hashes = hashes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(FimError::access(path, err)),
    }
    Ok(Some(FileEntry::new(path.to_string_lossy(), attributes, mode)))
}

#[cfg(unix)]
fn file_attributes(metadata: &fs::Metadata, checks: Checks) -> FileAttributes {
    use std::os::unix::fs::MetadataExt;

    let mut attributes = FileAttributes::default();
    if checks.contains(Checks::SIZE) {
        attributes.size = metadata.len();
    }
    if checks.contains(Checks::PERMISSIONS) {
        attributes.permissions = metadata.mode();
    }
    if checks.contains(Checks::OWNER) {
        attributes.uid = metadata.uid();
        attributes.user_name = user_name(metadata.uid());
    }
    if checks.contains(Checks::GROUP) {
        attributes.gid = metadata.gid();
        attributes.group_name = group_name(metadata.gid());
    }
    if checks.contains(Checks::MTIME) {
        attributes.mtime = metadata.mtime();
    }
    if checks.contains(Checks::INODE) {
        attributes.inode = metadata.ino();
        attributes.device = metadata.dev();
    }
    attributes
}

#[cfg(not(unix))]
fn file_attributes(metadata: &fs::Metadata, checks: Checks) -> FileAttributes {
    let mut attributes = FileAttributes::default();
    if checks.contains(Checks::SIZE) {
        attributes.size = metadata.len();
    }
    if checks.contains(Checks::PERMISSIONS) {
        attributes.permissions = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
    }
    if checks.contains(Checks::MTIME) {
        attributes.mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64);
    }
    attributes
}

#[cfg(unix)]
pub fn user_name(uid: u32) -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name)
}

#[cfg(not(unix))]
pub fn user_name(_uid: u32) -> Option<String> {
    None
}

#[cfg(unix)]
pub fn group_name(gid: u32) -> Option<String> {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|group| group.name)
}

#[cfg(not(unix))]
pub fn group_name(_gid: u32) -> Option<String> {
    None
}

/// Hash file contents with every requested algorithm in a single read pass.
pub fn hash_file(
    path: &Path,
    algorithms: &[HashAlgorithm],
) -> io::Result<BTreeMap<HashAlgorithm, String>> {
    let mut digests = BTreeMap::new();
    if algorithms.is_empty() {
        return Ok(digests);
    }
    let mut file = fs::File::open(path)?;
    let mut blake3 = algorithms.contains(&HashAlgorithm::Blake3).then(Hasher::new);
    let mut sha256 = algorithms.contains(&HashAlgorithm::Sha256).then(Sha256::new);

    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        if let Some(hasher) = blake3.as_mut() {
            hasher.update(&buffer[..n]);
        }
        if let Some(hasher) = sha256.as_mut() {
            hasher.update(&buffer[..n]);
        }
    }

    if let Some(hasher) = blake3 {
        digests.insert(HashAlgorithm::Blake3, hasher.finalize().to_hex().to_string());
    }
    if let Some(hasher) = sha256 {
        digests.insert(HashAlgorithm::Sha256, hex::encode(hasher.finalize()));
    }
    Ok(digests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fim_core::config::{ModeFlags, WatchedPath};
    use fim_core::event::ChangeKind;
    use fim_core::sink::MemorySink;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<EntryStore>,
        sink: Arc<MemorySink>,
        evaluator: Evaluator,
    }

    fn fixture(configure: impl FnOnce(WatchedPath) -> WatchedPath) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(WatchRegistry::new());
        registry
            .register(configure(WatchedPath::new(dir.path(), ModeFlags::REALTIME)))
            .unwrap();
        let store = Arc::new(EntryStore::open_in_memory().unwrap());
        let sink = Arc::new(MemorySink::new());
        let evaluator = Evaluator::new(store.clone(), registry, sink.clone());
        Fixture {
            dir,
            store,
            sink,
            evaluator,
        }
    }

    #[test]
    fn hash_file_matches_reference_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"hello world").unwrap();
        let digests = hash_file(&path, &[HashAlgorithm::Blake3, HashAlgorithm::Sha256]).unwrap();
        assert_eq!(
            digests[&HashAlgorithm::Blake3],
            blake3::hash(b"hello world").to_hex().to_string()
        );
        assert_eq!(
            digests[&HashAlgorithm::Sha256],
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn add_modify_noop_delete() {
        let f = fixture(|w| w);
        let file = f.dir.path().join("app.conf");
        fs::write(&file, b"one").unwrap();

        let events = f.evaluator.evaluate(&file, DetectionMode::Realtime, None).unwrap();
        assert_eq!(events[0].kind(), ChangeKind::Added);

        assert!(f.evaluator.evaluate(&file, DetectionMode::Realtime, None).unwrap().is_empty());

        fs::write(&file, b"two!").unwrap();
        let events = f.evaluator.evaluate(&file, DetectionMode::Realtime, None).unwrap();
        assert_eq!(events[0].kind(), ChangeKind::Modified);
        let record = events[0].to_record(chrono::Utc::now());
        assert!(record.changed_attributes.contains(&"size".to_string()));

        fs::remove_file(&file).unwrap();
        let events = f.evaluator.evaluate(&file, DetectionMode::Realtime, None).unwrap();
        assert_eq!(events[0].kind(), ChangeKind::Deleted);
        assert_eq!(f.store.count().unwrap(), 0);
        assert_eq!(f.sink.events().len(), 3);
    }

    #[test]
    fn policy_rejections_are_policy_errors() {
        let f = fixture(|w| w.with_ignore("*.tmp"));
        let file = f.dir.path().join("scratch.tmp");
        fs::write(&file, b"x").unwrap();
        let err = f.evaluator.evaluate(&file, DetectionMode::Realtime, None).unwrap_err();
        assert!(err.is_policy());
        let outside = Path::new("/definitely/not/watched");
        assert!(f.evaluator.evaluate(outside, DetectionMode::Realtime, None).unwrap_err().is_policy());
    }

    #[test]
    fn unselected_attributes_stay_zero() {
        let f = fixture(|w| w.with_checks(Checks::SIZE | Checks::SHA256));
        let file = f.dir.path().join("f");
        fs::write(&file, b"abc").unwrap();
        f.evaluator.evaluate(&file, DetectionMode::Scheduled, None).unwrap();
        let stored = f.store.get(&file.to_string_lossy()).unwrap().unwrap();
        assert_eq!(stored.attributes.size, 3);
        assert_eq!(stored.attributes.mtime, 0);
        assert_eq!(stored.attributes.inode, 0);
        assert!(stored.attributes.hashes.contains_key(&HashAlgorithm::Sha256));
        assert!(!stored.attributes.hashes.contains_key(&HashAlgorithm::Blake3));
    }

    #[test]
    fn directory_paths_evaluate_subtrees() {
        let f = fixture(|w| w);
        let sub = f.dir.path().join("sub");
        fs::create_dir_all(sub.join("deeper")).unwrap();
        fs::write(sub.join("a"), b"a").unwrap();
        fs::write(sub.join("deeper").join("b"), b"b").unwrap();

        let events = f.evaluator.evaluate_path(&sub, DetectionMode::Realtime, None);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind() == ChangeKind::Added));

        fs::remove_dir_all(&sub).unwrap();
        let events = f.evaluator.evaluate_path(&sub, DetectionMode::Realtime, None);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind() == ChangeKind::Deleted));
        assert_eq!(f.store.count().unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn rename_destination_removes_vanished_source() {
        let f = fixture(|w| w);
        let from = f.dir.path().join("before.txt");
        let to = f.dir.path().join("after.txt");
        fs::write(&from, b"payload").unwrap();
        f.evaluator.evaluate(&from, DetectionMode::Realtime, None).unwrap();

        fs::rename(&from, &to).unwrap();
        let events = f.evaluator.evaluate(&to, DetectionMode::Realtime, None).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| (e.kind(), e.path().to_string())).collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeKind::Added, to.to_string_lossy().into_owned()),
                (ChangeKind::Deleted, from.to_string_lossy().into_owned()),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn sockets_and_fifos_are_skipped() {
        let f = fixture(|w| w);
        let fifo = f.dir.path().join("pipe");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();
        assert!(f.evaluator.evaluate(&fifo, DetectionMode::Realtime, None).unwrap().is_empty());
        assert_eq!(f.store.count().unwrap(), 0);
    }
}
