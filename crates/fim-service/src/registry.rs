//! Watch registry: the set of configured paths and the OS-level resources
//! installed for them.
//!
//! Registration validates the path, installs a real-time watch and/or an
//! audit rule according to the path's *effective* mode, and keeps the
//! descriptor → root index the real-time collector uses. Paths that cannot be
//! registered yet stay pending and are retried before every scheduled scan.
//!
//! The registry lock is never held while calling into a backend.

use crate::integrity::realtime::{ChangeSource, WatchDescriptor};
use crate::integrity::whodata::AuditRules;
use fim_core::config::{ModeFlags, WatchPolicy, WatchedPath};
use fim_core::entry::DetectionMode;
use fim_core::error::{FimError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A registered watched path together with its compiled policy and the
/// resources currently installed for it.
#[derive(Debug, Clone)]
pub struct Registration {
    pub config: WatchedPath,
    pub policy: WatchPolicy,
    /// Modes actually in force; differs from `config.mode` while whodata is
    /// degraded to real-time.
    pub effective: ModeFlags,
    pub descriptor: Option<WatchDescriptor>,
    pub audit_rule: bool,
    pub is_dir: bool,
}

impl Registration {
    pub fn root(&self) -> &Path {
        &self.config.path
    }

    pub fn detection_mode(&self) -> DetectionMode {
        self.effective.primary()
    }
}

struct AuditBinding {
    rules: Arc<dyn AuditRules>,
    key: String,
}

#[derive(Default)]
struct RegistryState {
    active: BTreeMap<PathBuf, Registration>,
    pending: BTreeMap<PathBuf, WatchedPath>,
    descriptors: HashMap<WatchDescriptor, PathBuf>,
    whodata_degraded: bool,
}

#[derive(Default)]
pub struct WatchRegistry {
    realtime: Option<Arc<dyn ChangeSource>>,
    audit: Option<AuditBinding>,
    state: Mutex<RegistryState>,
}

/// Real-time watches are only installed where whodata is not in force.
fn needs_watch(effective: ModeFlags) -> bool {
    effective.contains(ModeFlags::REALTIME) && !effective.contains(ModeFlags::WHODATA)
}

fn degraded(configured: ModeFlags) -> ModeFlags {
    (configured - ModeFlags::WHODATA) | ModeFlags::REALTIME
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_realtime(mut self, source: Arc<dyn ChangeSource>) -> Self {
        self.realtime = Some(source);
        self
    }

    pub fn with_audit(mut self, rules: Arc<dyn AuditRules>, key: impl Into<String>) -> Self {
        self.audit = Some(AuditBinding {
            rules,
            key: key.into(),
        });
        self
    }

    /// Register a watched path. On `Configuration` errors the path is kept
    /// pending. `ResourceExhaustion` means the path is registered but has no
    /// real-time watch; the scheduled scan still covers it.
    pub fn register(&self, watched: WatchedPath) -> Result<()> {
        let policy = watched.policy()?;
        let path = watched.path.clone();
        let whodata_degraded = {
            let state = self.state.lock();
            if state.active.contains_key(&path) {
                return Err(FimError::configuration(&path, "already registered"));
            }
            state.whodata_degraded
        };

        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) => {
                self.keep_pending(watched);
                return Err(FimError::configuration(&path, format!("cannot register: {err}")));
            }
        };
        if !metadata.is_dir() && !metadata.is_file() {
            self.keep_pending(watched);
            return Err(FimError::configuration(
                &path,
                "neither a directory nor a regular file",
            ));
        }
        let is_dir = metadata.is_dir();

        let mut effective = watched.mode | ModeFlags::SCHEDULED;
        let mut audit_rule = false;
        if effective.contains(ModeFlags::WHODATA) {
            match (&self.audit, whodata_degraded) {
                (Some(audit), false) => match audit.rules.add_rule(&path, &audit.key) {
                    Ok(()) => audit_rule = true,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "audit rule not installed, using real-time");
                        effective = degraded(effective);
                    }
                },
                _ => effective = degraded(effective),
            }
        }

        let mut exhausted = None;
        let descriptor = if needs_watch(effective) {
            match self.install_watch(&path, is_dir, watched.depth) {
                Ok(descriptor) => descriptor,
                Err(err @ FimError::ResourceExhaustion(_)) => {
                    warn!(path = %path.display(), error = %err, "real-time watch not installed");
                    exhausted = Some(err);
                    None
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "real-time watch not installed");
                    None
                }
            }
        } else {
            None
        };

        info!(
            path = %path.display(),
            mode = %effective.primary(),
            depth = watched.depth,
            "path registered"
        );
        let registration = Registration {
            config: watched,
            policy,
            effective,
            descriptor,
            audit_rule,
            is_dir,
        };
        {
            let mut state = self.state.lock();
            state.pending.remove(&path);
            if let Some(descriptor) = descriptor {
                state.descriptors.insert(descriptor, path.clone());
            }
            state.active.insert(path, registration);
        }
        match exhausted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Reverse `register`. Returns false when the path was not known.
    pub fn unregister(&self, path: &Path) -> Result<bool> {
        let registration = {
            let mut state = self.state.lock();
            let was_pending = state.pending.remove(path).is_some();
            let Some(registration) = state.active.remove(path) else {
                return Ok(was_pending);
            };
            if let Some(descriptor) = registration.descriptor {
                state.descriptors.remove(&descriptor);
            }
            registration
        };
        if let (Some(descriptor), Some(source)) = (registration.descriptor, &self.realtime) {
            source.remove_watch(descriptor)?;
        }
        if let (true, Some(audit)) = (registration.audit_rule, &self.audit) {
            audit.rules.remove_rule(path, &audit.key)?;
        }
        info!(path = %path.display(), "path unregistered");
        Ok(true)
    }

    /// Retry every pending path. Returns how many were registered.
    pub fn retry_pending(&self) -> usize {
        let pending: Vec<WatchedPath> = self.state.lock().pending.values().cloned().collect();
        let mut registered = 0;
        for watched in pending {
            let path = watched.path.clone();
            match self.register(watched) {
                Ok(()) => registered += 1,
                Err(FimError::ResourceExhaustion(_)) => registered += 1,
                Err(err) => debug!(path = %path.display(), error = %err, "still pending"),
            }
        }
        registered
    }

    pub fn pending(&self) -> Vec<PathBuf> {
        self.state.lock().pending.keys().cloned().collect()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.state.lock().active.values().cloned().collect()
    }

    pub fn get(&self, root: &Path) -> Option<Registration> {
        self.state.lock().active.get(root).cloned()
    }

    /// The registration covering `path`, by longest root prefix.
    pub fn watched_for(&self, path: &Path) -> Option<Registration> {
        let state = self.state.lock();
        state
            .active
            .iter()
            .filter(|(root, _)| path.starts_with(root))
            .max_by_key(|(root, _)| root.components().count())
            .map(|(_, registration)| registration.clone())
    }

    pub fn effective_mode(&self, root: &Path) -> Option<ModeFlags> {
        self.state.lock().active.get(root).map(|r| r.effective)
    }

    pub fn descriptor_root(&self, descriptor: WatchDescriptor) -> Option<PathBuf> {
        self.state.lock().descriptors.get(&descriptor).cloned()
    }

    /// Forget a descriptor whose root vanished. The root goes back to pending
    /// so it is watched again once it reappears.
    pub fn remove_descriptor(&self, descriptor: WatchDescriptor) -> Option<PathBuf> {
        let root = {
            let mut state = self.state.lock();
            let root = state.descriptors.remove(&descriptor)?;
            if let Some(registration) = state.active.remove(&root) {
                state.pending.insert(root.clone(), registration.config);
            }
            root
        };
        if let Some(source) = &self.realtime {
            if let Err(err) = source.remove_watch(descriptor) {
                debug!(path = %root.display(), error = %err, "cannot release watch");
            }
        }
        Some(root)
    }

    pub fn is_whodata_degraded(&self) -> bool {
        self.state.lock().whodata_degraded
    }

    /// Active roots configured for whodata.
    pub fn whodata_paths(&self) -> Vec<PathBuf> {
        self.state
            .lock()
            .active
            .values()
            .filter(|r| r.config.mode.contains(ModeFlags::WHODATA))
            .map(|r| r.config.path.clone())
            .collect()
    }

    /// Install the audit rule of every whodata root. Stops at the first
    /// failure.
    pub fn install_audit_rules(&self) -> Result<usize> {
        let Some(audit) = &self.audit else {
            return Err(FimError::AuditUnavailable("no audit rule backend".into()));
        };
        let mut installed = 0;
        for root in self.whodata_paths() {
            audit.rules.add_rule(&root, &audit.key)?;
            if let Some(registration) = self.state.lock().active.get_mut(&root) {
                registration.audit_rule = true;
            }
            installed += 1;
        }
        Ok(installed)
    }

    /// Fall back to real-time monitoring for every whodata root. Returns the
    /// number of roots that changed mode.
    pub fn degrade_whodata(&self, reason: &str) -> usize {
        let to_watch: Vec<(PathBuf, bool, usize)> = {
            let mut state = self.state.lock();
            state.whodata_degraded = true;
            state
                .active
                .values_mut()
                .filter(|r| r.effective.contains(ModeFlags::WHODATA))
                .map(|r| {
                    r.effective = degraded(r.config.mode);
                    (r.config.path.clone(), r.is_dir, r.config.depth)
                })
                .collect()
        };
        if to_watch.is_empty() {
            return 0;
        }
        warn!(paths = to_watch.len(), reason, "whodata degraded to real-time");
        for (root, is_dir, depth) in &to_watch {
            self.attach_watch(root, *is_dir, *depth);
        }
        to_watch.len()
    }

    /// Put whodata back in force after a successful reload. Returns the
    /// number of roots that changed mode.
    pub fn restore_whodata(&self) -> usize {
        let (restored, to_unwatch) = {
            let mut state = self.state.lock();
            state.whodata_degraded = false;
            let mut restored = 0;
            let mut to_unwatch = Vec::new();
            for registration in state.active.values_mut() {
                if registration.config.mode.contains(ModeFlags::WHODATA)
                    && !registration.effective.contains(ModeFlags::WHODATA)
                {
                    registration.effective = registration.config.mode;
                    restored += 1;
                    if !needs_watch(registration.effective) {
                        if let Some(descriptor) = registration.descriptor.take() {
                            to_unwatch.push(descriptor);
                        }
                    }
                }
            }
            for descriptor in &to_unwatch {
                state.descriptors.remove(descriptor);
            }
            (restored, to_unwatch)
        };
        if let Some(source) = &self.realtime {
            for descriptor in to_unwatch {
                if let Err(err) = source.remove_watch(descriptor) {
                    debug!(error = %err, "cannot remove real-time watch");
                }
            }
        }
        if restored > 0 {
            info!(paths = restored, "whodata restored");
        }
        restored
    }

    fn attach_watch(&self, root: &Path, is_dir: bool, depth: usize) {
        if self
            .state
            .lock()
            .active
            .get(root)
            .map_or(true, |r| r.descriptor.is_some())
        {
            return;
        }
        match self.install_watch(root, is_dir, depth) {
            Ok(Some(descriptor)) => {
                let mut state = self.state.lock();
                if let Some(registration) = state.active.get_mut(root) {
                    registration.descriptor = Some(descriptor);
                    state.descriptors.insert(descriptor, root.to_path_buf());
                }
            }
            Ok(None) => {}
            Err(err) => warn!(path = %root.display(), error = %err, "real-time watch not installed"),
        }
    }

    fn install_watch(&self, path: &Path, is_dir: bool, depth: usize) -> Result<Option<WatchDescriptor>> {
        let Some(source) = &self.realtime else {
            debug!(path = %path.display(), "no real-time backend, scheduled scan only");
            return Ok(None);
        };
        source.add_watch(path, is_dir && depth > 0).map(Some)
    }

    fn keep_pending(&self, watched: WatchedPath) {
        warn!(path = %watched.path.display(), "watched path unavailable, kept pending");
        self.state.lock().pending.insert(watched.path.clone(), watched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::realtime::RawNotice;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSource {
        next: AtomicU64,
        active: Mutex<Vec<WatchDescriptor>>,
    }

    impl ChangeSource for CountingSource {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn start(&self) -> Result<()> {
            Ok(())
        }
        fn add_watch(&self, _path: &Path, _recursive: bool) -> Result<WatchDescriptor> {
            let descriptor = WatchDescriptor(self.next.fetch_add(1, Ordering::SeqCst));
            self.active.lock().push(descriptor);
            Ok(descriptor)
        }
        fn remove_watch(&self, descriptor: WatchDescriptor) -> Result<()> {
            self.active.lock().retain(|d| *d != descriptor);
            Ok(())
        }
        fn read_batch(&self, _timeout: Duration) -> Result<Vec<RawNotice>> {
            Ok(Vec::new())
        }
        fn stop(&self) {}
    }

    struct FullSource;

    impl ChangeSource for FullSource {
        fn name(&self) -> &'static str {
            "full"
        }
        fn start(&self) -> Result<()> {
            Ok(())
        }
        fn add_watch(&self, _path: &Path, _recursive: bool) -> Result<WatchDescriptor> {
            Err(FimError::ResourceExhaustion("no space left on device".into()))
        }
        fn remove_watch(&self, _descriptor: WatchDescriptor) -> Result<()> {
            Ok(())
        }
        fn read_batch(&self, _timeout: Duration) -> Result<Vec<RawNotice>> {
            Ok(Vec::new())
        }
        fn stop(&self) {}
    }

    struct RefusingRules;

    impl AuditRules for RefusingRules {
        fn add_rule(&self, _path: &Path, _key: &str) -> Result<()> {
            Err(FimError::AuditUnavailable("auditd not running".into()))
        }
        fn remove_rule(&self, _path: &Path, _key: &str) -> Result<()> {
            Ok(())
        }
        fn list_rules(&self, _key: &str) -> Result<Vec<PathBuf>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn register_installs_watch_and_indexes_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(CountingSource::default());
        let registry = WatchRegistry::new().with_realtime(source.clone());
        registry
            .register(WatchedPath::new(dir.path(), ModeFlags::REALTIME))
            .unwrap();

        let registration = registry.get(dir.path()).unwrap();
        let descriptor = registration.descriptor.unwrap();
        assert_eq!(registry.descriptor_root(descriptor).unwrap(), dir.path());
        assert_eq!(source.active.lock().len(), 1);

        assert!(registry.unregister(dir.path()).unwrap());
        assert!(source.active.lock().is_empty());
        assert!(registry.descriptor_root(descriptor).is_none());
    }

    #[test]
    fn missing_path_is_pending_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let later = dir.path().join("later");
        let registry = WatchRegistry::new();
        let err = registry
            .register(WatchedPath::new(&later, ModeFlags::SCHEDULED))
            .unwrap_err();
        assert!(matches!(err, FimError::Configuration { .. }));
        assert_eq!(registry.pending(), vec![later.clone()]);
        assert_eq!(registry.retry_pending(), 0);

        std::fs::create_dir(&later).unwrap();
        assert_eq!(registry.retry_pending(), 1);
        assert!(registry.pending().is_empty());
        assert!(registry.get(&later).is_some());
    }

    #[test]
    fn longest_prefix_wins() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        let registry = WatchRegistry::new();
        registry
            .register(WatchedPath::new(dir.path(), ModeFlags::SCHEDULED))
            .unwrap();
        registry
            .register(WatchedPath::new(&inner, ModeFlags::REALTIME))
            .unwrap();

        let found = registry.watched_for(&inner.join("file")).unwrap();
        assert_eq!(found.root(), inner.as_path());
        let found = registry.watched_for(&dir.path().join("other")).unwrap();
        assert_eq!(found.root(), dir.path());
        assert!(registry.watched_for(Path::new("/nonexistent/x")).is_none());
    }

    #[test]
    fn failing_audit_rule_degrades_to_realtime() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(CountingSource::default());
        let registry = WatchRegistry::new()
            .with_realtime(source.clone())
            .with_audit(Arc::new(RefusingRules), "fim_whodata");
        registry
            .register(WatchedPath::new(dir.path(), ModeFlags::WHODATA))
            .unwrap();

        let registration = registry.get(dir.path()).unwrap();
        assert_eq!(registration.detection_mode(), DetectionMode::Realtime);
        assert!(registration.descriptor.is_some());
        assert!(!registration.audit_rule);
    }

    #[test]
    fn degrade_and_restore_swap_watches() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(CountingSource::default());
        let registry = WatchRegistry::new().with_realtime(source.clone());
        // No audit backend bound yet: start degraded explicitly.
        registry.degrade_whodata("audit init failed");
        registry
            .register(WatchedPath::new(dir.path(), ModeFlags::WHODATA))
            .unwrap();
        assert_eq!(
            registry.effective_mode(dir.path()).unwrap().primary(),
            DetectionMode::Realtime
        );
        assert_eq!(source.active.lock().len(), 1);

        assert_eq!(registry.restore_whodata(), 1);
        assert_eq!(
            registry.effective_mode(dir.path()).unwrap().primary(),
            DetectionMode::Whodata
        );
        assert!(source.active.lock().is_empty());
        assert!(!registry.is_whodata_degraded());

        assert_eq!(registry.degrade_whodata("health check timed out"), 1);
        assert_eq!(source.active.lock().len(), 1);
    }

    #[test]
    fn exhausted_watch_table_still_registers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WatchRegistry::new().with_realtime(Arc::new(FullSource));
        let err = registry
            .register(WatchedPath::new(dir.path(), ModeFlags::REALTIME))
            .unwrap_err();
        assert!(matches!(err, FimError::ResourceExhaustion(_)));
        assert!(registry.get(dir.path()).unwrap().descriptor.is_none());
    }

    #[test]
    fn removed_root_goes_back_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WatchRegistry::new().with_realtime(Arc::new(CountingSource::default()));
        registry
            .register(WatchedPath::new(dir.path(), ModeFlags::REALTIME))
            .unwrap();
        let descriptor = registry.get(dir.path()).unwrap().descriptor.unwrap();
        assert_eq!(registry.remove_descriptor(descriptor).unwrap(), dir.path());
        assert!(registry.get(dir.path()).is_none());
        assert_eq!(registry.pending(), vec![dir.path().to_path_buf()]);
    }
}
