//! Integration tests for detection across the three collectors.
//!
//! Tests cover:
//!  1. Scheduled scan reports new files once
//!  2. A modification is reported once, then the state is quiet
//!  3. A deletion seen in real time is not reported again by the sweep
//!  4. Real-time batches are deduplicated per path
//!  5. Permission and mtime changes alone change the checksum
//!  6. Whodata falls back to real-time when audit rules cannot be installed
//!  7. Whodata records carry the actor into the event
//!  8. The engine runs an initial scan and stops cleanly

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fim_core::config::{FimConfig, ModeFlags, WatchedPath, WhodataSettings};
use fim_core::entry::DetectionMode;
use fim_core::error::{FimError, Result};
use fim_core::event::{ChangeEvent, ChangeKind};
use fim_core::sink::MemorySink;
use fim_core::store::EntryStore;
use tempfile::tempdir;

use fim_service::integrity::evaluator::Evaluator;
use fim_service::integrity::realtime::{ChangeSource, RawNotice, RealtimeCollector, WatchDescriptor};
use fim_service::integrity::scanner::Scanner;
use fim_service::integrity::whodata::parser::{AuditEvent, PathItem};
use fim_service::integrity::whodata::{AuditRules, WhodataCollector};
use fim_service::registry::WatchRegistry;
use fim_service::{EngineOptions, FimEngine};

/// Real-time source fed by the test instead of the kernel.
#[derive(Default)]
struct ScriptedSource {
    queue: Mutex<VecDeque<Vec<RawNotice>>>,
    watches: Mutex<Vec<PathBuf>>,
    next: AtomicU64,
    closed: AtomicBool,
}

impl ScriptedSource {
    fn push(&self, batch: Vec<RawNotice>) {
        self.queue.lock().unwrap().push_back(batch);
    }
}

impl ChangeSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn add_watch(&self, path: &Path, _recursive: bool) -> Result<WatchDescriptor> {
        self.watches.lock().unwrap().push(path.to_path_buf());
        Ok(WatchDescriptor(self.next.fetch_add(1, Ordering::SeqCst)))
    }

    fn remove_watch(&self, _descriptor: WatchDescriptor) -> Result<()> {
        Ok(())
    }

    fn read_batch(&self, timeout: Duration) -> Result<Vec<RawNotice>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FimError::BackendClosed);
        }
        if let Some(batch) = self.queue.lock().unwrap().pop_front() {
            return Ok(batch);
        }
        std::thread::sleep(timeout.min(Duration::from_millis(10)));
        Ok(Vec::new())
    }

    fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct RefusingRules;

impl AuditRules for RefusingRules {
    fn add_rule(&self, _path: &Path, _key: &str) -> Result<()> {
        Err(FimError::AuditUnavailable("audit daemon not running".into()))
    }
    fn remove_rule(&self, _path: &Path, _key: &str) -> Result<()> {
        Ok(())
    }
    fn list_rules(&self, _key: &str) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct AcceptingRules {
    rules: Mutex<Vec<(PathBuf, String)>>,
}

impl AuditRules for AcceptingRules {
    fn add_rule(&self, path: &Path, key: &str) -> Result<()> {
        self.rules.lock().unwrap().push((path.to_path_buf(), key.to_string()));
        Ok(())
    }
    fn remove_rule(&self, path: &Path, key: &str) -> Result<()> {
        self.rules.lock().unwrap().retain(|(p, k)| p != path || k != key);
        Ok(())
    }
    fn list_rules(&self, key: &str) -> Result<Vec<PathBuf>> {
        Ok(self
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k)| k == key)
            .map(|(p, _)| p.clone())
            .collect())
    }
}

struct Agent {
    registry: Arc<WatchRegistry>,
    store: Arc<EntryStore>,
    sink: Arc<MemorySink>,
    evaluator: Arc<Evaluator>,
    scanner: Scanner,
}

fn agent(registry: WatchRegistry, watched: WatchedPath) -> Agent {
    let registry = Arc::new(registry);
    let _ = registry.register(watched);
    let store = Arc::new(EntryStore::open_in_memory().unwrap());
    let sink = Arc::new(MemorySink::new());
    let evaluator = Arc::new(Evaluator::new(store.clone(), registry.clone(), sink.clone()));
    let scanner = Scanner::new(registry.clone(), evaluator.clone());
    Agent {
        registry,
        store,
        sink,
        evaluator,
        scanner,
    }
}

fn kinds(events: &[ChangeEvent]) -> Vec<ChangeKind> {
    events.iter().map(ChangeEvent::kind).collect()
}

// ─── Test 1: Scheduled add ──────────────────────────────────────────────────

#[test]
fn test_scan_reports_new_files_once() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("passwd"), b"root:x:0:0").unwrap();
    fs::create_dir(dir.path().join("conf.d")).unwrap();
    fs::write(dir.path().join("conf.d/app.conf"), b"enabled=true").unwrap();
    let a = agent(WatchRegistry::new(), WatchedPath::new(dir.path(), ModeFlags::SCHEDULED));

    a.scanner.scan().unwrap();
    let events = a.sink.take();
    assert_eq!(kinds(&events), vec![ChangeKind::Added, ChangeKind::Added]);
    assert!(events.iter().all(|e| e.mode() == DetectionMode::Scheduled));

    a.scanner.scan().unwrap();
    assert!(a.sink.take().is_empty());
}

// ─── Test 2: Modify idempotence ─────────────────────────────────────────────

#[test]
fn test_modification_reported_once() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("hosts");
    fs::write(&file, b"127.0.0.1 localhost").unwrap();
    let a = agent(WatchRegistry::new(), WatchedPath::new(dir.path(), ModeFlags::SCHEDULED));
    a.scanner.scan().unwrap();
    a.sink.take();

    fs::write(&file, b"10.0.0.1 evil.example").unwrap();
    a.scanner.scan().unwrap();
    let events = a.sink.take();
    assert_eq!(kinds(&events), vec![ChangeKind::Modified]);
    let record = events[0].to_record(chrono::Utc::now());
    assert!(record.changed_attributes.iter().any(|c| c == "sha256"));

    a.scanner.scan().unwrap();
    assert!(a.sink.take().is_empty());
}

// ─── Test 3: Delete exactly once ────────────────────────────────────────────

#[test]
fn test_realtime_delete_not_repeated_by_sweep() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("shadow");
    fs::write(&file, b"secret").unwrap();
    let source = Arc::new(ScriptedSource::default());
    let a = agent(
        WatchRegistry::new().with_realtime(source.clone()),
        WatchedPath::new(dir.path(), ModeFlags::REALTIME),
    );
    a.scanner.scan().unwrap();
    a.sink.take();

    fs::remove_file(&file).unwrap();
    let collector = RealtimeCollector::new(source, a.registry.clone(), a.evaluator.clone(), Duration::ZERO);
    collector.process_batch(vec![RawNotice::Changed(file.clone())]);
    let events = a.sink.take();
    assert_eq!(kinds(&events), vec![ChangeKind::Deleted]);
    assert_eq!(events[0].mode(), DetectionMode::Realtime);

    let summary = a.scanner.scan().unwrap();
    assert_eq!(summary.deleted, 0);
    assert!(a.sink.take().is_empty());
    assert_eq!(a.store.count().unwrap(), 0);
}

// ─── Test 4: Real-time dedup ────────────────────────────────────────────────

#[test]
fn test_realtime_batch_deduplicated() {
    let dir = tempdir().unwrap();
    let source = Arc::new(ScriptedSource::default());
    let a = agent(
        WatchRegistry::new().with_realtime(source.clone()),
        WatchedPath::new(dir.path(), ModeFlags::REALTIME),
    );
    assert_eq!(source.watches.lock().unwrap().len(), 1);

    let collector = Arc::new(RealtimeCollector::new(
        source.clone(),
        a.registry.clone(),
        a.evaluator.clone(),
        Duration::from_millis(5),
    ));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let thread = collector.spawn(shutdown_rx).unwrap();

    let file = dir.path().join("burst.log");
    fs::write(&file, b"line 1\nline 2\n").unwrap();
    source.push(vec![RawNotice::Changed(file.clone()); 6]);

    let deadline = Instant::now() + Duration::from_secs(5);
    while a.sink.events().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    // Give a duplicate evaluation the chance to show up.
    std::thread::sleep(Duration::from_millis(50));
    let events = a.sink.take();
    assert_eq!(kinds(&events), vec![ChangeKind::Added]);
    assert_eq!(events[0].mode(), DetectionMode::Realtime);

    shutdown_tx.send(true).unwrap();
    source.stop();
    thread.join().unwrap();
}

// ─── Test 5: Checksum sensitivity ───────────────────────────────────────────

#[cfg(unix)]
#[test]
fn test_metadata_only_changes_are_detected() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let file = dir.path().join("sudoers");
    fs::write(&file, b"root ALL=(ALL) ALL").unwrap();
    fs::set_permissions(&file, fs::Permissions::from_mode(0o440)).unwrap();
    let a = agent(WatchRegistry::new(), WatchedPath::new(dir.path(), ModeFlags::SCHEDULED));
    a.scanner.scan().unwrap();
    let key = file.to_string_lossy().into_owned();
    let original = a.store.get(&key).unwrap().unwrap().checksum;
    a.sink.take();

    fs::set_permissions(&file, fs::Permissions::from_mode(0o666)).unwrap();
    a.scanner.scan().unwrap();
    let events = a.sink.take();
    assert_eq!(kinds(&events), vec![ChangeKind::Modified]);
    let record = events[0].to_record(chrono::Utc::now());
    assert_eq!(record.changed_attributes, vec!["permission".to_string()]);
    let after_chmod = a.store.get(&key).unwrap().unwrap().checksum;
    assert_ne!(original, after_chmod);

    let stamp = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);
    fs::File::options()
        .write(true)
        .open(&file)
        .unwrap()
        .set_modified(stamp)
        .unwrap();
    a.scanner.scan().unwrap();
    let events = a.sink.take();
    let record = events[0].to_record(chrono::Utc::now());
    assert_eq!(record.changed_attributes, vec!["mtime".to_string()]);
    assert_ne!(a.store.get(&key).unwrap().unwrap().checksum, after_chmod);
}

// ─── Test 6: Whodata degradation ────────────────────────────────────────────

#[test]
fn test_whodata_degrades_to_realtime() {
    let dir = tempdir().unwrap();
    let source = Arc::new(ScriptedSource::default());
    let a = agent(
        WatchRegistry::new()
            .with_realtime(source.clone())
            .with_audit(Arc::new(RefusingRules), "fim_whodata"),
        WatchedPath::new(dir.path(), ModeFlags::WHODATA),
    );
    let registration = a.registry.get(dir.path()).unwrap();
    assert_eq!(registration.detection_mode(), DetectionMode::Realtime);
    assert!(registration.descriptor.is_some());
    assert_eq!(source.watches.lock().unwrap().as_slice(), &[dir.path().to_path_buf()]);

    let file = dir.path().join("id_rsa");
    fs::write(&file, b"-----BEGIN KEY-----").unwrap();
    let collector = RealtimeCollector::new(source, a.registry.clone(), a.evaluator.clone(), Duration::ZERO);
    collector.process_batch(vec![RawNotice::Changed(file.clone())]);
    fs::write(&file, b"-----BEGIN OTHER KEY-----").unwrap();
    collector.process_batch(vec![RawNotice::Changed(file.clone())]);
    fs::remove_file(&file).unwrap();
    collector.process_batch(vec![RawNotice::Changed(file)]);

    let events = a.sink.take();
    assert_eq!(
        kinds(&events),
        vec![ChangeKind::Added, ChangeKind::Modified, ChangeKind::Deleted]
    );
    assert!(events.iter().all(|e| e.mode() == DetectionMode::Realtime));
    assert!(events[0].actor().is_none());
}

// ─── Test 7: Whodata attribution ────────────────────────────────────────────

#[test]
fn test_whodata_record_attributes_change() {
    let dir = tempdir().unwrap();
    let health = tempdir().unwrap();
    let rules = Arc::new(AcceptingRules::default());
    let a = agent(
        WatchRegistry::new().with_audit(rules.clone(), "fim_whodata"),
        WatchedPath::new(dir.path(), ModeFlags::WHODATA),
    );
    assert_eq!(
        a.registry.get(dir.path()).unwrap().detection_mode(),
        DetectionMode::Whodata
    );

    let collector = WhodataCollector::new(
        WhodataSettings::default(),
        health.path().to_path_buf(),
        a.registry.clone(),
        a.evaluator.clone(),
        rules.clone(),
    );
    collector.initialize().unwrap();
    assert_eq!(rules.list_rules("fim_health").unwrap(), vec![health.path().to_path_buf()]);

    let file = dir.path().join("authorized_keys");
    fs::write(&file, b"ssh-ed25519 AAAA").unwrap();
    let event = AuditEvent {
        id: "1700000000.123:42".into(),
        keys: vec!["fim_whodata".into()],
        success: Some(true),
        uid: Some("0".into()),
        gid: Some("0".into()),
        auid: Some("1000".into()),
        pid: Some(4242),
        ppid: Some(1),
        comm: Some("tee".into()),
        exe: Some("/usr/bin/tee".into()),
        cwd: Some(dir.path().to_string_lossy().into_owned()),
        paths: vec![PathItem {
            name: "authorized_keys".into(),
            nametype: Some("CREATE".into()),
        }],
        argv: vec!["tee".into(), "authorized_keys".into()],
        proctitle: None,
    };
    assert_eq!(collector.handle_event(&event), 1);

    let events = a.sink.take();
    assert_eq!(kinds(&events), vec![ChangeKind::Added]);
    assert_eq!(events[0].mode(), DetectionMode::Whodata);
    let actor = events[0].actor().unwrap();
    assert_eq!(actor.process_id, Some(4242));
    assert_eq!(actor.audit_uid.as_deref(), Some("1000"));
    assert_eq!(actor.process_name.as_deref(), Some("/usr/bin/tee"));
    assert_eq!(actor.command_line.as_deref(), Some("tee authorized_keys"));

    // Unrelated keys are ignored.
    let mut foreign = event.clone();
    foreign.keys = vec!["exec".into()];
    assert_eq!(collector.handle_event(&foreign), 0);
}

// ─── Test 8: Engine lifecycle ───────────────────────────────────────────────

#[tokio::test]
async fn test_engine_initial_scan_and_shutdown() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("motd"), b"welcome").unwrap();
    let config = FimConfig {
        directories: vec![WatchedPath::new(dir.path(), ModeFlags::REALTIME)],
        scan_on_start: true,
        ..FimConfig::default()
    };
    let sink = Arc::new(MemorySink::new());
    let source = Arc::new(ScriptedSource::default());
    let options = EngineOptions {
        realtime: Some(source.clone()),
        ..EngineOptions::default()
    };
    let engine = FimEngine::start(Arc::new(config), sink.clone(), options).unwrap();

    let mut summaries = engine.scan_summaries();
    tokio::time::timeout(Duration::from_secs(10), summaries.changed())
        .await
        .unwrap()
        .unwrap();
    let summary = summaries.borrow_and_update().clone().unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(engine.store().count().unwrap(), 1);
    assert_eq!(source.watches.lock().unwrap().len(), 1);

    tokio::time::timeout(Duration::from_secs(10), engine.shutdown())
        .await
        .unwrap();
    assert_eq!(sink.events().len(), 1);
}
