//! Integration tests for agent/manager integrity synchronization.
//!
//! Tests cover:
//!  1. First session ships the whole store; the second transfers nothing
//!  2. A few changes cost a logarithmic number of range comparisons
//!  3. Deletions on the agent are removed from the manager
//!  4. The periodic loop syncs on demand

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fim_core::config::{ModeFlags, SyncSettings, WatchedPath};
use fim_core::sink::MemorySink;
use fim_core::store::EntryStore;
use fim_core::sync::{InProcessManager, ManagerReplica, SyncRange};
use tempfile::tempdir;

use fim_service::integrity::evaluator::Evaluator;
use fim_service::integrity::scanner::Scanner;
use fim_service::integrity::sync::{spawn_sync_loop, Synchronizer};
use fim_service::registry::WatchRegistry;

fn settings() -> SyncSettings {
    SyncSettings {
        response_timeout_secs: 5,
        max_literal_entries: 4,
        ..SyncSettings::default()
    }
}

fn populate(dir: &Path, files: usize) {
    for i in 0..files {
        fs::write(dir.join(format!("file-{i:04}.dat")), format!("content {i}")).unwrap();
    }
}

fn scanned_store(dir: &Path) -> (Arc<EntryStore>, Scanner) {
    let registry = Arc::new(WatchRegistry::new());
    registry
        .register(WatchedPath::new(dir, ModeFlags::SCHEDULED))
        .unwrap();
    let store = Arc::new(EntryStore::open_in_memory().unwrap());
    let evaluator = Arc::new(Evaluator::new(store.clone(), registry.clone(), Arc::new(MemorySink::new())));
    let scanner = Scanner::new(registry, evaluator);
    scanner.scan().unwrap();
    (store, scanner)
}

fn agent_digest(store: &EntryStore) -> String {
    store.range_summary(&SyncRange::full()).unwrap().digest
}

// ─── Test 1: Full transfer, then silence ────────────────────────────────────

#[tokio::test]
async fn test_first_session_converges_second_is_free() {
    let dir = tempdir().unwrap();
    populate(dir.path(), 40);
    let (store, _scanner) = scanned_store(dir.path());
    let manager = Arc::new(InProcessManager::new(ManagerReplica::new()));
    let sync = Synchronizer::new(store.clone(), manager.clone(), settings());

    let report = sync.run_session().await.unwrap();
    assert_eq!(report.entries_sent, 40);
    assert_eq!(manager.snapshot().root_digest(), agent_digest(&store));

    manager.reset_counters();
    let report = sync.run_session().await.unwrap();
    assert!(report.in_sync());
    assert_eq!(report.rounds, 1);
    assert_eq!(manager.exchanges(), 1);
    assert_eq!(manager.entries_received(), 0);
}

// ─── Test 2: O(K log T) ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_few_changes_cost_logarithmic_comparisons() {
    let total = 256;
    let changed = 3;
    let dir = tempdir().unwrap();
    populate(dir.path(), total);
    let (store, scanner) = scanned_store(dir.path());
    let manager = Arc::new(InProcessManager::new(ManagerReplica::new()));
    let sync = Synchronizer::new(store.clone(), manager.clone(), settings());
    sync.run_session().await.unwrap();

    for i in [7, 100, 201] {
        fs::write(dir.path().join(format!("file-{i:04}.dat")), b"tampered").unwrap();
    }
    assert_eq!(scanner.scan().unwrap().modified, changed);

    manager.reset_counters();
    let report = sync.run_session().await.unwrap();
    let depth = (total as f64).log2().ceil() as usize + 1;
    assert!(
        report.ranges_compared <= 4 * changed * depth,
        "compared {} ranges",
        report.ranges_compared
    );
    assert!(manager.entries_received() < total / 4);
    assert_eq!(manager.snapshot().root_digest(), agent_digest(&store));

    manager.reset_counters();
    assert!(sync.run_session().await.unwrap().in_sync());
    assert_eq!(manager.entries_received(), 0);
}

// ─── Test 3: Deletions propagate ────────────────────────────────────────────

#[tokio::test]
async fn test_deleted_entries_leave_manager() {
    let dir = tempdir().unwrap();
    populate(dir.path(), 20);
    let (store, scanner) = scanned_store(dir.path());
    let manager = Arc::new(InProcessManager::new(ManagerReplica::new()));
    let sync = Synchronizer::new(store.clone(), manager.clone(), settings());
    sync.run_session().await.unwrap();

    let victim = dir.path().join("file-0013.dat");
    fs::remove_file(&victim).unwrap();
    assert_eq!(scanner.scan().unwrap().deleted, 1);
    sync.run_session().await.unwrap();

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.len(), 19);
    assert!(snapshot.get(&victim.to_string_lossy()).is_none());
}

// ─── Test 4: Loop on demand ─────────────────────────────────────────────────

#[tokio::test]
async fn test_sync_loop_runs_when_woken() {
    let dir = tempdir().unwrap();
    populate(dir.path(), 5);
    let (store, _scanner) = scanned_store(dir.path());
    let manager = Arc::new(InProcessManager::new(ManagerReplica::new()));
    let sync = Arc::new(Synchronizer::new(store.clone(), manager.clone(), settings()));

    let (task, handle) = spawn_sync_loop(sync, Duration::from_secs(3600));
    handle.sync_now();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while manager.snapshot().len() < 5 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(manager.snapshot().root_digest(), agent_digest(&store));

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
