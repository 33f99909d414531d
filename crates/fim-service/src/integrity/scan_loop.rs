//! Periodic scan loop.
//!
//! Runs a full [`Scanner`] pass at the configured interval. This is the
//! ground truth behind the real-time and whodata collectors: it catches what
//! they missed (restarts, queue overflow, unwatched subtrees).

use crate::integrity::scanner::{ScanSummary, Scanner};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Handle returned to the caller so it can request an immediate scan or shut
/// the loop down.
pub struct ScanLoopHandle {
    /// Notify to wake the loop early.
    pub wake: Arc<Notify>,
    /// Send `true` to shut down.
    pub shutdown_tx: watch::Sender<bool>,
    /// Summary of the last finished pass.
    pub summaries: watch::Receiver<Option<ScanSummary>>,
}

impl ScanLoopHandle {
    pub fn run_now(&self) {
        self.wake.notify_one();
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawn the scan loop as a tokio task. Passes run on the blocking pool.
pub fn spawn_scan_loop(
    scanner: Arc<Scanner>,
    interval: Duration,
    scan_on_start: bool,
) -> (tokio::task::JoinHandle<()>, ScanLoopHandle) {
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (summary_tx, summaries) = watch::channel(None);

    let wake_clone = wake.clone();

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "scan loop started");
        let mut first = scan_on_start;

        loop {
            if !first {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = wake_clone.notified() => {
                        debug!("scan loop woken early");
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("scan loop shutting down");
                            return;
                        }
                    }
                }
            }
            first = false;

            if *shutdown_rx.borrow() {
                return;
            }

            let worker = scanner.clone();
            match tokio::task::spawn_blocking(move || worker.scan()).await {
                Ok(Some(summary)) => {
                    let _ = summary_tx.send(Some(summary));
                }
                Ok(None) => debug!("scan loop: pass already running"),
                Err(err) => warn!(error = %err, "scan pass panicked"),
            }
        }
    });

    (
        handle,
        ScanLoopHandle {
            wake,
            shutdown_tx,
            summaries,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::evaluator::Evaluator;
    use crate::registry::WatchRegistry;
    use fim_core::config::{ModeFlags, WatchedPath};
    use fim_core::sink::MemorySink;
    use fim_core::store::EntryStore;

    async fn next_summary(rx: &mut watch::Receiver<Option<ScanSummary>>) -> ScanSummary {
        tokio::time::timeout(Duration::from_secs(10), rx.changed())
            .await
            .expect("scan finished")
            .unwrap();
        rx.borrow_and_update().clone().unwrap()
    }

    #[tokio::test]
    async fn initial_scan_and_wake() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"a").unwrap();
        let registry = Arc::new(WatchRegistry::new());
        registry
            .register(WatchedPath::new(dir.path(), ModeFlags::SCHEDULED))
            .unwrap();
        let store = Arc::new(EntryStore::open_in_memory().unwrap());
        let evaluator = Arc::new(Evaluator::new(store, registry.clone(), Arc::new(MemorySink::new())));
        let scanner = Arc::new(Scanner::new(registry, evaluator));

        let (task, mut handle) = spawn_scan_loop(scanner, Duration::from_secs(3600), true);
        let summary = next_summary(&mut handle.summaries).await;
        assert_eq!(summary.added, 1);

        std::fs::write(dir.path().join("b"), b"b").unwrap();
        handle.run_now();
        let summary = next_summary(&mut handle.summaries).await;
        assert_eq!(summary.added, 1);
        assert_eq!(summary.files, 2);

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
