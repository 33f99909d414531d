//! Agent side of the integrity synchronization.
//!
//! A session starts from the whole checksum keyspace. Each round sends the
//! digests of the current frontier; matching ranges are done, mismatching
//! ones are either shipped as literal entry lists (small enough) or bisected
//! at their median key for the next round. With K differing entries out of
//! T, a session costs O(K log T) range comparisons.

use fim_core::config::SyncSettings;
use fim_core::error::{FimError, Result};
use fim_core::store::EntryStore;
use fim_core::sync::{RangeDigest, SyncRange, SyncRequest, SyncResponse, SyncTransport, Verdict};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one synchronization session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub session: String,
    pub rounds: usize,
    pub ranges_compared: usize,
    pub ranges_transferred: usize,
    pub entries_sent: usize,
    pub elapsed: Duration,
}

impl SyncReport {
    pub fn in_sync(&self) -> bool {
        self.ranges_transferred == 0
    }
}

pub struct Synchronizer {
    store: Arc<EntryStore>,
    transport: Arc<dyn SyncTransport>,
    settings: SyncSettings,
}

impl Synchronizer {
    pub fn new(
        store: Arc<EntryStore>,
        transport: Arc<dyn SyncTransport>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run one session to convergence. Any timeout or protocol error aborts
    /// the session; the next one starts over from the full keyspace.
    pub async fn run_session(&self) -> Result<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport {
            session: Uuid::new_v4().to_string(),
            ..SyncReport::default()
        };
        let mut frontier = vec![SyncRange::full()];

        while !frontier.is_empty() {
            report.rounds += 1;
            let round = report.rounds;

            let mut digests = Vec::with_capacity(frontier.len());
            let mut split_keys = Vec::with_capacity(frontier.len());
            for range in frontier {
                let summary = self.store.range_summary(&range)?;
                split_keys.push(summary.split_key);
                digests.push(RangeDigest {
                    range,
                    count: summary.count,
                    digest: summary.digest,
                });
            }
            report.ranges_compared += digests.len();

            let request = SyncRequest::Digests {
                session: report.session.clone(),
                ranges: digests.clone(),
            };
            let verdicts = match self.exchange(request, round).await? {
                SyncResponse::Verdicts { verdicts } if verdicts.len() == digests.len() => verdicts,
                SyncResponse::Verdicts { verdicts } => {
                    return Err(FimError::Protocol(format!(
                        "{} verdicts for {} ranges",
                        verdicts.len(),
                        digests.len()
                    )))
                }
                other => return Err(unexpected(other)),
            };

            let mut next = Vec::new();
            for ((digest, split_key), verdict) in digests.into_iter().zip(split_keys).zip(verdicts) {
                if verdict == Verdict::Match {
                    continue;
                }
                let range = digest.range;
                match split_key {
                    Some(key) if digest.count > self.settings.max_literal_entries && key != range.start => {
                        let (low, high) = range.split_at(&key);
                        next.push(low);
                        next.push(high);
                    }
                    _ => {
                        report.entries_sent += self.send_entries(&report.session, range, round).await?;
                        report.ranges_transferred += 1;
                    }
                }
            }
            debug!(
                session = %report.session,
                round,
                next_ranges = next.len(),
                "sync round finished"
            );
            frontier = next;
        }

        report.elapsed = started.elapsed();
        info!(
            session = %report.session,
            rounds = report.rounds,
            compared = report.ranges_compared,
            transferred = report.ranges_transferred,
            entries = report.entries_sent,
            "sync session finished"
        );
        Ok(report)
    }

    async fn send_entries(&self, session: &str, range: SyncRange, round: usize) -> Result<usize> {
        let entries = self.store.range_entries(&range)?;
        let sent = entries.len();
        let request = SyncRequest::Entries {
            session: session.to_string(),
            range,
            entries,
        };
        match self.exchange(request, round).await? {
            SyncResponse::Ack { .. } => Ok(sent),
            other => Err(unexpected(other)),
        }
    }

    async fn exchange(&self, request: SyncRequest, round: usize) -> Result<SyncResponse> {
        match tokio::time::timeout(self.settings.response_timeout(), self.transport.exchange(request)).await {
            Ok(response) => response,
            Err(_) => Err(FimError::SyncTimeout { round }),
        }
    }
}

fn unexpected(response: SyncResponse) -> FimError {
    match response {
        SyncResponse::Error { message } => FimError::Protocol(format!("manager error: {message}")),
        other => FimError::Protocol(format!("unexpected response {other:?}")),
    }
}

/// Handle to the periodic sync task.
pub struct SyncLoopHandle {
    pub wake: Arc<Notify>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl SyncLoopHandle {
    pub fn sync_now(&self) {
        self.wake.notify_one();
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Run a session every `interval`, and whenever woken.
pub fn spawn_sync_loop(
    sync: Arc<Synchronizer>,
    interval: Duration,
) -> (tokio::task::JoinHandle<()>, SyncLoopHandle) {
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let wake_clone = wake.clone();

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "sync loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake_clone.notified() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("sync loop shutting down");
                        return;
                    }
                }
            }
            if *shutdown_rx.borrow() {
                return;
            }
            if let Err(err) = sync.run_session().await {
                warn!(error = %err, "sync session aborted");
            }
        }
    });

    (handle, SyncLoopHandle { wake, shutdown_tx })
}
