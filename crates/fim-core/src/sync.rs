//! Checksum-range synchronization protocol.
//!
//! Agent and manager both keep their entries ordered by aggregate checksum.
//! The agent sends digests of key ranges; the manager answers which ranges
//! mismatch; mismatching ranges are bisected until they are small enough to
//! be shipped as literal entry lists. Everything here is the wire vocabulary
//! plus the manager-side reconciliation state. The agent-side session lives
//! in the service crate.

use crate::entry::FileEntry;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Half-open key interval `[start, end)`; `end == None` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncRange {
    pub start: String,
    pub end: Option<String>,
}

impl SyncRange {
    /// The whole keyspace.
    pub fn full() -> Self {
        Self {
            start: String::new(),
            end: None,
        }
    }

    pub fn new(start: impl Into<String>, end: Option<String>) -> Self {
        Self {
            start: start.into(),
            end,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        key >= self.start.as_str() && self.end.as_deref().map_or(true, |end| key < end)
    }

    /// `[start, key)` and `[key, end)`.
    pub fn split_at(&self, key: &str) -> (SyncRange, SyncRange) {
        (
            SyncRange::new(self.start.clone(), Some(key.to_string())),
            SyncRange::new(key, self.end.clone()),
        )
    }

    fn bounds(&self) -> (Bound<&str>, Bound<&str>) {
        (
            Bound::Included(self.start.as_str()),
            match &self.end {
                Some(end) => Bound::Excluded(end.as_str()),
                None => Bound::Unbounded,
            },
        )
    }
}

/// SHA-256 over the concatenated checksums, in key order.
pub fn digest_checksums<'a>(checksums: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for checksum in checksums {
        hasher.update(checksum.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDigest {
    pub range: SyncRange,
    pub count: usize,
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Match,
    Mismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncRequest {
    Digests {
        session: String,
        ranges: Vec<RangeDigest>,
    },
    Entries {
        session: String,
        range: SyncRange,
        entries: Vec<FileEntry>,
    },
}

impl SyncRequest {
    pub fn session(&self) -> &str {
        match self {
            SyncRequest::Digests { session, .. } | SyncRequest::Entries { session, .. } => session,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncResponse {
    /// One verdict per range of the matching `Digests` request, same order.
    Verdicts { verdicts: Vec<Verdict> },
    Ack { applied: usize },
    Error { message: String },
}

/// Request/response exchange with the manager over the agent's transport.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn exchange(&self, request: SyncRequest) -> Result<SyncResponse>;
}

/// Manager-side view of one agent's entries.
#[derive(Debug, Default, Clone)]
pub struct ManagerReplica {
    by_key: BTreeMap<String, FileEntry>,
    key_by_path: HashMap<String, String>,
}

impl ManagerReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = FileEntry>) -> Self {
        let mut replica = Self::new();
        for entry in entries {
            replica.insert(entry);
        }
        replica
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.key_by_path.get(path).and_then(|key| self.by_key.get(key))
    }

    /// Insert, replacing any older record of the same path.
    pub fn insert(&mut self, entry: FileEntry) {
        if let Some(old_key) = self.key_by_path.insert(entry.path.clone(), entry.checksum.clone()) {
            self.by_key.remove(&old_key);
        }
        self.by_key.insert(entry.checksum.clone(), entry);
    }

    pub fn remove_path(&mut self, path: &str) -> Option<FileEntry> {
        let key = self.key_by_path.remove(path)?;
        self.by_key.remove(&key)
    }

    pub fn digest(&self, range: &SyncRange) -> (usize, String) {
        let keys: Vec<&str> = self
            .by_key
            .range::<str, _>(range.bounds())
            .map(|(key, _)| key.as_str())
            .collect();
        (keys.len(), digest_checksums(keys))
    }

    pub fn root_digest(&self) -> String {
        self.digest(&SyncRange::full()).1
    }

    /// Replace everything inside `range` with `entries`.
    pub fn reconcile(&mut self, range: &SyncRange, entries: &[FileEntry]) -> usize {
        let stale: Vec<String> = self
            .by_key
            .range::<str, _>(range.bounds())
            .map(|(_, entry)| entry.path.clone())
            .collect();
        for path in stale {
            self.remove_path(&path);
        }
        for entry in entries {
            self.insert(entry.clone());
        }
        entries.len()
    }

    pub fn handle(&mut self, request: &SyncRequest) -> SyncResponse {
        match request {
            SyncRequest::Digests { ranges, .. } => SyncResponse::Verdicts {
                verdicts: ranges
                    .iter()
                    .map(|remote| {
                        let (count, digest) = self.digest(&remote.range);
                        if count == remote.count && digest == remote.digest {
                            Verdict::Match
                        } else {
                            Verdict::Mismatch
                        }
                    })
                    .collect(),
            },
            SyncRequest::Entries { range, entries, .. } => {
                if let Some(stray) = entries.iter().find(|e| !range.contains(&e.checksum)) {
                    return SyncResponse::Error {
                        message: format!("entry {} outside of range", stray.path),
                    };
                }
                SyncResponse::Ack {
                    applied: self.reconcile(range, entries),
                }
            }
        }
    }
}

/// A manager living in the same process, counting every exchange.
#[derive(Debug, Default)]
pub struct InProcessManager {
    replica: Mutex<ManagerReplica>,
    exchanges: AtomicUsize,
    entries_received: AtomicUsize,
}

impl InProcessManager {
    pub fn new(replica: ManagerReplica) -> Self {
        Self {
            replica: Mutex::new(replica),
            exchanges: AtomicUsize::new(0),
            entries_received: AtomicUsize::new(0),
        }
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn entries_received(&self) -> usize {
        self.entries_received.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.exchanges.store(0, Ordering::SeqCst);
        self.entries_received.store(0, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ManagerReplica {
        self.replica.lock().clone()
    }
}

#[async_trait]
impl SyncTransport for InProcessManager {
    async fn exchange(&self, request: SyncRequest) -> Result<SyncResponse> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if let SyncRequest::Entries { entries, .. } = &request {
            self.entries_received.fetch_add(entries.len(), Ordering::SeqCst);
        }
        Ok(self.replica.lock().handle(&request))
    }
}
