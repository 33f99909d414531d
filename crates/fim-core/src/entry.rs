//! Per-path file state records and the aggregate checksum.
//!
//! The aggregate checksum is the single comparison key used both for change
//! detection (evaluator) and for range synchronization with the manager. It
//! is a pure function of the path and every tracked attribute.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Which source last touched an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    Scheduled,
    Realtime,
    Whodata,
}

impl DetectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMode::Scheduled => "scheduled",
            DetectionMode::Realtime => "realtime",
            DetectionMode::Whodata => "whodata",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(DetectionMode::Scheduled),
            "realtime" => Some(DetectionMode::Realtime),
            "whodata" => Some(DetectionMode::Whodata),
            _ => None,
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Blake3,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Blake3 => "blake3",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

bitflags! {
    /// Attributes tracked for a watched path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(try_from = "Vec<String>", into = "Vec<String>")]
    pub struct Checks: u32 {
        const SIZE = 1 << 0;
        const PERMISSIONS = 1 << 1;
        const OWNER = 1 << 2;
        const GROUP = 1 << 3;
        const MTIME = 1 << 4;
        const INODE = 1 << 5;
        const BLAKE3 = 1 << 6;
        const SHA256 = 1 << 7;
    }
}

impl Default for Checks {
    fn default() -> Self {
        Checks::all()
    }
}

impl Checks {
    pub fn hash_algorithms(&self) -> Vec<HashAlgorithm> {
        let mut algorithms = Vec::new();
        if self.contains(Checks::BLAKE3) {
            algorithms.push(HashAlgorithm::Blake3);
        }
        if self.contains(Checks::SHA256) {
            algorithms.push(HashAlgorithm::Sha256);
        }
        algorithms
    }
}

impl TryFrom<Vec<String>> for Checks {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        let mut checks = Checks::empty();
        for name in names {
            if name.eq_ignore_ascii_case("all") {
                checks |= Checks::all();
                continue;
            }
            checks |= Checks::from_name(&name.to_ascii_uppercase())
                .ok_or_else(|| format!("unknown check: {name}"))?;
        }
        Ok(checks)
    }
}

impl From<Checks> for Vec<String> {
    fn from(checks: Checks) -> Self {
        checks
            .iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect()
    }
}

/// Live attributes of a file. Attributes excluded by [`Checks`] are left at
/// their default value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub size: u64,
    pub permissions: u32,
    pub uid: u32,
    pub gid: u32,
    pub user_name: Option<String>,
    pub group_name: Option<String>,
    pub mtime: i64,
    pub inode: u64,
    pub device: u64,
    #[serde(default)]
    pub hashes: BTreeMap<HashAlgorithm, String>,
}

impl FileAttributes {
    /// Names of the attributes that differ between `self` and `other`.
    pub fn changed(&self, other: &FileAttributes) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.size != other.size {
            changed.push("size");
        }
        if self.permissions != other.permissions {
            changed.push("permission");
        }
        if self.uid != other.uid {
            changed.push("uid");
        }
        if self.user_name != other.user_name {
            changed.push("user_name");
        }
        if self.gid != other.gid {
            changed.push("gid");
        }
        if self.group_name != other.group_name {
            changed.push("group_name");
        }
        if self.mtime != other.mtime {
            changed.push("mtime");
        }
        if self.inode != other.inode {
            changed.push("inode");
        }
        if self.device != other.device {
            changed.push("device");
        }
        for algorithm in [HashAlgorithm::Blake3, HashAlgorithm::Sha256] {
            if self.hashes.get(&algorithm) != other.hashes.get(&algorithm) {
                changed.push(match algorithm {
                    HashAlgorithm::Blake3 => "blake3",
                    HashAlgorithm::Sha256 => "sha256",
                });
            }
        }
        changed
    }
}

/// A stored file-state record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub attributes: FileAttributes,
    pub checksum: String,
    pub scanned: bool,
    pub mode: DetectionMode,
}

impl FileEntry {
    /// Build a freshly observed entry. New observations are always marked
    /// scanned.
    pub fn new(path: impl Into<String>, attributes: FileAttributes, mode: DetectionMode) -> Self {
        let path = path.into();
        let checksum = aggregate_checksum(&path, &attributes);
        Self {
            path,
            attributes,
            checksum,
            scanned: true,
            mode,
        }
    }
}

/// SHA-256 over a canonical rendering of the path and every attribute.
///
/// Fields are separated by `:` and optional fields render as empty strings;
/// the path goes first and is length-prefixed so no other field can bleed
/// into it.
pub fn aggregate_checksum(path: &str, attributes: &FileAttributes) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.len().to_le_bytes());
    hasher.update(path.as_bytes());
    let rendered = format!(
        ":{}:{:o}:{}:{}:{}:{}:{}:{}:{}",
        attributes.size,
        attributes.permissions,
        attributes.uid,
        attributes.gid,
        attributes.user_name.as_deref().unwrap_or(""),
        attributes.group_name.as_deref().unwrap_or(""),
        attributes.mtime,
        attributes.inode,
        attributes.device,
    );
    hasher.update(rendered.as_bytes());
    for (algorithm, digest) in &attributes.hashes {
        hasher.update(b":");
        hasher.update(algorithm.as_str().as_bytes());
        hasher.update(b"=");
        hasher.update(digest.as_bytes());
    }
    hex::encode(hasher.finalize())
}
