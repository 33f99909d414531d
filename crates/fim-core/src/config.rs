//! FIM configuration model.
//!
//! Built once at startup (from the agent's configuration loader or from a JSON
//! file for the standalone daemon) and shared read-only behind an `Arc`.

use crate::entry::{Checks, DetectionMode};
use crate::error::{FimError, Result};
use bitflags::bitflags;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

bitflags! {
    /// Monitoring modes enabled for a watched path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(try_from = "Vec<String>", into = "Vec<String>")]
    pub struct ModeFlags: u8 {
        const SCHEDULED = 1 << 0;
        const REALTIME = 1 << 1;
        const WHODATA = 1 << 2;
    }
}

impl Default for ModeFlags {
    fn default() -> Self {
        ModeFlags::SCHEDULED
    }
}

impl ModeFlags {
    /// The most precise mode enabled: whodata over realtime over scheduled.
    pub fn primary(&self) -> DetectionMode {
        if self.contains(ModeFlags::WHODATA) {
            DetectionMode::Whodata
        } else if self.contains(ModeFlags::REALTIME) {
            DetectionMode::Realtime
        } else {
            DetectionMode::Scheduled
        }
    }
}

impl TryFrom<Vec<String>> for ModeFlags {
    type Error = String;

    fn try_from(names: Vec<String>) -> std::result::Result<Self, Self::Error> {
        let mut flags = ModeFlags::SCHEDULED;
        for name in names {
            flags |= match DetectionMode::parse(&name.to_ascii_lowercase()) {
                Some(DetectionMode::Scheduled) => ModeFlags::SCHEDULED,
                Some(DetectionMode::Realtime) => ModeFlags::REALTIME,
                Some(DetectionMode::Whodata) => ModeFlags::WHODATA,
                None => return Err(format!("unknown monitoring mode: {name}")),
            };
        }
        Ok(flags)
    }
}

impl From<ModeFlags> for Vec<String> {
    fn from(flags: ModeFlags) -> Self {
        flags
            .iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect()
    }
}

/// A configured directory or file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedPath {
    pub path: PathBuf,
    #[serde(default)]
    pub mode: ModeFlags,
    /// Recursion limit below `path`; 0 only covers direct children.
    #[serde(default = "default_depth")]
    pub depth: usize,
    /// Glob patterns or literal path prefixes to skip.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Only paths matching this regular expression are reported.
    #[serde(default)]
    pub restrict: Option<String>,
    #[serde(default)]
    pub checks: Checks,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl WatchedPath {
    pub fn new(path: impl Into<PathBuf>, mode: ModeFlags) -> Self {
        Self {
            path: path.into(),
            mode: mode | ModeFlags::SCHEDULED,
            depth: default_depth(),
            ignore: Vec::new(),
            restrict: None,
            checks: Checks::default(),
            follow_symlinks: false,
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_ignore(mut self, pattern: impl Into<String>) -> Self {
        self.ignore.push(pattern.into());
        self
    }

    pub fn with_restrict(mut self, pattern: impl Into<String>) -> Self {
        self.restrict = Some(pattern.into());
        self
    }

    pub fn with_checks(mut self, checks: Checks) -> Self {
        self.checks = checks;
        self
    }

    pub fn following_symlinks(mut self) -> Self {
        self.follow_symlinks = true;
        self
    }

    /// Compile the ignore/restrict rules.
    pub fn policy(&self) -> Result<WatchPolicy> {
        let mut ignore_globs = Vec::new();
        let mut ignore_prefixes = Vec::new();
        for pattern in &self.ignore {
            if pattern.contains(['*', '?', '[']) {
                let compiled = glob::Pattern::new(pattern).map_err(|e| {
                    FimError::configuration(&self.path, format!("bad ignore pattern {pattern}: {e}"))
                })?;
                ignore_globs.push(compiled);
            } else {
                ignore_prefixes.push(PathBuf::from(pattern));
            }
        }
        let restrict = match &self.restrict {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                FimError::configuration(&self.path, format!("bad restrict pattern {pattern}: {e}"))
            })?),
            None => None,
        };
        Ok(WatchPolicy {
            root: self.path.clone(),
            depth: self.depth,
            ignore_globs,
            ignore_prefixes,
            restrict,
        })
    }
}

/// Compiled filtering rules of one [`WatchedPath`].
#[derive(Debug, Clone)]
pub struct WatchPolicy {
    root: PathBuf,
    depth: usize,
    ignore_globs: Vec<glob::Pattern>,
    ignore_prefixes: Vec<PathBuf>,
    restrict: Option<Regex>,
}

impl WatchPolicy {
    /// Number of directory levels between the root and `path`, or `None`
    /// when `path` is outside the root.
    pub fn level(&self, path: &Path) -> Option<usize> {
        let relative = path.strip_prefix(&self.root).ok()?;
        Some(relative.components().count().saturating_sub(1))
    }

    /// Whether a directory at `path` may still be descended into.
    pub fn may_descend(&self, dir: &Path) -> bool {
        match dir.strip_prefix(&self.root) {
            Ok(relative) => relative.components().count() <= self.depth,
            Err(_) => false,
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        self.ignore_prefixes.iter().any(|p| path.starts_with(p))
            || self.ignore_globs.iter().any(|g| g.matches_path(path))
    }

    /// Apply depth, ignore and restrict rules to a file path.
    pub fn check(&self, path: &Path) -> Result<()> {
        match self.level(path) {
            None => return Err(FimError::policy(path, "outside watched root")),
            Some(level) if level > self.depth => {
                return Err(FimError::policy(path, format!("deeper than {}", self.depth)))
            }
            Some(_) => {}
        }
        if self.is_ignored(path) {
            return Err(FimError::policy(path, "ignored"));
        }
        if let Some(restrict) = &self.restrict {
            if !restrict.is_match(&path.to_string_lossy()) {
                return Err(FimError::policy(path, "does not match restrict"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogSettings {
    /// JSON-lines event file; events are only kept in memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_log_bytes")]
    pub max_bytes: u64,
}

impl Default for EventLogSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_bytes: default_log_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhodataSettings {
    /// Stream socket the audit dispatcher writes records to.
    #[serde(default = "default_audit_socket")]
    pub audit_socket: PathBuf,
    #[serde(default = "default_rule_key")]
    pub rule_key: String,
    #[serde(default = "default_health_key")]
    pub health_check_key: String,
    /// Directory the health-check probe writes to. Defaults to a directory
    /// under the data dir.
    #[serde(default)]
    pub health_check_dir: Option<PathBuf>,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for WhodataSettings {
    fn default() -> Self {
        Self {
            audit_socket: default_audit_socket(),
            rule_key: default_rule_key(),
            health_check_key: default_health_key(),
            health_check_dir: None,
            health_check_interval_secs: default_health_interval(),
            health_check_timeout_secs: default_health_timeout(),
            reload_interval_secs: default_reload_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_sync_timeout")]
    pub response_timeout_secs: u64,
    /// Ranges with at most this many entries are sent as literal lists.
    #[serde(default = "default_max_literal")]
    pub max_literal_entries: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sync_interval(),
            response_timeout_secs: default_sync_timeout(),
            max_literal_entries: default_max_literal(),
        }
    }
}

impl SyncSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FimConfig {
    #[serde(default)]
    pub directories: Vec<WatchedPath>,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_true")]
    pub scan_on_start: bool,
    /// Delay applied to every real-time batch before evaluation.
    #[serde(default = "default_rt_delay")]
    pub rt_delay_ms: u64,
    /// Entry store location; an in-memory store is used when unset.
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub event_log: EventLogSettings,
    #[serde(default)]
    pub whodata: WhodataSettings,
    #[serde(default)]
    pub sync: SyncSettings,
}

impl Default for FimConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            scan_interval_secs: default_scan_interval(),
            scan_on_start: true,
            rt_delay_ms: default_rt_delay(),
            database: None,
            event_log: EventLogSettings::default(),
            whodata: WhodataSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl FimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| FimError::access(path, e))?;
        let mut config: FimConfig = serde_json::from_str(&raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Every configured path takes part in the scheduled pass.
    pub fn normalize(&mut self) {
        for dir in &mut self.directories {
            dir.mode |= ModeFlags::SCHEDULED;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for dir in &self.directories {
            if !dir.path.is_absolute() {
                return Err(FimError::configuration(&dir.path, "path must be absolute"));
            }
            if !seen.insert(dir.path.clone()) {
                return Err(FimError::configuration(&dir.path, "configured twice"));
            }
            dir.policy()?;
        }
        if self.scan_interval_secs == 0 {
            return Err(FimError::configuration("scan_interval_secs", "must be positive"));
        }
        if self.sync.max_literal_entries == 0 {
            return Err(FimError::configuration("sync.max_literal_entries", "must be positive"));
        }
        if self.sync.response_timeout_secs == 0 || self.sync.interval_secs == 0 {
            return Err(FimError::configuration("sync", "intervals must be positive"));
        }
        if self.whodata.health_check_timeout_secs == 0 {
            return Err(FimError::configuration(
                "whodata.health_check_timeout_secs",
                "must be positive",
            ));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn rt_delay(&self) -> Duration {
        Duration::from_millis(self.rt_delay_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_depth() -> usize {
    256
}

fn default_scan_interval() -> u64 {
    12 * 60 * 60
}

fn default_rt_delay() -> u64 {
    5
}

fn default_log_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_audit_socket() -> PathBuf {
    PathBuf::from("/var/run/fimd/audit.sock")
}

fn default_rule_key() -> String {
    "fim_whodata".into()
}

fn default_health_key() -> String {
    "fim_health".into()
}

fn default_health_interval() -> u64 {
    60
}

fn default_health_timeout() -> u64 {
    10
}

fn default_reload_interval() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    300
}

fn default_sync_timeout() -> u64 {
    30
}

fn default_max_literal() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let raw = r#"{
            "directories": [
                {"path": "/etc", "mode": ["realtime", "whodata"], "depth": 2},
                {"path": "/usr/bin", "ignore": ["*.tmp"]}
            ]
        }"#;
        let mut config: FimConfig = serde_json::from_str(raw).unwrap();
        config.normalize();
        config.validate().unwrap();
        assert_eq!(
            config.directories[0].mode,
            ModeFlags::SCHEDULED | ModeFlags::REALTIME | ModeFlags::WHODATA
        );
        assert_eq!(config.directories[0].mode.primary(), DetectionMode::Whodata);
        assert_eq!(config.directories[1].mode, ModeFlags::SCHEDULED);
        assert_eq!(config.directories[1].depth, 256);
        assert_eq!(config.rt_delay_ms, 5);
        assert_eq!(config.sync.max_literal_entries, 32);
    }

    #[test]
    fn rejects_duplicates_and_relative_paths() {
        let mut config = FimConfig::default();
        config.directories.push(WatchedPath::new("/etc", ModeFlags::SCHEDULED));
        config.directories.push(WatchedPath::new("/etc", ModeFlags::REALTIME));
        assert!(matches!(config.validate(), Err(FimError::Configuration { .. })));

        let mut config = FimConfig::default();
        config.directories.push(WatchedPath::new("etc", ModeFlags::SCHEDULED));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_patterns() {
        let mut config = FimConfig::default();
        config
            .directories
            .push(WatchedPath::new("/etc", ModeFlags::SCHEDULED).with_restrict("("));
        assert!(config.validate().is_err());
    }

    #[test]
    fn policy_applies_depth_ignore_and_restrict() {
        let watched = WatchedPath::new("/srv/app", ModeFlags::SCHEDULED)
            .with_depth(1)
            .with_ignore("/srv/app/cache")
            .with_ignore("*.swp")
            .with_restrict(r"\.(conf|ini)$");
        let policy = watched.policy().unwrap();

        assert!(policy.check(Path::new("/srv/app/main.conf")).is_ok());
        assert!(policy.check(Path::new("/srv/app/sub/db.ini")).is_ok());
        assert!(policy.check(Path::new("/srv/app/a/b/deep.conf")).unwrap_err().is_policy());
        assert!(policy.check(Path::new("/srv/app/cache/x.conf")).is_err());
        assert!(policy.check(Path::new("/srv/app/.main.conf.swp")).is_err());
        assert!(policy.check(Path::new("/srv/app/readme.md")).is_err());
        assert!(policy.check(Path::new("/srv/other.conf")).is_err());
    }

    #[test]
    fn depth_zero_covers_direct_children_only() {
        let policy = WatchedPath::new("/opt", ModeFlags::SCHEDULED)
            .with_depth(0)
            .policy()
            .unwrap();
        assert!(policy.check(Path::new("/opt/tool")).is_ok());
        assert!(policy.check(Path::new("/opt/sub/tool")).is_err());
        assert!(!policy.may_descend(Path::new("/opt/sub")));
        assert!(policy.may_descend(Path::new("/opt")));
    }
}
