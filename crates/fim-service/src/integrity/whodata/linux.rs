//! Linux audit plumbing: rule management through `auditctl` and the stream
//! socket the audit dispatcher forwards records to.

use super::parser::AuditAssembler;
use super::{AuditRules, WhodataCollector};
use fim_core::error::{FimError, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Audit rules managed by the `auditctl` command line tool.
pub struct Auditctl {
    program: PathBuf,
}

impl Auditctl {
    pub fn new() -> Self {
        Self::with_program("auditctl")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program).args(args).output().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                FimError::AuditUnavailable(format!("{} not found", self.program.display()))
            } else {
                FimError::AuditUnavailable(format!("cannot run {}: {e}", self.program.display()))
            }
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Installing an identical rule twice is not a failure.
            if stderr.contains("Rule exists") {
                return Ok(String::new());
            }
            return Err(FimError::AuditUnavailable(format!(
                "auditctl {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for Auditctl {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditRules for Auditctl {
    fn add_rule(&self, path: &Path, key: &str) -> Result<()> {
        let path = path.to_string_lossy();
        self.run(&["-w", &path, "-p", "wa", "-k", key])?;
        debug!(path = %path, key, "audit rule added");
        Ok(())
    }

    fn remove_rule(&self, path: &Path, key: &str) -> Result<()> {
        let path = path.to_string_lossy();
        self.run(&["-W", &path, "-p", "wa", "-k", key])?;
        debug!(path = %path, key, "audit rule removed");
        Ok(())
    }

    fn list_rules(&self, key: &str) -> Result<Vec<PathBuf>> {
        let listing = self.run(&["-l", "-k", key])?;
        Ok(parse_rule_listing(&listing, key))
    }
}

/// Pull watched paths out of `auditctl -l` output such as
/// `-w /etc -p wa -k fim_whodata`.
pub fn parse_rule_listing(listing: &str, key: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for line in listing.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let value_of = |flag: &str| {
            tokens
                .iter()
                .position(|t| *t == flag)
                .and_then(|i| tokens.get(i + 1).copied())
        };
        let (Some(path), Some(rule_key)) = (value_of("-w"), value_of("-k")) else {
            continue;
        };
        if rule_key == key {
            paths.push(PathBuf::from(path));
        }
    }
    paths
}

/// Bind the record socket, replacing a stale one left by a previous run.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| FimError::access(parent, e))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "stale audit socket removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(FimError::access(path, e)),
    }
    let listener = UnixListener::bind(path).map_err(|e| {
        FimError::AuditUnavailable(format!("cannot bind {}: {e}", path.display()))
    })?;
    info!(path = %path.display(), "audit socket listening");
    Ok(listener)
}

/// Accept dispatcher connections until shutdown.
pub async fn read_socket(
    collector: Arc<WhodataCollector>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    debug!("audit dispatcher connected");
                    if read_stream(&collector, stream, &mut shutdown).await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "audit socket accept failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("audit reader stopped");
}

/// Returns true when shutdown was requested while reading.
async fn read_stream(
    collector: &Arc<WhodataCollector>,
    stream: UnixStream,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut lines = BufReader::new(stream).lines();
    let mut assembler = AuditAssembler::new();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(event) = assembler.push_line(&line) {
                        dispatch(collector, event).await;
                    }
                }
                Ok(None) => {
                    if let Some(event) = assembler.flush() {
                        dispatch(collector, event).await;
                    }
                    debug!("audit dispatcher disconnected");
                    return false;
                }
                Err(err) => {
                    warn!(error = %err, "audit socket read failed");
                    return false;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

async fn dispatch(collector: &Arc<WhodataCollector>, event: super::parser::AuditEvent) {
    let worker = collector.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || worker.handle_event(&event)).await {
        warn!(error = %err, "whodata evaluation panicked");
    }
}
