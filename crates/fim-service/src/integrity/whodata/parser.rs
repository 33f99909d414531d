//! Textual auditd record parsing.
//!
//! One audit event spans several lines sharing the same
//! `msg=audit(<timestamp>:<serial>)` id. Lines are folded into an
//! [`AuditEvent`] until an `EOE` record arrives or a line with another id
//! shows up.

use fim_core::event::Actor;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Audit separates multiple rule keys with this byte.
const KEY_SEPARATOR: char = '\u{1}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathItem {
    pub name: String,
    pub nametype: Option<String>,
}

/// A complete audit event, reduced to the fields FIM needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditEvent {
    pub id: String,
    pub keys: Vec<String>,
    pub success: Option<bool>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub auid: Option<String>,
    pub pid: Option<u32>,
    pub ppid: Option<u32>,
    pub comm: Option<String>,
    pub exe: Option<String>,
    pub cwd: Option<String>,
    pub paths: Vec<PathItem>,
    pub argv: Vec<String>,
    pub proctitle: Option<String>,
}

impl AuditEvent {
    /// Records without a `success` field count as successful.
    pub fn failed(&self) -> bool {
        self.success == Some(false)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    /// Paths touched by the event. Parent-directory items are dropped and
    /// relative names are resolved against the working directory.
    pub fn resolved_paths(&self) -> Vec<PathBuf> {
        let mut resolved = Vec::new();
        for item in &self.paths {
            if item.nametype.as_deref() == Some("PARENT") {
                continue;
            }
            let name = Path::new(&item.name);
            let path = if name.is_absolute() {
                name.to_path_buf()
            } else {
                match &self.cwd {
                    Some(cwd) => Path::new(cwd).join(name),
                    None => continue,
                }
            };
            let path = normalize(&path);
            if !resolved.contains(&path) {
                resolved.push(path);
            }
        }
        resolved
    }

    pub fn actor(&self) -> Actor {
        let command_line = if self.argv.is_empty() {
            self.proctitle.clone()
        } else {
            Some(self.argv.join(" "))
        };
        Actor {
            user_id: self.uid.clone(),
            user_name: None,
            group_id: self.gid.clone(),
            audit_uid: self.auid.clone(),
            process_id: self.pid,
            parent_pid: self.ppid,
            process_name: self.exe.clone().or_else(|| self.comm.clone()),
            command_line,
            cwd: self.cwd.clone(),
        }
    }

    fn absorb(&mut self, record_type: &str, fields: &BTreeMap<&str, &str>) {
        match record_type {
            "SYSCALL" => {
                if let Some(key) = fields.get("key").and_then(|v| decode_value(v)) {
                    self.keys
                        .extend(key.split(KEY_SEPARATOR).map(str::to_string));
                }
                self.success = fields.get("success").map(|v| *v == "yes");
                self.uid = fields.get("uid").map(|v| v.to_string());
                self.gid = fields.get("gid").map(|v| v.to_string());
                self.auid = fields.get("auid").map(|v| v.to_string());
                self.pid = fields.get("pid").and_then(|v| v.parse().ok());
                self.ppid = fields.get("ppid").and_then(|v| v.parse().ok());
                self.comm = fields.get("comm").and_then(|v| decode_value(v));
                self.exe = fields.get("exe").and_then(|v| decode_value(v));
            }
            "CWD" => self.cwd = fields.get("cwd").and_then(|v| decode_value(v)),
            "PATH" => {
                if let Some(name) = fields.get("name").and_then(|v| decode_value(v)) {
                    self.paths.push(PathItem {
                        name,
                        nametype: fields.get("nametype").map(|v| v.to_string()),
                    });
                }
            }
            "EXECVE" => {
                let argc: usize = fields
                    .get("argc")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                self.argv = (0..argc)
                    .filter_map(|i| fields.get(format!("a{i}").as_str()).and_then(|v| decode_value(v)))
                    .collect();
            }
            "PROCTITLE" => {
                self.proctitle = fields
                    .get("proctitle")
                    .and_then(|v| decode_value(v))
                    .map(|title| title.replace('\0', " ").trim().to_string());
            }
            _ => {}
        }
    }
}

/// Groups lines into events.
#[derive(Debug, Default)]
pub struct AuditAssembler {
    current: Option<AuditEvent>,
}

impl AuditAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns an event when this line completed one.
    pub fn push_line(&mut self, line: &str) -> Option<AuditEvent> {
        let Some((record_type, id, body)) = split_header(line) else {
            return None;
        };
        let mut completed = None;
        if self.current.as_ref().is_some_and(|event| event.id != id) {
            completed = self.current.take();
        }
        if record_type == "EOE" {
            // An EOE for the event being built closes it; a stray one is ignored.
            if self.current.as_ref().is_some_and(|event| event.id == id) {
                return self.current.take();
            }
            return completed;
        }
        let event = self.current.get_or_insert_with(|| AuditEvent {
            id: id.to_string(),
            ..Default::default()
        });
        event.absorb(record_type, &parse_fields(body));
        completed
    }

    /// Return whatever is half-built, e.g. when the stream ends.
    pub fn flush(&mut self) -> Option<AuditEvent> {
        self.current.take()
    }
}

/// `type=X msg=audit(ID): body` → `(X, ID, body)`. A `node=` prefix from
/// the dispatcher is tolerated.
fn split_header(line: &str) -> Option<(&str, &str, &str)> {
    let line = &line[line.find("type=")?..];
    let (type_part, rest) = line.split_once(' ')?;
    let record_type = type_part.strip_prefix("type=")?;
    let rest = rest.trim_start().strip_prefix("msg=audit(")?;
    let (id, body) = rest.split_once("):")?;
    Some((record_type, id, body.trim()))
}

fn parse_fields(body: &str) -> BTreeMap<&str, &str> {
    body.split_whitespace()
        .filter_map(|token| token.split_once('='))
        .collect()
}

/// Untrusted audit strings are either double-quoted or hex-encoded;
/// `(null)` means absent.
fn decode_value(raw: &str) -> Option<String> {
    if raw == "(null)" || raw.is_empty() {
        return None;
    }
    if let Some(quoted) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        return Some(quoted.to_string());
    }
    match hex::decode(raw) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(_) => Some(raw.to_string()),
    }
}

/// Lexically fold `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
