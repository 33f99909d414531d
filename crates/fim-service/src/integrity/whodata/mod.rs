//! Whodata: change attribution through the kernel audit subsystem.
//!
//! Audit rules on every whodata root make the kernel emit records naming
//! the process and user behind each write. A reader task turns those
//! records into evaluations tagged `whodata`. Two supervisors run beside it:
//!
//! - the health check touches a file in a private directory watched with
//!   its own key and expects the matching record within a bounded time;
//! - the reload task re-installs rules that were flushed from outside.
//!
//! Whenever the mechanism is unusable the registry degrades whodata roots to
//! real-time monitoring. They stay degraded until a reload succeeds while
//! records are flowing again.

pub mod parser;

#[cfg(target_os = "linux")]
pub mod linux;

use crate::integrity::evaluator::{user_name, Evaluator};
use crate::registry::WatchRegistry;
use fim_core::config::WhodataSettings;
use fim_core::entry::DetectionMode;
use fim_core::error::{FimError, Result};
use parser::AuditEvent;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HEALTH_PROBE_FILE: &str = "fim_health_probe";

/// Installation and listing of audit watch rules.
pub trait AuditRules: Send + Sync {
    fn add_rule(&self, path: &Path, key: &str) -> Result<()>;

    fn remove_rule(&self, path: &Path, key: &str) -> Result<()>;

    /// Paths currently watched with `key`.
    fn list_rules(&self, key: &str) -> Result<Vec<PathBuf>>;
}

/// Rule backend for platforms without the Linux audit subsystem.
pub struct UnavailableRules;

impl AuditRules for UnavailableRules {
    fn add_rule(&self, _path: &Path, _key: &str) -> Result<()> {
        Err(unavailable())
    }

    fn remove_rule(&self, _path: &Path, _key: &str) -> Result<()> {
        Ok(())
    }

    fn list_rules(&self, _key: &str) -> Result<Vec<PathBuf>> {
        Err(unavailable())
    }
}

fn unavailable() -> FimError {
    FimError::AuditUnavailable("whodata requires the Linux audit subsystem".into())
}

pub fn platform_rules() -> Arc<dyn AuditRules> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::Auditctl::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(UnavailableRules)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditHealth {
    Starting,
    Healthy,
    /// Records stopped arriving; whodata roots run on real-time.
    Degraded(String),
    /// The audit mechanism could not be set up at all.
    Unavailable(String),
}

pub struct WhodataHandle {
    pub health: watch::Receiver<AuditHealth>,
    tasks: Vec<JoinHandle<()>>,
}

impl WhodataHandle {
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

pub struct WhodataCollector {
    settings: WhodataSettings,
    health_dir: PathBuf,
    registry: Arc<WatchRegistry>,
    evaluator: Arc<Evaluator>,
    rules: Arc<dyn AuditRules>,
    health_tx: watch::Sender<AuditHealth>,
    health_records: watch::Sender<u64>,
}

impl WhodataCollector {
    pub fn new(
        settings: WhodataSettings,
        health_dir: PathBuf,
        registry: Arc<WatchRegistry>,
        evaluator: Arc<Evaluator>,
        rules: Arc<dyn AuditRules>,
    ) -> Self {
        let (health_tx, _) = watch::channel(AuditHealth::Starting);
        let (health_records, _) = watch::channel(0);
        Self {
            settings,
            health_dir,
            registry,
            evaluator,
            rules,
            health_tx,
            health_records,
        }
    }

    pub fn settings(&self) -> &WhodataSettings {
        &self.settings
    }

    pub fn health(&self) -> watch::Receiver<AuditHealth> {
        self.health_tx.subscribe()
    }

    fn set_health(&self, health: AuditHealth) {
        self.health_tx.send_replace(health);
    }

    /// Install the health-check rule. Must succeed before any whodata root
    /// is registered, otherwise those roots start out degraded.
    pub fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.health_dir).map_err(|e| FimError::access(&self.health_dir, e))?;
        match self
            .rules
            .add_rule(&self.health_dir, &self.settings.health_check_key)
        {
            Ok(()) => {
                info!(dir = %self.health_dir.display(), "audit health-check rule installed");
                Ok(())
            }
            Err(err) => {
                self.fail(AuditHealth::Unavailable(err.to_string()));
                Err(err)
            }
        }
    }

    fn fail(&self, health: AuditHealth) {
        let reason = match &health {
            AuditHealth::Degraded(reason) | AuditHealth::Unavailable(reason) => reason.clone(),
            _ => String::new(),
        };
        self.set_health(health);
        self.registry.degrade_whodata(&reason);
    }

    /// Route one assembled audit event. Returns the number of change events
    /// it produced.
    pub fn handle_event(&self, event: &AuditEvent) -> usize {
        if event.has_key(&self.settings.health_check_key) {
            self.health_records.send_modify(|seen| *seen += 1);
            return 0;
        }
        if !event.has_key(&self.settings.rule_key) {
            return 0;
        }
        if event.failed() {
            debug!(id = %event.id, pid = event.pid, "failed syscall skipped");
            return 0;
        }
        let mut actor = event.actor();
        actor.user_name = actor
            .user_id
            .as_deref()
            .and_then(|uid| uid.parse().ok())
            .and_then(user_name);

        let mut produced = 0;
        for path in event.resolved_paths() {
            debug!(path = %path.display(), pid = event.pid, "whodata record");
            produced += self
                .evaluator
                .evaluate_path(&path, DetectionMode::Whodata, Some(actor.clone()))
                .len();
        }
        produced
    }

    /// Touch the probe file and wait for its audit record.
    pub async fn probe(&self) -> Result<()> {
        let timeout = Duration::from_secs(self.settings.health_check_timeout_secs);
        let mut seen = self.health_records.subscribe();
        seen.borrow_and_update();
        let probe = self.health_dir.join(HEALTH_PROBE_FILE);
        tokio::fs::write(&probe, chrono::Utc::now().to_rfc3339())
            .await
            .map_err(|e| FimError::access(&probe, e))?;
        match tokio::time::timeout(timeout, seen.changed()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(FimError::AuditUnavailable("health channel closed".into())),
            Err(_) => Err(FimError::AuditUnavailable(format!(
                "no audit record within {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn run_health_check(&self) {
        match self.probe().await {
            Ok(()) => {
                if *self.health_tx.borrow() != AuditHealth::Healthy {
                    info!("audit health check passed");
                }
                self.set_health(AuditHealth::Healthy);
            }
            Err(err) => {
                warn!(error = %err, "audit health check failed");
                self.fail(AuditHealth::Degraded(err.to_string()));
            }
        }
    }

    /// Re-install missing rules; restore whodata when records are flowing.
    /// Blocking: shells out to the rule backend.
    pub fn reload(&self) -> Result<usize> {
        let mut reinstalled = 0;
        let watched: HashSet<PathBuf> = self
            .rules
            .list_rules(&self.settings.rule_key)?
            .into_iter()
            .map(|p| strip_trailing_separator(&p))
            .collect();
        for root in self.registry.whodata_paths() {
            if !watched.contains(&strip_trailing_separator(&root)) {
                self.rules.add_rule(&root, &self.settings.rule_key)?;
                reinstalled += 1;
            }
        }
        let health_rules = self.rules.list_rules(&self.settings.health_check_key)?;
        if !health_rules
            .iter()
            .any(|p| strip_trailing_separator(p) == strip_trailing_separator(&self.health_dir))
        {
            self.rules
                .add_rule(&self.health_dir, &self.settings.health_check_key)?;
            reinstalled += 1;
        }
        if reinstalled > 0 {
            info!(rules = reinstalled, "audit rules re-installed");
        }
        if self.registry.is_whodata_degraded() && *self.health_tx.borrow() == AuditHealth::Healthy {
            self.registry.install_audit_rules()?;
            self.registry.restore_whodata();
        }
        Ok(reinstalled)
    }

    /// Start the reader and both supervisors.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<WhodataHandle> {
        #[cfg(not(target_os = "linux"))]
        {
            drop(shutdown);
            self.set_health(AuditHealth::Unavailable(unavailable().to_string()));
            return Err(unavailable());
        }
        #[cfg(target_os = "linux")]
        {
            let listener = linux::bind_socket(&self.settings.audit_socket)?;
            let tasks = vec![
                tokio::spawn(linux::read_socket(self.clone(), listener, shutdown.clone())),
                spawn_health_loop(self.clone(), shutdown.clone()),
                spawn_reload_loop(self.clone(), shutdown),
            ];
            Ok(WhodataHandle {
                health: self.health(),
                tasks,
            })
        }
    }
}

fn strip_trailing_separator(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    let trimmed = text.trim_end_matches(std::path::MAIN_SEPARATOR);
    if trimmed.is_empty() {
        path.to_path_buf()
    } else {
        PathBuf::from(trimmed)
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn spawn_health_loop(
    collector: Arc<WhodataCollector>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(collector.settings.health_check_interval_secs.max(1));
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "audit health check started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                debug!("audit health check shutting down");
                return;
            }
            collector.run_health_check().await;
        }
    })
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn spawn_reload_loop(
    collector: Arc<WhodataCollector>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(collector.settings.reload_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                debug!("audit rule reload shutting down");
                return;
            }
            let worker = collector.clone();
            match tokio::task::spawn_blocking(move || worker.reload()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "audit rule reload failed");
                    collector.fail(AuditHealth::Unavailable(err.to_string()));
                }
                Err(err) => warn!(error = %err, "audit rule reload panicked"),
            }
        }
    })
}
