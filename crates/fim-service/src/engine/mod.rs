//! Agent orchestration: builds the store, registry and collectors from a
//! [`FimConfig`] and owns their background tasks.

use std::sync::Arc;
use std::thread;

use anyhow::Context;
use fim_core::config::{FimConfig, ModeFlags};
use fim_core::paths::default_health_check_dir;
use fim_core::sink::EventSink;
use fim_core::store::EntryStore;
use fim_core::sync::SyncTransport;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::integrity::evaluator::Evaluator;
use crate::integrity::realtime::{platform_backend, ChangeSource, RealtimeCollector};
use crate::integrity::scan_loop::{spawn_scan_loop, ScanLoopHandle};
use crate::integrity::scanner::{ScanSummary, Scanner};
use crate::integrity::sync::{spawn_sync_loop, SyncLoopHandle, Synchronizer};
use crate::integrity::whodata::{platform_rules, AuditHealth, AuditRules, WhodataCollector, WhodataHandle};
use crate::registry::WatchRegistry;

/// Pluggable backends. `None` disables the corresponding collector.
#[derive(Default)]
pub struct EngineOptions {
    pub realtime: Option<Arc<dyn ChangeSource>>,
    pub audit_rules: Option<Arc<dyn AuditRules>>,
    pub transport: Option<Arc<dyn SyncTransport>>,
}

impl EngineOptions {
    /// The platform's native real-time and audit backends, no manager.
    pub fn platform() -> Self {
        Self {
            realtime: Some(platform_backend()),
            audit_rules: Some(platform_rules()),
            transport: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// The core components, wired but without background tasks.
pub struct Components {
    pub store: Arc<EntryStore>,
    pub registry: Arc<WatchRegistry>,
    pub evaluator: Arc<Evaluator>,
    pub scanner: Arc<Scanner>,
}

impl Components {
    /// Open the store and wire the registry, evaluator and scanner. Only a
    /// store failure is fatal.
    pub fn build(
        config: &FimConfig,
        sink: Arc<dyn EventSink>,
        realtime: Option<Arc<dyn ChangeSource>>,
        audit_rules: Option<(Arc<dyn AuditRules>, String)>,
    ) -> anyhow::Result<Self> {
        let store = match &config.database {
            Some(path) => EntryStore::open(path)
                .with_context(|| format!("cannot open entry store {}", path.display()))?,
            None => EntryStore::open_in_memory().context("cannot open in-memory entry store")?,
        };
        let store = Arc::new(store);

        let mut registry = WatchRegistry::new();
        if let Some(source) = realtime {
            registry = registry.with_realtime(source);
        }
        if let Some((rules, key)) = audit_rules {
            registry = registry.with_audit(rules, key);
        }
        let registry = Arc::new(registry);
        let evaluator = Arc::new(Evaluator::new(store.clone(), registry.clone(), sink));
        let scanner = Arc::new(Scanner::new(registry.clone(), evaluator.clone()));
        Ok(Self {
            store,
            registry,
            evaluator,
            scanner,
        })
    }

    /// Register every configured path; unusable ones stay pending.
    pub fn register_all(&self, config: &FimConfig) -> usize {
        let mut registered = 0;
        for watched in &config.directories {
            let path = watched.path.clone();
            match self.registry.register(watched.clone()) {
                Ok(()) => registered += 1,
                Err(err) => warn!(path = %path.display(), error = %err, "watched path not fully registered"),
            }
        }
        registered
    }
}

pub struct FimEngine {
    components: Components,
    shutdown_tx: watch::Sender<bool>,
    realtime_source: Option<Arc<dyn ChangeSource>>,
    realtime_thread: Option<thread::JoinHandle<()>>,
    whodata: Option<WhodataHandle>,
    scan: (JoinHandle<()>, ScanLoopHandle),
    sync: Option<(JoinHandle<()>, SyncLoopHandle)>,
}

impl FimEngine {
    /// Build and start every collector. Must be called inside a tokio
    /// runtime.
    pub fn start(
        config: Arc<FimConfig>,
        sink: Arc<dyn EventSink>,
        options: EngineOptions,
    ) -> anyhow::Result<Self> {
        let wants_whodata = config
            .directories
            .iter()
            .any(|d| d.mode.contains(ModeFlags::WHODATA));
        let audit = options
            .audit_rules
            .clone()
            .map(|rules| (rules, config.whodata.rule_key.clone()));
        let components = Components::build(&config, sink, options.realtime.clone(), audit)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if let Some(source) = &options.realtime {
            if let Err(err) = source.start() {
                warn!(backend = source.name(), error = %err, "real-time backend failed to start");
            }
        }

        let whodata = if wants_whodata {
            Self::start_whodata(&config, &components, options.audit_rules, shutdown_rx.clone())
        } else {
            None
        };

        let registered = components.register_all(&config);
        info!(
            registered,
            pending = components.registry.pending().len(),
            "watched paths registered"
        );

        let realtime_thread = match &options.realtime {
            Some(source) => {
                let collector = Arc::new(RealtimeCollector::new(
                    source.clone(),
                    components.registry.clone(),
                    components.evaluator.clone(),
                    config.rt_delay(),
                ));
                Some(collector.spawn(shutdown_rx.clone())?)
            }
            None => None,
        };

        let scan = spawn_scan_loop(
            components.scanner.clone(),
            config.scan_interval(),
            config.scan_on_start,
        );

        let sync = match options.transport {
            Some(transport) if config.sync.enabled => {
                let synchronizer = Arc::new(Synchronizer::new(
                    components.store.clone(),
                    transport,
                    config.sync.clone(),
                ));
                Some(spawn_sync_loop(
                    synchronizer,
                    std::time::Duration::from_secs(config.sync.interval_secs),
                ))
            }
            _ => None,
        };

        info!(
            directories = config.directories.len(),
            whodata = wants_whodata,
            sync = sync.is_some(),
            "integrity monitoring started"
        );
        Ok(Self {
            components,
            shutdown_tx,
            realtime_source: options.realtime,
            realtime_thread,
            whodata,
            scan,
            sync,
        })
    }

    /// The health-check rule goes in before any whodata root registers, so
    /// a broken audit setup degrades those roots from the start.
    fn start_whodata(
        config: &FimConfig,
        components: &Components,
        rules: Option<Arc<dyn AuditRules>>,
        shutdown: watch::Receiver<bool>,
    ) -> Option<WhodataHandle> {
        let Some(rules) = rules else {
            components.registry.degrade_whodata("no audit backend");
            return None;
        };
        let health_dir = match config.whodata.health_check_dir.clone() {
            Some(dir) => dir,
            None => match default_health_check_dir() {
                Ok(dir) => dir,
                Err(err) => {
                    components.registry.degrade_whodata(&err.to_string());
                    return None;
                }
            },
        };
        let collector = Arc::new(WhodataCollector::new(
            config.whodata.clone(),
            health_dir,
            components.registry.clone(),
            components.evaluator.clone(),
            rules,
        ));
        if let Err(err) = collector.initialize() {
            warn!(error = %err, "whodata initialisation failed");
        }
        match collector.spawn(shutdown) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "whodata collector not started");
                components.registry.degrade_whodata(&err.to_string());
                None
            }
        }
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.components.store
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.components.registry
    }

    /// Request an immediate scheduled pass.
    pub fn scan_now(&self) {
        self.scan.1.run_now();
    }

    pub fn scan_summaries(&self) -> watch::Receiver<Option<ScanSummary>> {
        self.scan.1.summaries.clone()
    }

    pub fn sync_now(&self) {
        if let Some((_, handle)) = &self.sync {
            handle.sync_now();
        }
    }

    pub fn whodata_health(&self) -> Option<watch::Receiver<AuditHealth>> {
        self.whodata.as_ref().map(|w| w.health.clone())
    }

    /// Stop every collector and wait for them to finish.
    pub async fn shutdown(self) {
        info!("integrity monitoring shutting down");
        let _ = self.shutdown_tx.send(true);
        self.scan.1.shutdown();
        if let Some((_, handle)) = &self.sync {
            handle.shutdown();
        }
        if let Some(source) = &self.realtime_source {
            source.stop();
        }
        if let Some(thread) = self.realtime_thread {
            if !matches!(tokio::task::spawn_blocking(move || thread.join()).await, Ok(Ok(()))) {
                warn!("real-time collector did not stop cleanly");
            }
        }
        let _ = self.scan.0.await;
        if let Some((task, _)) = self.sync {
            let _ = task.await;
        }
        if let Some(whodata) = self.whodata {
            whodata.join().await;
        }
    }
}
