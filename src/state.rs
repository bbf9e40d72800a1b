use crate::config::ConfigStore;
use crate::controller::Reconciler;
use crate::drift::{Classification, Severity};
use crate::sink::ObservabilitySink;
use crate::tag_resolver::RegistryTagResolver;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

/// Drift of one observed container, recomputed every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftResult {
    pub image: String,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub current_tag: String,
    pub desired_tag: String,
    pub latest_matching_tag: Option<String>,
    pub classification: Classification,
    /// Major delta `current - desired`
    pub magnitude: i64,
    pub severity: Severity,
    pub latest_satisfies_desired: bool,
    pub current_satisfies_desired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Published(usize),
    Abandoned,
    AlreadyRunning,
}

pub struct ControllerContext {
    pub(crate) reconciler: Reconciler,
    pub(crate) resolver: Arc<RegistryTagResolver>,
    pub(crate) config: Arc<ConfigStore>,
    pub(crate) sink: Arc<dyn ObservabilitySink>,
    cycle_lock: Arc<Mutex<()>>,
}

impl ControllerContext {
    pub fn new(
        reconciler: Reconciler,
        resolver: Arc<RegistryTagResolver>,
        config: Arc<ConfigStore>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        Self {
            reconciler,
            resolver,
            config,
            sink,
            cycle_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Claims the right to run a cycle, `None` while another cycle is in flight.
    pub fn try_begin_cycle(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.cycle_lock).try_lock_owned().ok()
    }

    /// Runs one cycle unless one is already running, cycles never overlap.
    pub async fn trigger_cycle(&self) -> CycleOutcome {
        match self.try_begin_cycle() {
            Some(guard) => self.run_cycle(guard).await,
            None => {
                info!("Skipping version check, the previous one is still running");
                CycleOutcome::AlreadyRunning
            }
        }
    }

    pub async fn run_cycle(&self, _guard: OwnedMutexGuard<()>) -> CycleOutcome {
        match self.reconciler.run_cycle().await {
            Some(results) => {
                let count = results.len();
                self.sink.publish(results).await;
                CycleOutcome::Published(count)
            }
            None => CycleOutcome::Abandoned,
        }
    }

    /// Swaps in a freshly loaded config and drops cached tag lists, as registry credentials
    /// may have changed. A failed reload leaves the current config and cache untouched.
    pub async fn reload_config(&self) -> anyhow::Result<()> {
        let previous = self.config.snapshot().await;
        let reloaded = match self.config.reload().await {
            Ok(config) => config,
            Err(e) => {
                warn!("Config reload failed, keeping the current config: {:?}", e);
                return Err(e);
            }
        };
        let ignored = reloaded.changed_startup_settings(&previous);
        if !ignored.is_empty() {
            warn!(
                "Reloaded config changes {} which only take effect after a restart",
                ignored.join(", ")
            );
        }
        self.resolver.clear_cache().await;
        Ok(())
    }
}
