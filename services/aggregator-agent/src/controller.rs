//! Service controller: converges managed services to the desired flags.
//!
//! Two entry points:
//! - [`ServiceController::reconcile_on_flag_change`], driven by the reconciler
//!   task whenever a desired flag flips.
//! - [`ServiceController::reconcile_unhealthy`], driven by the monitor loop
//!   every tick, restarting degraded services under exponential backoff.
//!
//! Lifecycle actions are serialised by one async lock so the two paths never
//! interleave on the process manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffState, Gate};
use crate::desired::DesiredConfig;
use crate::error::ControllerError;
use crate::health::ServiceHealth;
use crate::process::ProcessManager;
use crate::render::ConfigRenderer;
use crate::service::ManagedService;

/// What the monitor tick decided for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Service is not desired; nothing to do.
    Disabled,
    /// Running and healthy.
    Healthy,
    /// Running and healthy again; backoff reset to the floor.
    Reset,
    /// Restarted; the next restart is allowed after `next_delay`.
    Restarted { next_delay: Duration },
    /// Still inside the backoff window.
    Waiting { remaining: Duration },
    /// Restart attempted and failed; retried next tick.
    Failed,
}

/// Desired/actual reconciliation for managed services.
pub struct ServiceController {
    desired: Arc<DesiredConfig>,
    process: Arc<dyn ProcessManager>,
    renderer: Arc<dyn ConfigRenderer>,
    dependency_network: String,
    ops: AsyncMutex<()>,
    // Only the monitor loop touches this; the lock is never held across an await.
    backoff: Mutex<HashMap<ManagedService, BackoffState>>,
}

impl ServiceController {
    pub fn new(
        desired: Arc<DesiredConfig>,
        process: Arc<dyn ProcessManager>,
        renderer: Arc<dyn ConfigRenderer>,
        dependency_network: impl Into<String>,
    ) -> Self {
        let backoff = ManagedService::ALL
            .into_iter()
            .filter_map(|s| s.restart_backoff().map(|p| (s, BackoffState::new(p))))
            .collect();

        Self {
            desired,
            process,
            renderer,
            dependency_network: dependency_network.into(),
            ops: AsyncMutex::new(()),
            backoff: Mutex::new(backoff),
        }
    }

    /// Converge one service after its desired flag changed.
    ///
    /// Failures are logged and abort this attempt; they are not retried until
    /// the next flip or the monitor loop notices the service missing.
    pub async fn reconcile_on_flag_change(&self, service: ManagedService, enabled: bool) {
        let _guard = self.ops.lock().await;

        if enabled {
            info!(service = %service, "Service enabled, generating config and starting");
            match self.bring_up(service, service.force_remove_before_start()).await {
                Ok(()) => info!(service = %service, "Service started"),
                Err(e) => error!(service = %service, error = %e, "Failed to start service"),
            }
        } else {
            info!(service = %service, "Service disabled, stopping");
            self.take_down(service).await;
        }
    }

    /// Restart a degraded service when its backoff window allows.
    ///
    /// Must only be called from the monitor loop, one tick at a time.
    pub async fn reconcile_unhealthy(
        &self,
        service: ManagedService,
        health: ServiceHealth,
        now: Instant,
    ) -> RestartDecision {
        if !self.desired.flags().is_enabled(service) {
            return RestartDecision::Disabled;
        }

        if health.is_ok() {
            let reset = self
                .with_backoff(service, |b| b.record_recovery())
                .unwrap_or(false);
            if reset {
                info!(service = %service, "Service recovered, backoff reset");
                return RestartDecision::Reset;
            }
            return RestartDecision::Healthy;
        }

        if let Some(Gate::Wait { remaining }) = self.with_backoff(service, |b| b.gate(now)) {
            info!(
                service = %service,
                remaining_secs = remaining.as_secs(),
                "Service unhealthy, waiting for backoff window"
            );
            return RestartDecision::Waiting { remaining };
        }

        warn!(
            service = %service,
            running = health.running,
            healthy = health.healthy,
            "Service unhealthy, restarting"
        );

        let result = {
            let _guard = self.ops.lock().await;
            // The flag may have flipped while waiting for the lock.
            if !self.desired.flags().is_enabled(service) {
                return RestartDecision::Disabled;
            }
            self.restart(service).await
        };

        // The attempt counts against the window whether or not it succeeded.
        let next_delay = self.with_backoff(service, |b| b.record_action(now));

        match result {
            Ok(()) => {
                info!(
                    service = %service,
                    next_delay_secs = next_delay.map(|d| d.as_secs()),
                    "Service restarted"
                );
                RestartDecision::Restarted {
                    next_delay: next_delay.unwrap_or(Duration::ZERO),
                }
            }
            Err(e) => {
                error!(service = %service, error = %e, "Failed to restart service");
                RestartDecision::Failed
            }
        }
    }

    /// Stop every managed service. Used at shutdown.
    pub async fn stop_all(&self) {
        let _guard = self.ops.lock().await;
        for service in ManagedService::ALL {
            if let Err(e) = self.process.stop(service).await {
                error!(service = %service, error = %e, "Failed to stop service");
            }
        }
    }

    /// Current backoff delay for a service, if it has one.
    pub fn backoff_delay(&self, service: ManagedService) -> Option<Duration> {
        self.with_backoff(service, |b| b.current_delay())
    }

    fn with_backoff<T>(&self, service: ManagedService, f: impl FnOnce(&mut BackoffState) -> T) -> Option<T> {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        backoff.get_mut(&service).map(f)
    }

    async fn bring_up(&self, service: ManagedService, remove_stale: bool) -> Result<(), ControllerError> {
        let text = self.renderer.render(service, &self.desired.snapshot())?;
        self.process.install_config(service, &text).await?;
        debug!(service = %service, "Generated config");

        if remove_stale {
            self.process.force_remove(service).await?;
        }

        if service.requires_dependency() && !self.process.dependency_exists(&self.dependency_network).await {
            return Err(ControllerError::MissingDependency(self.dependency_network.clone()));
        }

        self.process.start(service).await?;
        Ok(())
    }

    async fn restart(&self, service: ManagedService) -> Result<(), ControllerError> {
        self.bring_up(service, true).await
    }

    async fn take_down(&self, service: ManagedService) {
        match self.process.stop(service).await {
            Ok(()) => info!(service = %service, "Stopped service"),
            Err(e) => error!(service = %service, error = %e, "Failed to stop service"),
        }

        if service.deletes_config_on_disable() {
            match self.process.remove_config(service).await {
                Ok(()) => info!(service = %service, "Deleted service config"),
                Err(e) => error!(service = %service, error = %e, "Failed to delete service config"),
            }
        }
    }
}
