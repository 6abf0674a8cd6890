//! Managed-service health probing.
//!
//! Running is a liveness query against the process manager. Healthy adds a
//! service-specific probe: for services with a fatal log marker, the marker
//! in the recent log tail marks the service unhealthy even while it runs.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::process::ProcessManager;
use crate::service::{ManagedService, HEALTH_LOG_TAIL_LINES};

/// Observed state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHealth {
    pub running: bool,
    pub healthy: bool,
}

impl ServiceHealth {
    pub fn is_ok(&self) -> bool {
        self.running && self.healthy
    }
}

/// Result of one health pass over the enabled services.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    entries: Vec<(ManagedService, ServiceHealth)>,
}

impl HealthReport {
    pub fn get(&self, service: ManagedService) -> Option<ServiceHealth> {
        self.entries
            .iter()
            .find(|(s, _)| *s == service)
            .map(|(_, h)| *h)
    }

    /// True when every checked service is running and healthy. Vacuously true.
    pub fn all_healthy(&self) -> bool {
        self.entries.iter().all(|(_, h)| h.is_ok())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ManagedService, ServiceHealth)> + '_ {
        self.entries.iter().copied()
    }
}

/// Probes managed services through the process manager.
pub struct HealthMonitor {
    process: Arc<dyn ProcessManager>,
}

impl HealthMonitor {
    pub fn new(process: Arc<dyn ProcessManager>) -> Self {
        Self { process }
    }

    /// Probe each enabled service.
    pub async fn check(&self, enabled: &[ManagedService]) -> HealthReport {
        if enabled.is_empty() {
            info!("No services enabled to monitor");
            return HealthReport::default();
        }

        let mut entries = Vec::with_capacity(enabled.len());
        for &service in enabled {
            let health = self.check_service(service).await;
            if health.is_ok() {
                debug!(service = %service, "Service is running and healthy");
            } else {
                warn!(
                    service = %service,
                    running = health.running,
                    healthy = health.healthy,
                    "Service is degraded"
                );
            }
            entries.push((service, health));
        }
        HealthReport { entries }
    }

    async fn check_service(&self, service: ManagedService) -> ServiceHealth {
        let running = self.process.is_running(service).await;
        if !running {
            return ServiceHealth {
                running,
                healthy: false,
            };
        }

        let Some(marker) = service.fatal_log_marker() else {
            return ServiceHealth {
                running,
                healthy: true,
            };
        };

        let healthy = match self.process.tail_logs(service, HEALTH_LOG_TAIL_LINES).await {
            Ok(logs) => {
                let found = logs.contains(marker);
                if found {
                    warn!(service = %service, marker, "Fatal connectivity marker in recent logs");
                }
                !found
            }
            Err(e) => {
                // The log check did not run, so health is unproven.
                warn!(service = %service, error = %e, "Failed to read service logs, marking unhealthy");
                false
            }
        };
        ServiceHealth { running, healthy }
    }
}
