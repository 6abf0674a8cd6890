//! Shared desired configuration.
//!
//! The flag setters compare and swap under one lock and, on an actual
//! change, enqueue exactly one [`ReconcileIntent`]. A single reconciler task
//! drains the queue serially (see [`crate::reconciler`]).
//!
//! The live channel and the periodic sync both write here. Last write wins.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, ElasticsearchTarget, Endpoints, Identity};
use crate::service::ManagedService;

/// Desired-state message pushed or polled from the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdateMessage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub syslog_enabled: bool,
    #[serde(default)]
    pub logstash_enabled: bool,
}

/// Which writer applied a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    LiveChannel,
    PeriodicSync,
}

impl std::fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateSource::LiveChannel => write!(f, "live_channel"),
            UpdateSource::PeriodicSync => write!(f, "periodic_sync"),
        }
    }
}

/// Request to converge one service to a new desired flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileIntent {
    pub service: ManagedService,
    pub enabled: bool,
    pub source: UpdateSource,
}

/// Per-service enable flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceFlags {
    pub syslog_enabled: bool,
    pub logstash_enabled: bool,
}

impl ServiceFlags {
    pub fn is_enabled(&self, service: ManagedService) -> bool {
        match service {
            ManagedService::SyslogCollector => self.syslog_enabled,
            ManagedService::LogShipper => self.logstash_enabled,
        }
    }

    fn slot_mut(&mut self, service: ManagedService) -> &mut bool {
        match service {
            ManagedService::SyslogCollector => &mut self.syslog_enabled,
            ManagedService::LogShipper => &mut self.logstash_enabled,
        }
    }

    /// Services whose flag is set.
    pub fn enabled(&self) -> Vec<ManagedService> {
        ManagedService::ALL
            .into_iter()
            .filter(|s| self.is_enabled(*s))
            .collect()
    }
}

/// Point-in-time copy of the desired configuration.
#[derive(Debug, Clone)]
pub struct DesiredSnapshot {
    pub identity: Identity,
    pub endpoints: Endpoints,
    pub flags: ServiceFlags,
    pub elasticsearch_targets: Vec<ElasticsearchTarget>,
    pub skip_verify_tls: bool,
    pub keepalive_period: Duration,
}

/// Shared, process-lifetime desired configuration.
pub struct DesiredConfig {
    identity: Identity,
    endpoints: Endpoints,
    elasticsearch_targets: Vec<ElasticsearchTarget>,
    skip_verify_tls: bool,
    keepalive_period: Duration,
    flags: Mutex<ServiceFlags>,
    intents: mpsc::UnboundedSender<ReconcileIntent>,
}

impl DesiredConfig {
    /// Build from static configuration. All services start disabled.
    ///
    /// Returns the receiving end of the intent queue.
    pub fn new(config: &Config) -> (Self, mpsc::UnboundedReceiver<ReconcileIntent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let desired = Self {
            identity: config.identity.clone(),
            endpoints: config.endpoints.clone(),
            elasticsearch_targets: config.elasticsearch_targets.clone(),
            skip_verify_tls: config.skip_verify_tls,
            keepalive_period: config.keepalive_period,
            flags: Mutex::new(ServiceFlags::default()),
            intents: tx,
        };
        (desired, rx)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn skip_verify_tls(&self) -> bool {
        self.skip_verify_tls
    }

    pub fn keepalive_period(&self) -> Duration {
        self.keepalive_period
    }

    pub fn flags(&self) -> ServiceFlags {
        *self.lock_flags()
    }

    pub fn snapshot(&self) -> DesiredSnapshot {
        DesiredSnapshot {
            identity: self.identity.clone(),
            endpoints: self.endpoints.clone(),
            flags: self.flags(),
            elasticsearch_targets: self.elasticsearch_targets.clone(),
            skip_verify_tls: self.skip_verify_tls,
            keepalive_period: self.keepalive_period,
        }
    }

    /// Set one service flag. Returns true if the value changed.
    ///
    /// A change enqueues one reconciliation intent; a redundant write is a no-op.
    pub fn set_enabled(&self, service: ManagedService, enabled: bool, source: UpdateSource) -> bool {
        let mut flags = self.lock_flags();
        let slot = flags.slot_mut(service);
        if *slot == enabled {
            debug!(service = %service, enabled, source = %source, "Flag unchanged");
            return false;
        }
        *slot = enabled;

        // Enqueue while still holding the lock so intents stay in write order.
        let intent = ReconcileIntent {
            service,
            enabled,
            source,
        };
        if self.intents.send(intent).is_err() {
            warn!(service = %service, "Reconciler gone, intent dropped");
        }
        info!(service = %service, enabled, source = %source, "Desired flag changed");
        true
    }

    pub fn set_syslog_enabled(&self, enabled: bool, source: UpdateSource) -> bool {
        self.set_enabled(ManagedService::SyslogCollector, enabled, source)
    }

    pub fn set_logstash_enabled(&self, enabled: bool, source: UpdateSource) -> bool {
        self.set_enabled(ManagedService::LogShipper, enabled, source)
    }

    /// Apply both flags from a control-plane message.
    pub fn apply(&self, update: &ConfigUpdateMessage, source: UpdateSource) {
        self.set_syslog_enabled(update.syslog_enabled, source);
        self.set_logstash_enabled(update.logstash_enabled, source);

        let flags = self.flags();
        info!(
            name = %update.name,
            source = %source,
            syslog_enabled = flags.syslog_enabled,
            logstash_enabled = flags.logstash_enabled,
            "Stored config"
        );
    }

    fn lock_flags(&self) -> std::sync::MutexGuard<'_, ServiceFlags> {
        // The guarded value is two bools; a poisoned lock still holds a valid one.
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }
}
