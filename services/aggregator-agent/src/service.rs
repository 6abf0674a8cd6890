//! The closed set of services managed on this node.
//!
//! Behaviour that differs between services is a lookup on [`ManagedService`]
//! rather than a trait object: the set is fixed and known at compile time.

use std::fmt;

use crate::backoff::BackoffPolicy;

/// A managed service identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ManagedService {
    /// syslog-ng collector receiving firewall and NAC syslog streams.
    SyslogCollector,
    /// logstash pipeline shipping honeypot events from Elasticsearch.
    LogShipper,
}

impl ManagedService {
    /// Every managed service, in reconciliation order.
    pub const ALL: [ManagedService; 2] = [ManagedService::SyslogCollector, ManagedService::LogShipper];

    /// Stable identifier used in logs.
    pub fn id(&self) -> &'static str {
        match self {
            ManagedService::SyslogCollector => "syslog-collector",
            ManagedService::LogShipper => "log-shipper",
        }
    }

    /// Container/compose service name.
    pub fn container_name(&self) -> &'static str {
        match self {
            ManagedService::SyslogCollector => "nfg-syslog",
            ManagedService::LogShipper => "nfg-logstash",
        }
    }

    /// File name of the generated configuration artifact.
    pub fn config_file_name(&self) -> &'static str {
        match self {
            ManagedService::SyslogCollector => "syslog-ng.conf",
            ManagedService::LogShipper => "logstash.conf",
        }
    }

    /// Log line that marks the service unhealthy even while it runs.
    pub fn fatal_log_marker(&self) -> Option<&'static str> {
        match self {
            ManagedService::SyslogCollector => None,
            // Emitted by the elasticsearch input when the sink host cannot be resolved.
            ManagedService::LogShipper => Some("Manticore::ResolutionFailure"),
        }
    }

    /// Restart backoff for services with a health probe beyond liveness.
    pub fn restart_backoff(&self) -> Option<BackoffPolicy> {
        self.fatal_log_marker().map(|_| BackoffPolicy::default())
    }

    /// Whether a stale instance must be force-removed before starting.
    pub fn force_remove_before_start(&self) -> bool {
        matches!(self, ManagedService::LogShipper)
    }

    /// Whether the generated configuration is deleted when disabled.
    pub fn deletes_config_on_disable(&self) -> bool {
        !matches!(self, ManagedService::LogShipper)
    }

    /// Whether starting requires the external dependency network.
    pub fn requires_dependency(&self) -> bool {
        matches!(self, ManagedService::LogShipper)
    }
}

impl fmt::Display for ManagedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Number of log lines inspected by the deeper health probe.
pub const HEALTH_LOG_TAIL_LINES: usize = 100;
