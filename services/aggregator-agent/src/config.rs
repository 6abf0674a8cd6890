//! Configuration for the aggregator agent.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// A downstream Elasticsearch instance the log shipper reads from.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticsearchTarget {
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, rename = "pass", skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl fmt::Debug for ElasticsearchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticsearchTarget")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Aggregator identity presented to the control plane.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub auth_secret: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("auth_secret", &"<redacted>")
            .finish()
    }
}

/// Control plane and monitoring endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Full URL of the pull-based sync endpoint.
    pub sync_url: String,

    /// `host[:port]` of the live update channel.
    pub live_update_host: String,

    /// Uptime monitor URL. Empty disables heartbeats.
    pub heartbeat_url: String,

    /// Identifier the uptime monitor knows this node by.
    pub heartbeat_id: String,

    /// Base URL the rendered collector configs post to.
    pub threat_collector_url: String,
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub identity: Identity,

    pub endpoints: Endpoints,

    /// Skip TLS verification; also selects `ws` over `wss`.
    pub skip_verify_tls: bool,

    pub elasticsearch_targets: Vec<ElasticsearchTarget>,

    /// Live channel keepalive ping period.
    pub keepalive_period: Duration,

    /// Network the log shipper needs before it can start.
    pub logship_network: String,

    /// Compose project name for the rendered manifest.
    pub compose_project: String,

    pub debug: bool,
}

const DEFAULT_CONTROLLER_URL: &str = "https://controller.example.invalid";
const DEFAULT_CONTROLLER_HOST: &str = "controller.example.invalid";
const DEFAULT_THREAT_COLLECTOR_URL: &str = "https://threats.example.invalid";

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        // Deployment names first, short aliases second.
        let var_or_alias = |key: &str, alias: &str, default: &str| {
            lookup(key)
                .or_else(|| lookup(alias))
                .unwrap_or_else(|| default.to_string())
        };

        let keepalive_secs = lookup("WS_KEEPALIVE_SECS")
            .and_then(|s| match s.trim().parse::<u64>() {
                Ok(v) if v > 0 => Some(v),
                _ => {
                    warn!(value = %s, "Invalid WS_KEEPALIVE_SECS, using default");
                    None
                }
            })
            .unwrap_or(30);
        let skip_verify_tls = parse_bool("SKIP_VERIFY_TLS", lookup("SKIP_VERIFY_TLS"));
        let debug = parse_bool("DEBUG", lookup("DEBUG"));

        let controller_url = var_or_alias("NFG_TFA_CONTROLLER_URL", "CONTROLLER_URL", DEFAULT_CONTROLLER_URL);
        let sync_url = format!("{}/sync/config", controller_url.trim_end_matches('/'));

        let targets_json = var("ELASTICSEARCH_TARGETS", "[]");
        let elasticsearch_targets: Vec<ElasticsearchTarget> =
            serde_json::from_str(&targets_json).map_err(ConfigError::InvalidTargets)?;

        Ok(Self {
            identity: Identity {
                name: var("AGGREGATOR_NAME", ""),
                auth_secret: var("AUTH_SECRET", ""),
            },
            endpoints: Endpoints {
                sync_url,
                live_update_host: var_or_alias(
                    "NFG_TFA_CONTROLLER_HOST",
                    "CONTROLLER_HOST",
                    DEFAULT_CONTROLLER_HOST,
                ),
                heartbeat_url: var("HEARTBEAT_URL", ""),
                heartbeat_id: var("HEARTBEAT_IDENTIFIER", ""),
                threat_collector_url: var_or_alias(
                    "THREAT_LOG_COLLECTOR_URL",
                    "THREAT_COLLECTOR_URL",
                    DEFAULT_THREAT_COLLECTOR_URL,
                ),
            },
            skip_verify_tls,
            elasticsearch_targets,
            keepalive_period: Duration::from_secs(keepalive_secs),
            logship_network: var("LOGSHIP_NETWORK", "tpotce_nw"),
            compose_project: var("COMPOSE_PROJECT", "aggregator"),
            debug,
        })
    }
}

/// Whether a boolean variable's value means "on". Never logs.
pub fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_bool(key: &str, value: Option<String>) -> bool {
    let Some(value) = value else {
        return false;
    };
    if is_truthy(&value) {
        return true;
    }
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => {}
        _ => warn!(key, value = %value, "Invalid boolean, defaulting to false"),
    }
    false
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(
            config.endpoints.sync_url,
            "https://controller.example.invalid/sync/config"
        );
        assert!(!config.skip_verify_tls);
        assert!(config.elasticsearch_targets.is_empty());
        assert_eq!(config.keepalive_period, Duration::from_secs(30));
        assert_eq!(config.logship_network, "tpotce_nw");
    }

    #[test]
    fn test_targets_and_flags() {
        let config = load(&[
            ("AGGREGATOR_NAME", "agg-1"),
            ("NFG_TFA_CONTROLLER_URL", "http://cp.local:8080/"),
            ("SKIP_VERIFY_TLS", "TRUE"),
            (
                "ELASTICSEARCH_TARGETS",
                r#"[{"url":"https://es1:9200","user":"elastic","pass":"pw"},{"url":"https://es2:9200"}]"#,
            ),
            ("WS_KEEPALIVE_SECS", "15"),
        ])
        .unwrap();

        assert_eq!(config.identity.name, "agg-1");
        assert_eq!(config.endpoints.sync_url, "http://cp.local:8080/sync/config");
        assert!(config.skip_verify_tls);
        assert_eq!(config.elasticsearch_targets.len(), 2);
        assert_eq!(config.elasticsearch_targets[0].password, "pw");
        assert_eq!(config.elasticsearch_targets[1].user, "");
        assert_eq!(config.keepalive_period, Duration::from_secs(15));
    }

    #[test]
    fn test_deployment_names_and_aliases() {
        let config = load(&[
            ("NFG_TFA_CONTROLLER_URL", "https://cp.prod"),
            ("NFG_TFA_CONTROLLER_HOST", "cp.prod:8443"),
            ("THREAT_LOG_COLLECTOR_URL", "https://threats.prod"),
        ])
        .unwrap();
        assert_eq!(config.endpoints.sync_url, "https://cp.prod/sync/config");
        assert_eq!(config.endpoints.live_update_host, "cp.prod:8443");
        assert_eq!(config.endpoints.threat_collector_url, "https://threats.prod");

        let config = load(&[
            ("CONTROLLER_URL", "https://cp.alias"),
            ("CONTROLLER_HOST", "cp.alias"),
            ("THREAT_COLLECTOR_URL", "https://threats.alias"),
        ])
        .unwrap();
        assert_eq!(config.endpoints.sync_url, "https://cp.alias/sync/config");
        assert_eq!(config.endpoints.live_update_host, "cp.alias");
        assert_eq!(config.endpoints.threat_collector_url, "https://threats.alias");

        // The deployment name wins when both are set.
        let config = load(&[
            ("NFG_TFA_CONTROLLER_HOST", "cp.prod"),
            ("CONTROLLER_HOST", "cp.alias"),
        ])
        .unwrap();
        assert_eq!(config.endpoints.live_update_host, "cp.prod");
    }

    #[rstest]
    #[case("true", true)]
    #[case(" ON ", true)]
    #[case("1", true)]
    #[case("false", false)]
    #[case("maybe", false)]
    #[case("", false)]
    fn test_is_truthy(#[case] value: &str, #[case] expected: bool) {
        assert_eq!(is_truthy(value), expected);
    }

    #[test]
    fn test_malformed_targets_is_fatal() {
        let err = load(&[("ELASTICSEARCH_TARGETS", "{not json")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTargets(_)));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = load(&[
            ("AUTH_SECRET", "hunter2"),
            (
                "ELASTICSEARCH_TARGETS",
                r#"[{"url":"https://es1:9200","user":"elastic","pass":"s3cret"}]"#,
            ),
        ])
        .unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("s3cret"));
    }
}
