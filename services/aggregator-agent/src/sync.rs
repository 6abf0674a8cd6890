//! Pull-based configuration sync with the control plane.
//!
//! Fallback for pushes the live channel missed. Transport failures and 5xx
//! responses are retried with exponential backoff; anything else is terminal
//! for the call and the caller tries again on its next tick.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::desired::{ConfigUpdateMessage, DesiredConfig, UpdateSource};
use crate::error::SyncError;

/// Header carrying the shared auth secret.
pub const AUTH_KEY_HEADER: &str = "x_auth_key";

/// Header carrying the aggregator name.
pub const AGGREGATOR_NAME_HEADER: &str = "x_aggregator_name";

/// Sync response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigResponse {
    pub config: ConfigUpdateMessage,
}

/// Retry configuration for one sync call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub max_retries: u32,

    /// Sleep before the first retry; doubles after each.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Sleeps between consecutive attempts, in order.
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.max_retries)
            .map(|i| self.initial_backoff.saturating_mul(1 << i.min(16)))
            .collect()
    }
}

/// Control-plane sync client.
pub struct ConfigSynchronizer {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl ConfigSynchronizer {
    /// Create a synchronizer for the desired config's sync endpoint.
    pub fn new(desired: &DesiredConfig, retry: RetryPolicy) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(desired.skip_verify_tls())
            .build()
            .map_err(SyncError::Client)?;

        Ok(Self {
            client,
            url: desired.endpoints().sync_url.clone(),
            retry,
        })
    }

    /// Fetch desired flags and apply them through the change-detecting setters.
    pub async fn sync(&self, desired: &DesiredConfig) -> Result<(), SyncError> {
        info!(url = %self.url, "Starting config sync");

        let identity = desired.identity();
        let mut delays = self.retry.delays().into_iter();
        let mut attempt = 0u32;

        let response = loop {
            attempt += 1;
            let result = self
                .client
                .get(&self.url)
                .header(AUTH_KEY_HEADER, &identity.auth_secret)
                .header(AGGREGATOR_NAME_HEADER, &identity.name)
                .send()
                .await;

            let retry_after = match result {
                Ok(response) if response.status().is_success() => break response,
                Ok(response) if response.status().is_server_error() => {
                    let status = response.status();
                    match delays.next() {
                        Some(delay) => {
                            warn!(attempt, status = %status, "Server error during config sync, retrying");
                            delay
                        }
                        None => {
                            error!(attempts = attempt, status = %status, "Config sync failed after all retries");
                            return Err(SyncError::ServerError {
                                status: status.as_u16(),
                                attempts: attempt,
                            });
                        }
                    }
                }
                Ok(response) => {
                    let status = response.status();
                    error!(status = %status, "Config sync returned non-retriable status");
                    return Err(SyncError::Rejected(status.as_u16()));
                }
                Err(e) => match delays.next() {
                    Some(delay) => {
                        warn!(attempt, error = %e, "Failed to fetch config, retrying");
                        delay
                    }
                    None => {
                        error!(attempts = attempt, error = %e, "Failed to fetch config after retries");
                        return Err(SyncError::Transport {
                            attempts: attempt,
                            source: e,
                        });
                    }
                },
            };

            debug!(delay_ms = retry_after.as_millis() as u64, "Backing off before retry");
            tokio::time::sleep(retry_after).await;
        };

        let body: ConfigResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to decode config response");
            SyncError::Decode(e)
        })?;

        desired.apply(&body.config, UpdateSource::PeriodicSync);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_double() {
        assert_eq!(
            RetryPolicy::default().delays(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn test_envelope_decoding() {
        let body: ConfigResponse = serde_json::from_str(
            r#"{"config":{"name":"agg","syslogEnabled":false,"logstashEnabled":true}}"#,
        )
        .unwrap();
        assert!(body.config.logstash_enabled);
        assert!(!body.config.syslog_enabled);
    }
}
