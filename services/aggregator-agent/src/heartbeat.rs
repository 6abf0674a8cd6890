//! Heartbeat reporting to the uptime monitor.
//!
//! A heartbeat is only sent when every desired service was observed running
//! and healthy in the same tick. Missing heartbeats are how the monitor
//! detects a degraded node, so sending never fails loudly.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::desired::ServiceFlags;
use crate::health::HealthReport;
use crate::sync::{AGGREGATOR_NAME_HEADER, AUTH_KEY_HEADER};

/// Heartbeat payload.
#[derive(Debug, Serialize)]
pub struct HeartbeatRequest<'a> {
    pub identifier: &'a str,
    pub aggregator_name: &'a str,
    pub timestamp: DateTime<Utc>,
}

/// Decide whether this tick may emit a heartbeat.
///
/// True iff every enabled service appears in the report as running and healthy.
pub fn should_send_heartbeat(flags: &ServiceFlags, report: &HealthReport) -> bool {
    flags
        .enabled()
        .into_iter()
        .all(|service| report.get(service).is_some_and(|h| h.is_ok()))
}

/// Fire-and-forget heartbeat sender.
pub struct HeartbeatReporter {
    client: reqwest::Client,
}

impl HeartbeatReporter {
    pub fn new(skip_verify_tls: bool) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(skip_verify_tls)
            .build()?;
        Ok(Self { client })
    }

    /// Send one heartbeat. Returns whether the endpoint acknowledged it.
    pub async fn send_heartbeat(&self, name: &str, secret: &str, heartbeat_id: &str, url: &str) -> bool {
        if url.is_empty() {
            debug!("Heartbeat URL not configured, skipping");
            return false;
        }

        let request = HeartbeatRequest {
            identifier: heartbeat_id,
            aggregator_name: name,
            timestamp: Utc::now(),
        };

        let result = self
            .client
            .post(url)
            .header(AUTH_KEY_HEADER, secret)
            .header(AGGREGATOR_NAME_HEADER, name)
            .json(&request)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!(heartbeat_id, "Heartbeat sent");
                true
            }
            Ok(response) => {
                warn!(heartbeat_id, status = %response.status(), "Heartbeat rejected");
                false
            }
            Err(e) => {
                warn!(heartbeat_id, error = %e, "Heartbeat failed");
                false
            }
        }
    }
}
