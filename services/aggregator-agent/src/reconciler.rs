//! Reconciliation task for desired flag changes.
//!
//! The reconciler:
//! - Drains the intent queue filled by the desired-config setters
//! - Applies each intent serially through the service controller
//! - Stops on shutdown, dropping any intents still queued

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::controller::ServiceController;
use crate::desired::ReconcileIntent;

/// Serial consumer of reconciliation intents.
pub struct Reconciler {
    controller: Arc<ServiceController>,
    intents: mpsc::UnboundedReceiver<ReconcileIntent>,
}

impl Reconciler {
    pub fn new(controller: Arc<ServiceController>, intents: mpsc::UnboundedReceiver<ReconcileIntent>) -> Self {
        Self { controller, intents }
    }

    /// Run until shutdown or until every intent sender is gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting reconciler");

        loop {
            tokio::select! {
                intent = self.intents.recv() => {
                    let Some(intent) = intent else {
                        debug!("Intent queue closed");
                        break;
                    };
                    debug!(
                        service = %intent.service,
                        enabled = intent.enabled,
                        source = %intent.source,
                        "Reconciling flag change"
                    );
                    self.controller
                        .reconcile_on_flag_change(intent.service, intent.enabled)
                        .await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::desired::tests::test_config;
    use crate::desired::{DesiredConfig, UpdateSource};
    use crate::process::{MockProcessManager, ProcessCall};
    use crate::render::TemplateRenderer;
    use crate::service::ManagedService;

    #[tokio::test]
    async fn test_flag_flip_triggers_exactly_one_reconcile() {
        let (desired, rx) = DesiredConfig::new(&test_config());
        let desired = Arc::new(desired);
        let mock = Arc::new(MockProcessManager::new());
        let controller = Arc::new(ServiceController::new(
            Arc::clone(&desired),
            mock.clone(),
            Arc::new(TemplateRenderer::new()),
            "tpotce_nw",
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Reconciler::new(controller, rx).run(shutdown_rx));

        desired.set_syslog_enabled(true, UpdateSource::LiveChannel);
        desired.set_syslog_enabled(true, UpdateSource::PeriodicSync);
        desired.set_syslog_enabled(true, UpdateSource::LiveChannel);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !mock.calls().contains(&ProcessCall::Start(ManagedService::SyslogCollector)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let starts = mock
            .calls()
            .into_iter()
            .filter(|c| *c == ProcessCall::Start(ManagedService::SyslogCollector))
            .count();
        assert_eq!(starts, 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
