//! Agent core: wires the components and drives the long-running loops.
//!
//! ```text
//! Agent
//! ├── LiveUpdateChannel   (push updates, reconnects on drop)
//! ├── sync loop           (hourly pull, first run at startup)
//! ├── monitor loop        (health -> restarts -> heartbeat, every minute)
//! └── Reconciler          (serial consumer of flag-change intents)
//! ```
//!
//! All loops share one `watch` shutdown channel. On a termination signal, or
//! when any loop exits on its own, the agent flips the channel, joins the
//! loops within a grace period, then stops every managed service and
//! releases the process manager's transient resources.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelSettings, LiveUpdateChannel};
use crate::config::Config;
use crate::controller::ServiceController;
use crate::desired::{DesiredConfig, ReconcileIntent};
use crate::health::HealthMonitor;
use crate::heartbeat::{should_send_heartbeat, HeartbeatReporter};
use crate::process::ProcessManager;
use crate::reconciler::Reconciler;
use crate::render::ConfigRenderer;
use crate::sync::{ConfigSynchronizer, RetryPolicy};

/// Loop timing.
#[derive(Debug, Clone, Copy)]
pub struct AgentSettings {
    /// Periodic sync interval.
    pub sync_interval: Duration,

    /// Health monitor interval.
    pub monitor_interval: Duration,

    /// How long loops get to finish after shutdown is signalled.
    pub shutdown_grace: Duration,

    pub channel: ChannelSettings,

    pub retry: RetryPolicy,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            channel: ChannelSettings::with_keepalive(config.keepalive_period),
            ..Self::default()
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(3600),
            monitor_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            channel: ChannelSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// The aggregator node agent.
pub struct Agent {
    components: Arc<Components>,
    intents: mpsc::UnboundedReceiver<ReconcileIntent>,
}

/// State shared by the loops.
struct Components {
    desired: Arc<DesiredConfig>,
    controller: Arc<ServiceController>,
    process: Arc<dyn ProcessManager>,
    health: HealthMonitor,
    heartbeat: HeartbeatReporter,
    synchronizer: ConfigSynchronizer,
    channel: Arc<LiveUpdateChannel>,
    settings: AgentSettings,
}

impl Agent {
    pub fn new(
        config: &Config,
        process: Arc<dyn ProcessManager>,
        renderer: Arc<dyn ConfigRenderer>,
    ) -> Result<Self> {
        Self::with_settings(config, process, renderer, AgentSettings::from_config(config))
    }

    pub fn with_settings(
        config: &Config,
        process: Arc<dyn ProcessManager>,
        renderer: Arc<dyn ConfigRenderer>,
        settings: AgentSettings,
    ) -> Result<Self> {
        let (desired, intents) = DesiredConfig::new(config);
        let desired = Arc::new(desired);

        let controller = Arc::new(ServiceController::new(
            Arc::clone(&desired),
            Arc::clone(&process),
            renderer,
            config.logship_network.clone(),
        ));
        let synchronizer = ConfigSynchronizer::new(&desired, settings.retry)
            .context("failed to build sync client")?;
        let heartbeat = HeartbeatReporter::new(config.skip_verify_tls)
            .context("failed to build heartbeat client")?;
        let channel = Arc::new(LiveUpdateChannel::new(Arc::clone(&desired), settings.channel));

        let components = Components {
            health: HealthMonitor::new(Arc::clone(&process)),
            desired,
            controller,
            process,
            heartbeat,
            synchronizer,
            channel,
            settings,
        };

        Ok(Self {
            components: Arc::new(components),
            intents,
        })
    }

    pub fn desired(&self) -> &Arc<DesiredConfig> {
        &self.components.desired
    }

    pub fn controller(&self) -> &Arc<ServiceController> {
        &self.components.controller
    }

    pub fn channel(&self) -> &Arc<LiveUpdateChannel> {
        &self.components.channel
    }

    /// One monitor pass: health check, restart decisions, heartbeat gate.
    ///
    /// Returns whether a heartbeat was sent. Never call concurrently with
    /// itself; the monitor loop runs it one tick at a time.
    pub async fn monitor_tick(&self) -> bool {
        self.components.monitor_tick().await
    }

    /// Run until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `signal` resolves or a loop exits on its own.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Agent {
            components: agent,
            intents,
        } = self;

        info!(
            aggregator = %agent.desired.identity().name,
            url = %agent.channel.url(),
            "Starting aggregator agent"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: JoinSet<&'static str> = JoinSet::new();

        tasks.spawn({
            let reconciler = Reconciler::new(Arc::clone(&agent.controller), intents);
            let shutdown_rx = shutdown_rx.clone();
            async move {
                reconciler.run(shutdown_rx).await;
                "reconciler"
            }
        });
        tasks.spawn({
            let channel = Arc::clone(&agent.channel);
            let shutdown_rx = shutdown_rx.clone();
            async move {
                channel.run(shutdown_rx).await;
                "live-channel"
            }
        });
        tasks.spawn(sync_loop(Arc::clone(&agent), shutdown_rx.clone()));
        tasks.spawn(monitor_loop(Arc::clone(&agent), shutdown_rx));

        tokio::pin!(signal);
        let outcome = tokio::select! {
            _ = &mut signal => {
                info!("Received shutdown signal");
                Ok(())
            }
            exited = tasks.join_next() => {
                match exited {
                    Some(Ok(name)) => error!(task = name, "Loop exited unexpectedly"),
                    Some(Err(e)) => error!(error = %e, "Loop task panicked"),
                    None => error!("No loops running"),
                }
                Err(anyhow!("agent loop exited unexpectedly"))
            }
        };

        let _ = shutdown_tx.send(true);

        info!("Waiting for loops to shut down...");
        let joined = tokio::time::timeout(agent.settings.shutdown_grace, async {
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(name) => debug!(task = name, "Loop stopped"),
                    Err(e) => warn!(error = %e, "Loop task failed during shutdown"),
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!("Loops did not stop within grace period, aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        agent.shutdown().await;
        outcome
    }
}

impl Components {
    async fn monitor_tick(&self) -> bool {
        let flags = self.desired.flags();
        let report = self.health.check(&flags.enabled()).await;
        let now = std::time::Instant::now();

        for (service, health) in report.iter() {
            let decision = self.controller.reconcile_unhealthy(service, health, now).await;
            debug!(service = %service, decision = ?decision, "Monitor decision");
        }

        if !should_send_heartbeat(&flags, &report) {
            warn!("Not all enabled services are healthy, skipping heartbeat");
            return false;
        }

        let identity = self.desired.identity();
        let endpoints = self.desired.endpoints();
        self.heartbeat
            .send_heartbeat(
                &identity.name,
                &identity.auth_secret,
                &endpoints.heartbeat_id,
                &endpoints.heartbeat_url,
            )
            .await
    }

    /// Stop managed services and release transient resources.
    async fn shutdown(&self) {
        info!("Stopping managed services");
        self.controller.stop_all().await;
        self.process.prune_networks().await;
        self.process.cleanup();
        info!("Aggregator agent shutdown complete");
    }
}

async fn sync_loop(agent: Arc<Components>, mut shutdown: watch::Receiver<bool>) -> &'static str {
    // First tick fires immediately: the bootstrap sync.
    let mut ticker = tokio::time::interval(agent.settings.sync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        tokio::select! {
            result = agent.synchronizer.sync(&agent.desired) => {
                if let Err(e) = result {
                    warn!(error = %e, "Config sync failed, retrying next interval");
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    info!("Sync loop shutting down");
    "sync"
}

async fn monitor_loop(agent: Arc<Components>, mut shutdown: watch::Receiver<bool>) -> &'static str {
    let period = agent.settings.monitor_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                agent.monitor_tick().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Monitor loop shutting down");
    "monitor"
}

/// Resolve on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::tests::test_config;
    use crate::desired::UpdateSource;
    use crate::error::ProcessError;
    use crate::process::{MockProcessManager, ProcessCall, ProcessManager};
    use async_trait::async_trait;
    use crate::render::TemplateRenderer;
    use crate::service::ManagedService;

    fn fast_settings() -> AgentSettings {
        AgentSettings {
            sync_interval: Duration::from_secs(3600),
            monitor_interval: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(2),
            channel: ChannelSettings {
                dial_timeout: Duration::from_millis(200),
                reconnect_delay: Duration::from_millis(50),
                ..ChannelSettings::default()
            },
            retry: RetryPolicy {
                max_retries: 0,
                initial_backoff: Duration::from_millis(1),
            },
        }
    }

    /// Mock whose status query panics, taking the monitor loop down with it.
    struct PanickingStatus(Arc<MockProcessManager>);

    #[async_trait]
    impl ProcessManager for PanickingStatus {
        async fn start(&self, service: ManagedService) -> Result<(), ProcessError> {
            self.0.start(service).await
        }

        async fn stop(&self, service: ManagedService) -> Result<(), ProcessError> {
            self.0.stop(service).await
        }

        async fn force_remove(&self, service: ManagedService) -> Result<(), ProcessError> {
            self.0.force_remove(service).await
        }

        async fn is_running(&self, service: ManagedService) -> bool {
            panic!("status query for {service} failed");
        }

        async fn tail_logs(&self, service: ManagedService, lines: usize) -> Result<String, ProcessError> {
            self.0.tail_logs(service, lines).await
        }

        async fn dependency_exists(&self, name: &str) -> bool {
            self.0.dependency_exists(name).await
        }

        async fn install_config(&self, service: ManagedService, text: &str) -> Result<(), ProcessError> {
            self.0.install_config(service, text).await
        }

        async fn remove_config(&self, service: ManagedService) -> Result<(), ProcessError> {
            self.0.remove_config(service).await
        }

        async fn prune_networks(&self) {
            self.0.prune_networks().await
        }

        fn cleanup(&self) {
            self.0.cleanup()
        }
    }

    fn agent(mock: Arc<MockProcessManager>) -> Agent {
        Agent::with_settings(&test_config(), mock, Arc::new(TemplateRenderer::new()), fast_settings())
            .unwrap()
    }

    #[tokio::test]
    async fn test_monitor_tick_without_services_skips_process_calls() {
        let mock = Arc::new(MockProcessManager::new());
        let agent = agent(mock.clone());

        // Gate passes, but no heartbeat URL is configured.
        assert!(!agent.monitor_tick().await);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_tick_restarts_stopped_service() {
        let mock = Arc::new(MockProcessManager::new());
        let agent = agent(mock.clone());
        agent
            .desired()
            .set_syslog_enabled(true, UpdateSource::PeriodicSync);

        assert!(!agent.monitor_tick().await);
        assert!(mock
            .actions()
            .contains(&ProcessCall::Start(ManagedService::SyslogCollector)));
    }

    #[tokio::test]
    async fn test_run_until_cleans_up_on_signal() {
        let mock = Arc::new(MockProcessManager::new());
        let agent = agent(mock.clone());

        agent
            .run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();

        let calls = mock.calls();
        assert!(calls.contains(&ProcessCall::Stop(ManagedService::SyslogCollector)));
        assert!(calls.contains(&ProcessCall::Stop(ManagedService::LogShipper)));
        assert!(calls.contains(&ProcessCall::PruneNetworks));
        assert!(calls.contains(&ProcessCall::Cleanup));
    }

    #[tokio::test]
    async fn test_run_until_cleans_up_when_loop_dies() {
        let mock = Arc::new(MockProcessManager::new());
        let settings = AgentSettings {
            monitor_interval: Duration::from_millis(20),
            ..fast_settings()
        };
        let agent = Agent::with_settings(
            &test_config(),
            Arc::new(PanickingStatus(mock.clone())),
            Arc::new(TemplateRenderer::new()),
            settings,
        )
        .unwrap();
        agent
            .desired()
            .set_syslog_enabled(true, UpdateSource::PeriodicSync);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            agent.run_until(std::future::pending()),
        )
        .await
        .expect("agent should stop after the monitor loop dies");
        assert!(result.is_err());

        let calls = mock.calls();
        assert!(calls.contains(&ProcessCall::Stop(ManagedService::SyslogCollector)));
        assert!(calls.contains(&ProcessCall::Stop(ManagedService::LogShipper)));
        assert!(calls.contains(&ProcessCall::PruneNetworks));
        assert!(calls.contains(&ProcessCall::Cleanup));
    }
}
