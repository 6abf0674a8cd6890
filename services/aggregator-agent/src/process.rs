//! Process manager interface and implementations.
//!
//! The process manager abstracts managed-service lifecycle operations:
//! - Starting, stopping and force-removing services
//! - Liveness and log queries for health checks
//! - Installing the generated per-service configuration
//!
//! [`ComposeProcessManager`] shells out to `docker compose` against a rendered
//! manifest in a temporary directory. [`MockProcessManager`] is provided for
//! testing and development.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::service::ManagedService;

/// Managed-service lifecycle interface.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Start the service in the background.
    async fn start(&self, service: ManagedService) -> Result<(), ProcessError>;

    /// Stop and remove the service.
    async fn stop(&self, service: ManagedService) -> Result<(), ProcessError>;

    /// Remove the service's container regardless of state. Absent is not an error.
    async fn force_remove(&self, service: ManagedService) -> Result<(), ProcessError>;

    /// Whether the service is running. Query failures count as not running.
    async fn is_running(&self, service: ManagedService) -> bool;

    /// Last `lines` lines of the service's log output.
    async fn tail_logs(&self, service: ManagedService, lines: usize) -> Result<String, ProcessError>;

    /// Whether the named external network exists.
    async fn dependency_exists(&self, name: &str) -> bool;

    /// Write the generated configuration for a service.
    async fn install_config(&self, service: ManagedService, text: &str) -> Result<(), ProcessError>;

    /// Delete the generated configuration for a service.
    async fn remove_config(&self, service: ManagedService) -> Result<(), ProcessError>;

    /// Remove leftover networks created for the manifest.
    async fn prune_networks(&self) {}

    /// Release transient resources such as the rendered manifest.
    fn cleanup(&self) {}
}

/// Classify a process-manager status string.
///
/// Running iff the status starts with `up`, case-insensitive.
pub fn status_is_running(status: &str) -> bool {
    status
        .trim_start()
        .get(..2)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("up"))
}

// =============================================================================
// docker compose
// =============================================================================

const COMPOSE_TEMPLATE: &str = include_str!("../assets/docker-compose.yml");
const LOGSTASH_YML: &str = include_str!("../assets/logstash.yml");
const COMPOSE_FILE: &str = "docker-compose.yml";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Process manager backed by `docker compose`.
pub struct ComposeProcessManager {
    docker: String,
    project: String,
    root: PathBuf,
    workdir: Mutex<Option<TempDir>>,
}

impl ComposeProcessManager {
    /// Render the manifest into a fresh temporary directory.
    pub fn new(project: &str, logship_network: &str) -> Result<Self, ProcessError> {
        let workdir = tempfile::Builder::new().prefix("aggregator-").tempdir()?;
        let root = workdir.path().to_path_buf();

        let logstash_yml = root.join("logstash.yml");
        std::fs::write(&logstash_yml, LOGSTASH_YML)?;

        let manifest = render_manifest(&root, logship_network);
        std::fs::write(root.join(COMPOSE_FILE), manifest)?;

        info!(path = %root.display(), project, "Rendered compose manifest");

        Ok(Self {
            docker: "docker".to_string(),
            project: project.to_string(),
            root,
            workdir: Mutex::new(Some(workdir)),
        })
    }

    /// Directory holding the manifest and generated configs.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn config_path(&self, service: ManagedService) -> PathBuf {
        self.root.join(service.config_file_name())
    }

    fn compose_args<'a>(&'a self, compose_file: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["compose", "-p", self.project.as_str(), "-f", compose_file];
        args.extend_from_slice(rest);
        args
    }

    async fn run(&self, args: &[&str]) -> Result<String, ProcessError> {
        let command = format!("{} {}", self.docker, args.join(" "));
        debug!(command = %command, "Running process manager command");

        let mut cmd = Command::new(&self.docker);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, format!("`{command}` timed out"))
            })??;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(ProcessError::CommandFailed {
                command,
                status: output.status.to_string(),
                output: text.trim().to_string(),
            });
        }
        Ok(text)
    }
}

fn render_manifest(root: &Path, logship_network: &str) -> String {
    COMPOSE_TEMPLATE
        .replace(
            "{{SYSLOG_CONFIG}}",
            &root.join(ManagedService::SyslogCollector.config_file_name()).display().to_string(),
        )
        .replace(
            "{{LOGSTASH_CONFIG}}",
            &root.join(ManagedService::LogShipper.config_file_name()).display().to_string(),
        )
        .replace("{{LOGSTASH_YML}}", &root.join("logstash.yml").display().to_string())
        .replace("{{LOGSHIP_NETWORK}}", logship_network)
}

#[async_trait]
impl ProcessManager for ComposeProcessManager {
    async fn start(&self, service: ManagedService) -> Result<(), ProcessError> {
        let compose_file = self.root.join(COMPOSE_FILE).display().to_string();
        info!(service = %service, compose_file = %compose_file, "Starting service");

        let output = self
            .run(&self.compose_args(&compose_file, &["up", "-d", service.container_name()]))
            .await?;
        if !output.trim().is_empty() {
            debug!(service = %service, output = %output.trim(), "compose output");
        }
        Ok(())
    }

    async fn stop(&self, service: ManagedService) -> Result<(), ProcessError> {
        let compose_file = self.root.join(COMPOSE_FILE).display().to_string();
        info!(service = %service, "Stopping service");

        self.run(&self.compose_args(&compose_file, &["down", service.container_name()]))
            .await?;
        Ok(())
    }

    async fn force_remove(&self, service: ManagedService) -> Result<(), ProcessError> {
        match self.run(&["rm", "-f", service.container_name()]).await {
            Ok(_) => Ok(()),
            Err(ProcessError::CommandFailed { output, .. }) if output.contains("No such container") => {
                debug!(service = %service, "Nothing to remove");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn is_running(&self, service: ManagedService) -> bool {
        let filter = format!("name=^{}$", service.container_name());
        match self.run(&["ps", "-f", &filter, "--format", "{{.Status}}"]).await {
            Ok(status) => status_is_running(status.trim()),
            Err(e) => {
                warn!(service = %service, error = %e, "Status query failed");
                false
            }
        }
    }

    async fn tail_logs(&self, service: ManagedService, lines: usize) -> Result<String, ProcessError> {
        let lines = lines.to_string();
        self.run(&["logs", "--tail", &lines, service.container_name()])
            .await
    }

    async fn dependency_exists(&self, name: &str) -> bool {
        self.run(&["network", "inspect", name]).await.is_ok()
    }

    async fn install_config(&self, service: ManagedService, text: &str) -> Result<(), ProcessError> {
        let path = self.config_path(service);
        tokio::fs::write(&path, text).await?;
        info!(service = %service, path = %path.display(), "Wrote service config");
        Ok(())
    }

    async fn remove_config(&self, service: ManagedService) -> Result<(), ProcessError> {
        let path = self.config_path(service);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(service = %service, path = %path.display(), "Deleted service config");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn prune_networks(&self) {
        let names = match self.run(&["network", "ls", "--format", "{{.Name}}"]).await {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "Failed to list networks");
                return;
            }
        };

        for name in names
            .lines()
            .map(str::trim)
            .filter(|n| n.starts_with(self.project.as_str()) && n.ends_with("_default"))
        {
            match self.run(&["network", "rm", name]).await {
                Ok(_) => info!(network = %name, "Removed temporary network"),
                Err(e) => warn!(network = %name, error = %e, "Failed to remove network"),
            }
        }
    }

    fn cleanup(&self) {
        let workdir = self
            .workdir
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(dir) = workdir {
            let path = dir.path().display().to_string();
            match dir.close() {
                Ok(()) => info!(path = %path, "Removed manifest directory"),
                Err(e) => warn!(path = %path, error = %e, "Failed to remove manifest directory"),
            }
        }
    }
}

// =============================================================================
// Mock
// =============================================================================

/// A call recorded by [`MockProcessManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessCall {
    Start(ManagedService),
    Stop(ManagedService),
    ForceRemove(ManagedService),
    IsRunning(ManagedService),
    TailLogs(ManagedService),
    DependencyExists(String),
    InstallConfig(ManagedService),
    RemoveConfig(ManagedService),
    PruneNetworks,
    Cleanup,
}

#[derive(Debug, Default)]
struct MockState {
    running: HashSet<ManagedService>,
    logs: HashMap<ManagedService, String>,
    configs: HashMap<ManagedService, String>,
    missing_dependencies: HashSet<String>,
    unreadable_logs: HashSet<ManagedService>,
    fail_starts: bool,
    calls: Vec<ProcessCall>,
}

/// In-memory process manager for testing and development.
///
/// `start` marks a service running, `stop` and `force_remove` mark it stopped.
#[derive(Debug, Default)]
pub struct MockProcessManager {
    state: Mutex<MockState>,
}

impl MockProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock whose starts all fail.
    pub fn failing() -> Self {
        let mock = Self::default();
        mock.lock().fail_starts = true;
        mock
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_running(&self, service: ManagedService, running: bool) {
        let mut state = self.lock();
        if running {
            state.running.insert(service);
        } else {
            state.running.remove(&service);
        }
    }

    pub fn set_logs(&self, service: ManagedService, logs: &str) {
        self.lock().logs.insert(service, logs.to_string());
    }

    /// Make log queries for `service` fail.
    pub fn set_logs_unavailable(&self, service: ManagedService) {
        self.lock().unreadable_logs.insert(service);
    }

    pub fn set_dependency_missing(&self, name: &str) {
        self.lock().missing_dependencies.insert(name.to_string());
    }

    pub fn config(&self, service: ManagedService) -> Option<String> {
        self.lock().configs.get(&service).cloned()
    }

    pub fn calls(&self) -> Vec<ProcessCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Lifecycle calls only, without status and log queries.
    pub fn actions(&self) -> Vec<ProcessCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, ProcessCall::IsRunning(_) | ProcessCall::TailLogs(_)))
            .collect()
    }
}

#[async_trait]
impl ProcessManager for MockProcessManager {
    async fn start(&self, service: ManagedService) -> Result<(), ProcessError> {
        let mut state = self.lock();
        state.calls.push(ProcessCall::Start(service));
        if state.fail_starts {
            return Err(ProcessError::CommandFailed {
                command: format!("mock start {service}"),
                status: "exit status: 1".to_string(),
                output: "mock process manager configured to fail".to_string(),
            });
        }
        state.running.insert(service);
        Ok(())
    }

    async fn stop(&self, service: ManagedService) -> Result<(), ProcessError> {
        let mut state = self.lock();
        state.calls.push(ProcessCall::Stop(service));
        state.running.remove(&service);
        Ok(())
    }

    async fn force_remove(&self, service: ManagedService) -> Result<(), ProcessError> {
        let mut state = self.lock();
        state.calls.push(ProcessCall::ForceRemove(service));
        state.running.remove(&service);
        Ok(())
    }

    async fn is_running(&self, service: ManagedService) -> bool {
        let mut state = self.lock();
        state.calls.push(ProcessCall::IsRunning(service));
        state.running.contains(&service)
    }

    async fn tail_logs(&self, service: ManagedService, _lines: usize) -> Result<String, ProcessError> {
        let mut state = self.lock();
        state.calls.push(ProcessCall::TailLogs(service));
        if state.unreadable_logs.contains(&service) {
            return Err(ProcessError::CommandFailed {
                command: format!("mock logs {service}"),
                status: "exit status: 1".to_string(),
                output: "Error response from daemon: mock log query failure".to_string(),
            });
        }
        Ok(state.logs.get(&service).cloned().unwrap_or_default())
    }

    async fn dependency_exists(&self, name: &str) -> bool {
        let mut state = self.lock();
        state.calls.push(ProcessCall::DependencyExists(name.to_string()));
        !state.missing_dependencies.contains(name)
    }

    async fn install_config(&self, service: ManagedService, text: &str) -> Result<(), ProcessError> {
        let mut state = self.lock();
        state.calls.push(ProcessCall::InstallConfig(service));
        state.configs.insert(service, text.to_string());
        Ok(())
    }

    async fn remove_config(&self, service: ManagedService) -> Result<(), ProcessError> {
        let mut state = self.lock();
        state.calls.push(ProcessCall::RemoveConfig(service));
        state.configs.remove(&service);
        Ok(())
    }

    async fn prune_networks(&self) {
        self.lock().calls.push(ProcessCall::PruneNetworks);
    }

    fn cleanup(&self) {
        self.lock().calls.push(ProcessCall::Cleanup);
    }
}
